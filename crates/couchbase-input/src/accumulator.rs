//! Destinations for gathered metrics and errors
//!
//! The collector never holds on to a record: every metric and every
//! per-server error is handed to an [`Accumulator`] as soon as it exists.
//! Implementations must accept calls from many gather tasks at once.

use crate::client::ClientError;
use crate::models::{Fields, Metric, Tags};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

/// Failure to gather one server
#[derive(Debug, Error)]
#[error("couchbase server {server}: {source}")]
pub struct GatherError {
    /// Server address with any embedded credentials removed
    pub server: String,
    #[source]
    pub source: ClientError,
}

/// Receives metrics and non-fatal errors from a gather cycle
pub trait Accumulator: Send + Sync {
    /// Emit one metric record
    fn add_fields(&self, measurement: &str, fields: Fields, tags: Tags);

    /// Report a per-server failure
    fn add_error(&self, error: GatherError);
}

/// Keeps everything in memory until drained
#[derive(Debug, Default)]
pub struct MetricBuffer {
    metrics: Mutex<Vec<Metric>>,
    errors: Mutex<Vec<GatherError>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MetricBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the buffered metrics
    pub fn metrics(&self) -> Vec<Metric> {
        lock(&self.metrics).clone()
    }

    /// Buffered metrics with the given measurement name
    pub fn metrics_named(&self, measurement: &str) -> Vec<Metric> {
        lock(&self.metrics)
            .iter()
            .filter(|m| m.measurement == measurement)
            .cloned()
            .collect()
    }

    /// Rendered messages of the buffered errors
    pub fn errors(&self) -> Vec<String> {
        lock(&self.errors).iter().map(|e| e.to_string()).collect()
    }

    pub fn error_count(&self) -> usize {
        lock(&self.errors).len()
    }

    /// Take all buffered metrics and errors, leaving the buffer empty
    pub fn drain(&self) -> (Vec<Metric>, Vec<GatherError>) {
        let metrics = std::mem::take(&mut *lock(&self.metrics));
        let errors = std::mem::take(&mut *lock(&self.errors));
        (metrics, errors)
    }
}

impl Accumulator for MetricBuffer {
    fn add_fields(&self, measurement: &str, fields: Fields, tags: Tags) {
        lock(&self.metrics).push(Metric::now(measurement, fields, tags));
    }

    fn add_error(&self, error: GatherError) {
        lock(&self.errors).push(error);
    }
}

/// Forwards metrics into a channel and logs errors
pub struct ChannelAccumulator {
    tx: mpsc::Sender<Metric>,
    dropped: AtomicU64,
    errors: AtomicU64,
}

impl ChannelAccumulator {
    pub fn new(tx: mpsc::Sender<Metric>) -> Self {
        Self {
            tx,
            dropped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Metrics discarded because the channel was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Errors reported so far
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

impl Accumulator for ChannelAccumulator {
    fn add_fields(&self, measurement: &str, fields: Fields, tags: Tags) {
        if let Err(e) = self.tx.try_send(Metric::now(measurement, fields, tags)) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(measurement = %measurement, error = %e, "Dropping metric");
        }
    }

    fn add_error(&self, error: GatherError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        warn!(server = %error.server, error = %error.source, "Error in couchbase input");
    }
}
