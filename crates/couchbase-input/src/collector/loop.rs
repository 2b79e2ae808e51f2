//! Gather loop
//!
//! Runs an [`Input`] periodically with configurable interval and jitter and
//! forwards every emitted metric into a channel.

use super::Input;
use crate::accumulator::{Accumulator, ChannelAccumulator};
use crate::models::Metric;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for the gather loop
#[derive(Debug, Clone)]
pub struct GatherConfig {
    /// Base gather interval (default: 10 seconds)
    pub interval: Duration,
    /// Maximum jitter to add to interval (default: 1 second)
    pub jitter: Duration,
    /// Channel buffer size for gathered metrics
    pub buffer_size: usize,
}

impl Default for GatherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            jitter: Duration::from_secs(1),
            buffer_size: 1000,
        }
    }
}

/// Periodically gathers one input
pub struct GatherLoop {
    input: Arc<dyn Input>,
    config: GatherConfig,
    acc: Arc<ChannelAccumulator>,
}

impl GatherLoop {
    /// Create a new gather loop and the receiving end of its metrics
    pub fn new(input: Arc<dyn Input>, config: GatherConfig) -> (Self, mpsc::Receiver<Metric>) {
        let (metrics_tx, metrics_rx) = mpsc::channel(config.buffer_size.max(1));

        let gather_loop = Self {
            input,
            config,
            acc: Arc::new(ChannelAccumulator::new(metrics_tx)),
        };

        (gather_loop, metrics_rx)
    }

    /// Run until `shutdown` fires. The metrics channel closes when this returns.
    pub async fn run(self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(
            input = self.input.name(),
            interval_secs = self.config.interval.as_secs(),
            "Starting gather loop"
        );

        let mut ticker = interval(self.next_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = self.gather_once().await;
                    cycles += 1;

                    debug!(
                        cycle = cycles,
                        errors = stats.errors,
                        dropped = stats.dropped,
                        elapsed_ms = stats.elapsed.as_millis(),
                        "Gather cycle complete"
                    );

                    ticker = interval(self.next_interval());
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    // a fresh interval fires immediately; consume that tick
                    ticker.tick().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down gather loop");
                    break;
                }
            }
        }
    }

    /// Run a single gather cycle
    async fn gather_once(&self) -> CycleStats {
        let start = Instant::now();
        let errors_before = self.acc.error_count();
        let dropped_before = self.acc.dropped();

        let acc: Arc<dyn Accumulator> = self.acc.clone();
        if let Err(e) = self.input.gather(acc).await {
            warn!(input = self.input.name(), error = %e, "Gather failed");
        }

        CycleStats {
            elapsed: start.elapsed(),
            errors: self.acc.error_count() - errors_before,
            dropped: self.acc.dropped() - dropped_before,
        }
    }

    /// Interval until the next cycle, with jitter
    fn next_interval(&self) -> Duration {
        let jitter_ms = rand_jitter(self.config.jitter.as_millis() as u64);
        self.config.interval + Duration::from_millis(jitter_ms)
    }
}

/// Results from a gather cycle
#[derive(Debug, Default)]
struct CycleStats {
    elapsed: Duration,
    errors: u64,
    dropped: u64,
}

/// Generate a random jitter value between 0 and max_ms
fn rand_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    now % max_ms
}

/// Builder for the gather loop
pub struct GatherLoopBuilder {
    input: Option<Arc<dyn Input>>,
    config: GatherConfig,
}

impl GatherLoopBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            input: None,
            config: GatherConfig::default(),
        }
    }

    /// Set the input to gather
    pub fn input(mut self, input: Arc<dyn Input>) -> Self {
        self.input = Some(input);
        self
    }

    /// Set the gather interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Set the jitter duration
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.config.jitter = jitter;
        self
    }

    /// Set the buffer size
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    /// Build the gather loop
    pub fn build(self) -> Result<(GatherLoop, mpsc::Receiver<Metric>)> {
        let input = self
            .input
            .ok_or_else(|| anyhow::anyhow!("Input is required"))?;

        if self.config.interval.is_zero() {
            anyhow::bail!("Gather interval must be greater than zero");
        }

        Ok(GatherLoop::new(input, self.config))
    }
}

impl Default for GatherLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
