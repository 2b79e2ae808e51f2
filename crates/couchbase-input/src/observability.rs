//! Structured lifecycle logging for the agent
//!
//! Every event carries an `event` field so JSON log consumers can filter
//! on it without parsing messages.

use tracing::{info, warn};

/// Structured logger for agent events
#[derive(Clone)]
pub struct StructuredLogger {
    input: String,
}

impl StructuredLogger {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, servers: &[String], detailed_stats: usize) {
        info!(
            event = "agent_started",
            input = %self.input,
            agent_version = %version,
            servers = ?servers,
            detailed_stats = detailed_stats,
            "Couchbase agent started"
        );
    }

    /// Log the outcome of a one-shot gather
    pub fn log_gather_complete(&self, metrics: usize, errors: usize, elapsed_ms: u128) {
        if errors == 0 {
            info!(
                event = "gather_complete",
                input = %self.input,
                metrics = metrics,
                elapsed_ms = elapsed_ms,
                "Gather complete"
            );
        } else {
            warn!(
                event = "gather_complete",
                input = %self.input,
                metrics = metrics,
                errors = errors,
                elapsed_ms = elapsed_ms,
                "Gather complete with errors"
            );
        }
    }

    /// Log a per-server gather error
    pub fn log_gather_error(&self, server: &str, error: &str) {
        warn!(
            event = "gather_error",
            input = %self.input,
            server = %server,
            error = %error,
            "Error in couchbase input"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            input = %self.input,
            reason = %reason,
            "Couchbase agent shutting down"
        );
    }
}
