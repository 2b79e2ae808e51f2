//! Couchbase Agent - Couchbase cluster statistics collector
//!
//! Gathers node, bucket and optional per-bucket-per-node statistics from
//! one or many clusters and writes them to stdout as metrics.

use anyhow::{Context, Result};
use clap::Parser;
use couchbase_input::{
    collector::GatherLoopBuilder, output, Accumulator, CouchbaseInput, Input, Metric, MetricBuffer,
    OutputFormat, StructuredLogger,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Couchbase metrics agent
#[derive(Parser)]
#[command(name = "couchbase-agent")]
#[command(author, version, long_about = None)]
#[command(about = "Collects Couchbase cluster statistics as metrics")]
struct Cli {
    /// Path to a configuration file
    #[arg(long, short, env = "COUCHBASE_AGENT_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Gather once, print the metrics and exit
    #[arg(long)]
    once: bool,

    /// Output format (overrides the configuration file)
    #[arg(long, short, value_enum)]
    format: Option<OutputFormat>,

    /// Print an example configuration and exit
    #[arg(long)]
    sample_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout carries only metrics
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();

    if cli.sample_config {
        print!("{}", config::sample_config());
        return Ok(());
    }

    let config = config::AgentConfig::load(cli.config.as_deref())?;
    let format = cli.format.unwrap_or(config.format);

    let input = Arc::new(
        CouchbaseInput::from_config(config.input_config())
            .context("Failed to create couchbase input")?,
    );

    let logger = StructuredLogger::new(input.name());
    logger.log_startup(AGENT_VERSION, input.servers(), config.bucket_node_stats.len());

    if cli.once {
        gather_once(&input, &logger, format).await?;
        return Ok(());
    }

    let (gather_loop, metrics_rx) = GatherLoopBuilder::new()
        .input(input)
        .interval(config.gather_config().interval)
        .jitter(config.gather_config().jitter)
        .buffer_size(config.buffer_size)
        .build()?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let writer_handle = tokio::spawn(write_metrics(metrics_rx, format));
    let loop_handle = tokio::spawn(gather_loop.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    let _ = shutdown_tx.send(());

    loop_handle.await?;
    writer_handle.await?;
    info!("Shutdown complete");

    Ok(())
}

/// Run a single gather cycle and print its metrics
async fn gather_once(
    input: &Arc<CouchbaseInput>,
    logger: &StructuredLogger,
    format: OutputFormat,
) -> Result<()> {
    let start = Instant::now();
    let buffer = Arc::new(MetricBuffer::new());
    let acc: Arc<dyn Accumulator> = buffer.clone();
    input.gather(acc).await?;

    let (metrics, errors) = buffer.drain();
    for error in &errors {
        logger.log_gather_error(&error.server, &error.source.to_string());
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for metric in &metrics {
        if let Some(line) = output::encode(metric, format) {
            writeln!(out, "{}", line).context("Failed to write metrics")?;
        }
    }
    out.flush().context("Failed to write metrics")?;

    logger.log_gather_complete(metrics.len(), errors.len(), start.elapsed().as_millis());
    Ok(())
}

/// Write metrics from the gather loop to stdout until the channel closes
async fn write_metrics(mut rx: mpsc::Receiver<Metric>, format: OutputFormat) {
    let stdout = std::io::stdout();

    while let Some(metric) = rx.recv().await {
        let Some(line) = output::encode(&metric, format) else {
            continue;
        };

        let mut out = stdout.lock();
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            warn!(error = %e, "Failed to write metric, stopping output");
            break;
        }
    }
}
