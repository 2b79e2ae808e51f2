//! Couchbase input library
//!
//! This crate provides the pieces of the Couchbase metrics agent:
//! - Cluster client for topology (REST) and detailed stats (memcached)
//! - Node, bucket and bucket-per-node statistics collection
//! - Accumulators and a periodic gather loop
//! - Line protocol and JSON output

pub mod accumulator;
pub mod client;
pub mod collector;
pub mod models;
pub mod observability;
pub mod output;

pub use accumulator::{Accumulator, ChannelAccumulator, GatherError, MetricBuffer};
pub use client::{ClientConfig, ClientError, ClusterClient, ClusterConnector, HttpConnector};
pub use collector::{CouchbaseConfig, CouchbaseInput, GatherConfig, GatherLoop, Input};
pub use models::*;
pub use observability::StructuredLogger;
pub use output::OutputFormat;
