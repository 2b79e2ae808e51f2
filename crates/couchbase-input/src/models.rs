//! Core data models for the Couchbase input
//!
//! Two groups of types live here: the metric records handed to an
//! accumulator, and the cluster topology snapshot decoded from the
//! Couchbase REST API.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Measurement for per-node memory statistics
pub const MEASUREMENT_NODE: &str = "couchbase_node";
/// Measurement for per-bucket summary statistics
pub const MEASUREMENT_BUCKET: &str = "couchbase_bucket";
/// Measurement for detailed per-bucket-per-node statistics
pub const MEASUREMENT_BUCKET_NODE: &str = "couchbase_bucket_node";

/// A single numeric field value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
}

impl FieldValue {
    /// Numeric value widened to f64
    pub fn as_f64(&self) -> f64 {
        match *self {
            FieldValue::Integer(v) => v as f64,
            FieldValue::Float(v) => v,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

/// Field set of a metric record
pub type Fields = BTreeMap<String, FieldValue>;

/// Tag set of a metric record
pub type Tags = BTreeMap<String, String>;

/// A metric record as emitted by the collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub measurement: String,
    pub tags: Tags,
    pub fields: Fields,
    /// Unix timestamp in nanoseconds
    pub timestamp: i64,
}

impl Metric {
    /// Build a record stamped with the current time
    pub fn now(measurement: impl Into<String>, fields: Fields, tags: Tags) -> Self {
        Self {
            measurement: measurement.into(),
            tags,
            fields,
            timestamp: chrono::Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_default(),
        }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn field(&self, key: &str) -> Option<FieldValue> {
        self.fields.get(key).copied()
    }
}

/// Cluster topology for one pool, fetched fresh every gather cycle
#[derive(Debug, Clone, Default)]
pub struct Pool {
    pub nodes: Vec<Node>,
    pub bucket_map: BTreeMap<String, Bucket>,
}

/// A server participating in the cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub memory_free: f64,
    #[serde(default)]
    pub memory_total: f64,
    #[serde(default)]
    pub ports: NodePorts,
}

/// Service ports advertised by a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePorts {
    /// Memcached binary protocol data port
    #[serde(default)]
    pub direct: Option<u16>,
}

/// A bucket and its summary statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub name: String,
    #[serde(default)]
    pub basic_stats: BasicStats,
    /// Nodes serving this bucket, populated by a refresh
    #[serde(default)]
    pub nodes: Vec<Node>,
}

/// Summary counters reported in a bucket's `basicStats` object.
///
/// Keys missing from the payload decode to zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BasicStats {
    pub quota_percent_used: f64,
    pub ops_per_sec: f64,
    pub disk_fetches: f64,
    pub item_count: f64,
    pub disk_used: f64,
    pub data_used: f64,
    pub mem_used: f64,
}

impl BasicStats {
    /// Field set for the `couchbase_bucket` measurement
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("quota_percent_used".into(), self.quota_percent_used.into());
        fields.insert("ops_per_sec".into(), self.ops_per_sec.into());
        fields.insert("disk_fetches".into(), self.disk_fetches.into());
        fields.insert("item_count".into(), self.item_count.into());
        fields.insert("disk_used".into(), self.disk_used.into());
        fields.insert("data_used".into(), self.data_used.into());
        fields.insert("mem_used".into(), self.mem_used.into());
        fields
    }
}
