//! Metric serialization
//!
//! Metrics are written either as InfluxDB line protocol or as one JSON
//! object per line.

use crate::models::{FieldValue, Metric};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Output format for gathered metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// InfluxDB line protocol (default)
    #[default]
    Line,
    /// JSON, one object per line
    Json,
}

/// Encode a metric in the given format.
///
/// Returns `None` when the metric cannot be represented, which only happens
/// in line protocol for a record without finite fields.
pub fn encode(metric: &Metric, format: OutputFormat) -> Option<String> {
    match format {
        OutputFormat::Line => to_line_protocol(metric),
        OutputFormat::Json => serde_json::to_string(metric).ok(),
    }
}

/// Render a metric as a line protocol entry
pub fn to_line_protocol(metric: &Metric) -> Option<String> {
    let mut fields = String::new();
    for (key, value) in &metric.fields {
        let rendered = match *value {
            FieldValue::Integer(v) => format!("{}i", v),
            FieldValue::Float(v) if v.is_finite() => format!("{}", v),
            FieldValue::Float(_) => continue,
        };
        if !fields.is_empty() {
            fields.push(',');
        }
        let _ = write!(fields, "{}={}", escape_key(key), rendered);
    }

    if fields.is_empty() {
        return None;
    }

    let mut line = escape_measurement(&metric.measurement);
    for (key, value) in &metric.tags {
        // line protocol has no empty tag values
        if value.is_empty() {
            continue;
        }
        let _ = write!(line, ",{}={}", escape_key(key), escape_key(value));
    }
    let _ = write!(line, " {} {}", fields, metric.timestamp);

    Some(line)
}

fn escape_measurement(s: &str) -> String {
    escape(s, &[',', ' '])
}

fn escape_key(s: &str) -> String {
    escape(s, &[',', ' ', '='])
}

fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if special.contains(&c) || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
