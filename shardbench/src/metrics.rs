//! Model of the DropWizard metrics document served by shard nodes.
//!
//! Only the `timers` section is interpreted. Every field of a timer is optional, so documents
//! from other reporter versions still parse.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The document returned by the metrics endpoint.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct MetricsDocument {
    /// Timers keyed by their fully-qualified operation name.
    #[serde(default)]
    pub timers: BTreeMap<String, TimerSnapshot>,
}

impl MetricsDocument {
    /// Parses a metrics document from a JSON body.
    pub fn from_slice(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }

    /// Looks up a timer by its fully-qualified name.
    pub fn timer(&self, name: &str) -> Option<&TimerSnapshot> {
        self.timers.get(name)
    }
}

/// A snapshot of a single timer.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct TimerSnapshot {
    /// Number of recorded calls.
    pub count: Option<u64>,
    /// Fastest call.
    pub min: Option<f64>,
    /// Slowest call.
    pub max: Option<f64>,
    /// Mean duration.
    pub mean: Option<f64>,
    /// Standard deviation of durations.
    pub stddev: Option<f64>,
    /// Median duration.
    pub p50: Option<f64>,
    /// 75th percentile duration.
    pub p75: Option<f64>,
    /// 95th percentile duration.
    pub p95: Option<f64>,
    /// 98th percentile duration.
    pub p98: Option<f64>,
    /// 99th percentile duration.
    pub p99: Option<f64>,
    /// 99.9th percentile duration.
    pub p999: Option<f64>,
    /// Mean call rate since start.
    pub mean_rate: Option<f64>,
    /// One-minute moving call rate.
    pub m1_rate: Option<f64>,
    /// Five-minute moving call rate.
    pub m5_rate: Option<f64>,
    /// Fifteen-minute moving call rate.
    pub m15_rate: Option<f64>,
    /// Unit of all duration fields, e.g. `seconds` or `milliseconds`.
    pub duration_units: Option<String>,
    /// Unit of all rate fields, e.g. `calls/second`.
    pub rate_units: Option<String>,
}

impl TimerSnapshot {
    /// Returns the percentile fields present in this snapshot, from lowest to highest.
    pub fn percentiles(&self) -> Vec<(&'static str, f64)> {
        [
            ("p50", self.p50),
            ("p75", self.p75),
            ("p95", self.p95),
            ("p98", self.p98),
            ("p99", self.p99),
            ("p999", self.p999),
        ]
        .into_iter()
        .filter_map(|(name, value)| Some((name, value?)))
        .collect()
    }

    /// Unit of the duration fields, `seconds` if the document does not say.
    pub fn duration_units(&self) -> &str {
        self.duration_units.as_deref().unwrap_or("seconds")
    }
}
