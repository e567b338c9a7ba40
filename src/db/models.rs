//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A monitored IP target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub ip_address: String,
    /// Seconds between pings, minimum 1.
    pub frequency_secs: i64,
    pub is_active: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            id: 0,
            ip_address: String::new(),
            frequency_secs: 1,
            is_active: true,
            notes: None,
            created_at: Utc::now(),
        }
    }
}

/// One probe result, append-only.
///
/// Invariant: `lost == true` implies `latency_ms` is `None` — a lost
/// probe has no latency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingSample {
    pub time: DateTime<Utc>,
    pub target_id: i64,
    pub latency_ms: Option<f64>,
    pub hops: Option<i64>,
    pub lost: bool,
}

/// Scheduler lifecycle and reachability-transition event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Stop,
    Failure,
    Recovery,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Stop => "stop",
            EventKind::Failure => "failure",
            EventKind::Recovery => "recovery",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(EventKind::Start),
            "stop" => Some(EventKind::Stop),
            "failure" => Some(EventKind::Failure),
            "recovery" => Some(EventKind::Recovery),
            _ => None,
        }
    }
}

/// A recorded event, append-only and ordered by creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub target_id: Option<i64>,
    pub kind: EventKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Pre-aggregated summary of samples over one coarse time bucket.
///
/// Written only by the rollup pipeline; the insights engine reads these
/// to answer large-window queries without touching raw samples.
#[derive(Debug, Clone, Serialize)]
pub struct RollupRow {
    pub bucket: DateTime<Utc>,
    pub target_id: i64,
    pub granularity_secs: i64,
    pub samples: i64,
    pub loss_count: i64,
    pub avg_latency_ms: Option<f64>,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_round_trip() {
        for kind in [
            EventKind::Start,
            EventKind::Stop,
            EventKind::Failure,
            EventKind::Recovery,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("reboot"), None);
    }
}
