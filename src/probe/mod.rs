//! Probe module for reachability checks.
//!
//! Ships an ICMP echo probe with a `ping` command fallback, plus an
//! on-demand traceroute runner.

mod ping;
mod trace;

pub use ping::*;
pub use trace::*;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// Result of one reachability check.
///
/// `latency_ms` and `lost` are independent fields, but a lost probe
/// carries no latency.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingOutcome {
    pub latency_ms: Option<f64>,
    pub hops: Option<i64>,
    pub lost: bool,
}

impl PingOutcome {
    /// Outcome for a probe that got no reply.
    pub fn unreachable() -> Self {
        Self {
            latency_ms: None,
            hops: None,
            lost: true,
        }
    }
}

/// One reachability check against an address.
///
/// Implementations enforce their own timeout and must not block
/// indefinitely. A clean timeout is reported as `lost: true`, not as an
/// error; errors are reserved for unexpected local failures.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn ping(&self, address: &str) -> Result<PingOutcome, ProbeError>;
}
