//! On-demand path diagnostics via the system traceroute binary.

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("traceroute unavailable: {0}")]
    Unavailable(String),
    #[error("traceroute failed: {0}")]
    Failed(String),
    #[error("traceroute timed out after {0:?}")]
    Timeout(Duration),
}

/// One hop along the probed path.
#[derive(Debug, Clone, Serialize)]
pub struct TraceHop {
    pub hop: i64,
    pub host: Option<String>,
    pub ip: Option<String>,
    pub rtt_ms: Option<f64>,
    pub is_timeout: bool,
    pub raw: String,
}

/// Full result of one traceroute run. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct TraceReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub hops: Vec<TraceHop>,
}

/// Run traceroute against an address and parse the hop list.
pub async fn run_traceroute(
    address: &str,
    max_hops: u32,
    timeout: Duration,
) -> Result<TraceReport, TraceError> {
    let started_at = Utc::now();

    let child = Command::new("traceroute")
        .args(["-m", &max_hops.to_string(), "-q", "1", address])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| TraceError::Timeout(timeout))?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TraceError::Unavailable("traceroute binary not found".to_string())
            } else {
                TraceError::Failed(format!("failed to execute traceroute: {}", e))
            }
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TraceError::Failed(format!(
            "traceroute exited with {}: {}",
            output.status, stderr
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let hops = parse_traceroute_output(&stdout);

    let finished_at = Utc::now();
    let duration_ms = (finished_at - started_at).num_microseconds().unwrap_or(0) as f64 / 1000.0;

    Ok(TraceReport {
        started_at,
        finished_at,
        duration_ms,
        hops,
    })
}

/// Parse traceroute output lines into hops.
///
/// Handles the common line shapes:
/// ` 1  router.local (192.168.0.1)  1.234 ms`
/// ` 2  192.0.2.1  3.456 ms`
/// ` 3  * * *`
fn parse_traceroute_output(output: &str) -> Vec<TraceHop> {
    static RE_HOP: OnceLock<Regex> = OnceLock::new();
    let re_hop = RE_HOP.get_or_init(|| Regex::new(r"^\s*(?P<hop>\d+)\s+(?P<rest>.*)$").unwrap());

    static RE_HOST_IP: OnceLock<Regex> = OnceLock::new();
    let re_host_ip = RE_HOST_IP
        .get_or_init(|| Regex::new(r"^(?P<host>\S+)\s+\((?P<ip>[0-9a-fA-F.:]+)\)").unwrap());

    static RE_RTT: OnceLock<Regex> = OnceLock::new();
    let re_rtt = RE_RTT.get_or_init(|| Regex::new(r"(?P<rtt>[0-9.]+)\s*ms").unwrap());

    let mut hops = Vec::new();

    for line in output.lines() {
        let Some(caps) = re_hop.captures(line) else {
            continue;
        };
        let Ok(hop) = caps["hop"].parse::<i64>() else {
            continue;
        };
        let rest = caps["rest"].trim();

        if rest.chars().all(|c| c == '*' || c.is_whitespace()) {
            hops.push(TraceHop {
                hop,
                host: None,
                ip: None,
                rtt_ms: None,
                is_timeout: true,
                raw: line.to_string(),
            });
            continue;
        }

        let (host, ip) = if let Some(hc) = re_host_ip.captures(rest) {
            (Some(hc["host"].to_string()), Some(hc["ip"].to_string()))
        } else {
            // Numeric-only output: the first token is the address itself.
            let first = rest.split_whitespace().next().map(|s| s.to_string());
            (first.clone(), first)
        };

        let rtt_ms = re_rtt
            .captures(rest)
            .and_then(|rc| rc["rtt"].parse::<f64>().ok());

        hops.push(TraceHop {
            hop,
            host,
            ip,
            rtt_ms,
            is_timeout: false,
            raw: line.to_string(),
        });
    }

    hops
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_named_hops() {
        let output = "traceroute to 8.8.8.8 (8.8.8.8), 20 hops max\n \
             1  gateway.local (192.168.0.1)  1.234 ms\n \
             2  203.0.113.9  4.5 ms\n \
             3  * * *\n \
             4  dns.google (8.8.8.8)  11.9 ms\n";
        let hops = parse_traceroute_output(output);
        assert_eq!(hops.len(), 4);

        assert_eq!(hops[0].hop, 1);
        assert_eq!(hops[0].host.as_deref(), Some("gateway.local"));
        assert_eq!(hops[0].ip.as_deref(), Some("192.168.0.1"));
        assert!((hops[0].rtt_ms.unwrap() - 1.234).abs() < 1e-9);

        assert_eq!(hops[1].ip.as_deref(), Some("203.0.113.9"));

        assert!(hops[2].is_timeout);
        assert!(hops[2].rtt_ms.is_none());

        assert_eq!(hops[3].hop, 4);
        assert_eq!(hops[3].ip.as_deref(), Some("8.8.8.8"));
    }

    #[test]
    fn test_parse_skips_header_lines() {
        let output = "traceroute to example.com (93.184.216.34), 30 hops max, 60 byte packets\n";
        assert!(parse_traceroute_output(output).is_empty());
    }
}
