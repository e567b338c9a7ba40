//! ICMP echo probe with native sockets and a `ping` command fallback.
//!
//! Native mode uses blocking sockets in spawn_blocking for precise timing
//! and reads the reply TTL to estimate the hop count.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{PingOutcome, Probe, ProbeError};

/// ICMP capability state, detected once per process.
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available.
    Native,
    /// Only the `ping` command fallback is available.
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Echo sequence counter so concurrent pings to the same destination can
/// be told apart.
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn generate_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    // RAW requires CAP_NET_RAW or root; DGRAM works unprivileged on Linux
    // with ping_group_range set, and on macOS.
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("ping probe: using native ICMP (RAW socket)");
        return IcmpCapability::Native;
    }
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("ping probe: using native ICMP (DGRAM socket)");
        return IcmpCapability::Native;
    }
    tracing::info!("ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// ICMP reachability probe with a fixed per-probe timeout.
pub struct IcmpProbe {
    timeout: Duration,
}

impl IcmpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Probe for IcmpProbe {
    async fn ping(&self, address: &str) -> Result<PingOutcome, ProbeError> {
        // Small jitter so many loops sharing a frequency don't fire in step.
        let jitter = rand::random::<u64>() % 50;
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        match run_ping_probe(address, self.timeout).await {
            Ok(outcome) => Ok(outcome),
            Err(ProbeError::Timeout(_)) => Ok(PingOutcome::unreachable()),
            Err(e) => Err(e),
        }
    }
}

/// Run one echo round-trip against the address.
pub async fn run_ping_probe(address: &str, timeout: Duration) -> Result<PingOutcome, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        let ip: IpAddr = address
            .parse()
            .map_err(|e| ProbeError::Network(format!("invalid address {}: {}", address, e)))?;
        let addr_str = address.to_string();

        // Blocking sockets in a dedicated thread keep the timing honest.
        let result = tokio::task::spawn_blocking(move || run_blocking_ping(ip, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Ok(outcome) => return Ok(outcome),
            Err(ProbeError::Network(msg))
                if msg.contains("Permission") || msg.contains("denied") =>
            {
                tracing::warn!(
                    "native ping for {} hit a permission error, falling back to command: {}",
                    addr_str,
                    msg
                );
                return run_ping_command(&addr_str, timeout).await;
            }
            Err(e) => return Err(e),
        }
    }

    run_ping_command(address, timeout).await
}

fn run_blocking_ping(ip: IpAddr, timeout: Duration) -> Result<PingOutcome, ProbeError> {
    let (domain, protocol, echo_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, 8u8, 0u8),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, 128u8, 129u8),
    };

    let socket = Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| ProbeError::Network(format!("failed to create ICMP socket: {}", e)))?;

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let (identifier, sequence) = generate_ping_id();
    let packet = build_echo_request(echo_type, identifier, sequence, ip.is_ipv4());

    let start = Instant::now();
    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("failed to send: {}", e))
        }
    })?;

    // Keep reading until our reply shows up or the timeout passes. Other
    // ICMP traffic can land on RAW sockets.
    loop {
        let mut buf: [MaybeUninit<u8>; 1500] = unsafe { MaybeUninit::uninit().assume_init() };
        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut
            {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("failed to receive: {}", e))
            }
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        if len < 8 {
            continue;
        }

        // RAW IPv4 sockets hand back the IP header; DGRAM sockets do not.
        let has_ip_header = ip.is_ipv4() && buf[0] >> 4 == 4 && len >= 28;
        let icmp_offset = if has_ip_header { 20 } else { 0 };
        if len < icmp_offset + 8 {
            continue;
        }

        let ttl = if has_ip_header { Some(buf[8]) } else { None };
        let reply = buf[icmp_offset];
        let reply_id = u16::from_be_bytes([buf[icmp_offset + 4], buf[icmp_offset + 5]]);
        let reply_seq = u16::from_be_bytes([buf[icmp_offset + 6], buf[icmp_offset + 7]]);

        if reply == reply_type && reply_id == identifier && reply_seq == sequence {
            return Ok(PingOutcome {
                latency_ms: Some(elapsed.as_secs_f64() * 1000.0),
                hops: ttl.map(estimate_hops),
                lost: false,
            });
        }
    }
}

/// Estimate the path length from the TTL left in the reply.
///
/// Senders start at 64, 128 or 255; each router decrements by one.
fn estimate_hops(reply_ttl: u8) -> i64 {
    let initial: i64 = if reply_ttl <= 64 {
        64
    } else if reply_ttl <= 128 {
        128
    } else {
        255
    };
    initial - reply_ttl as i64 + 1
}

/// Build an ICMP/ICMPv6 Echo Request packet.
fn build_echo_request(echo_type: u8, identifier: u16, sequence: u16, checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = echo_type;
    packet[1] = 0; // code
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    // The kernel fills in the ICMPv6 checksum; IPv4 is on us.
    if checksum {
        let sum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;

    while i < data.len() - 1 {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Run ping via command execution (fallback).
async fn run_ping_command(address: &str, timeout: Duration) -> Result<PingOutcome, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), address])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("timeout")
            || stdout.contains("100% packet loss")
            || stdout.contains("100.0% packet loss")
        {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!("ping failed: {}", stdout)));
    }

    parse_ping_output(&stdout, timeout)
}

/// Parse `ping` output for latency and reply TTL.
fn parse_ping_output(output: &str, timeout: Duration) -> Result<PingOutcome, ProbeError> {
    static RE_TIME: OnceLock<Regex> = OnceLock::new();
    let re_time = RE_TIME.get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").unwrap());

    static RE_TTL: OnceLock<Regex> = OnceLock::new();
    let re_ttl = RE_TTL.get_or_init(|| Regex::new(r"ttl=(?P<ttl>\d+)").unwrap());

    let latency_ms = re_time
        .captures(output)
        .and_then(|caps| caps.name("val"))
        .and_then(|m| m.as_str().parse::<f64>().ok());

    let Some(latency_ms) = latency_ms else {
        // A successful exit with no per-packet time means the reply never
        // arrived within the deadline.
        return Err(ProbeError::Timeout(timeout));
    };

    let hops = re_ttl
        .captures(output)
        .and_then(|caps| caps.name("ttl"))
        .and_then(|m| m.as_str().parse::<u8>().ok())
        .map(estimate_hops);

    Ok(PingOutcome {
        latency_ms: Some(latency_ms),
        hops,
        lost: false,
    })
}
