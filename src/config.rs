//! Configuration module for pingwarden.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "pingwarden.db")
    pub db_path: String,
    /// Per-probe timeout in milliseconds (default: 1000)
    pub ping_timeout_ms: u64,
    /// Seconds between rollup aggregation passes (default: 30)
    pub rollup_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "pingwarden.db".to_string(),
            ping_timeout_ms: 1000,
            rollup_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PINGWARDEN_HTTP_PORT`: HTTP port (default: 8080)
    /// - `PINGWARDEN_DB_PATH`: Database file path (default: "pingwarden.db")
    /// - `PINGWARDEN_PING_TIMEOUT_MS`: probe timeout (default: 1000)
    /// - `PINGWARDEN_ROLLUP_INTERVAL_SECS`: rollup cadence (default: 30)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port_str) = env::var("PINGWARDEN_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.http_port = port;
            }
        }

        if let Ok(db_path) = env::var("PINGWARDEN_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Ok(timeout_str) = env::var("PINGWARDEN_PING_TIMEOUT_MS") {
            if let Ok(timeout) = timeout_str.parse() {
                cfg.ping_timeout_ms = timeout;
            }
        }

        if let Ok(interval_str) = env::var("PINGWARDEN_ROLLUP_INTERVAL_SECS") {
            if let Ok(interval) = interval_str.parse() {
                cfg.rollup_interval_secs = interval;
            }
        }

        cfg
    }
}
