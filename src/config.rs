//! Configuration module for Uptrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::monitor::DEFAULT_CONFIRMATION_WINDOW_SECS;
use crate::probe::ProbeTimeouts;

/// Longest accepted retention, in days.
pub const MAX_RETENTION_DAYS: u64 = 36_500;

/// Longest accepted confirmation window, in seconds.
pub const MAX_CONFIRMATION_SECS: u64 = 86_400;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the control API (default: 3000)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "uptrail.db")
    pub db_path: String,
    pub probe_timeouts: ProbeTimeouts,
    /// Continuous failure needed before an outage is confirmed (default: 120s)
    pub confirmation_window: Duration,
    /// Pause between stop and start on restart (default: 1s)
    pub restart_settle: Duration,
    /// Bound on start/stop/restart requests (default: 30s)
    pub control_timeout: Duration,
    pub webhook_timeout: Duration,
    pub check_log_retention_days: i64,
    pub daily_uptime_retention_days: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 3000,
            db_path: "uptrail.db".to_string(),
            probe_timeouts: ProbeTimeouts::default(),
            confirmation_window: Duration::from_secs(DEFAULT_CONFIRMATION_WINDOW_SECS as u64),
            restart_settle: Duration::from_millis(1000),
            control_timeout: Duration::from_secs(30),
            webhook_timeout: Duration::from_secs(10),
            check_log_retention_days: 30,
            daily_uptime_retention_days: 90,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `UPTRAIL_HTTP_PORT`: control API port (default: 3000)
    /// - `UPTRAIL_DB_PATH`: database file path (default: "uptrail.db")
    /// - `UPTRAIL_HTTP_TIMEOUT_MS`, `UPTRAIL_TCP_TIMEOUT_MS`,
    ///   `UPTRAIL_SSL_TIMEOUT_MS`: probe timeouts (default: 10000/5000/5000)
    /// - `UPTRAIL_CONFIRMATION_SECS`: confirmation window (default: 120)
    /// - `UPTRAIL_RESTART_SETTLE_MS`: restart settle delay (default: 1000)
    /// - `UPTRAIL_CONTROL_TIMEOUT_SECS`: control request bound (default: 30)
    /// - `UPTRAIL_WEBHOOK_TIMEOUT_SECS`: webhook timeout (default: 10)
    /// - `UPTRAIL_CHECK_LOG_RETENTION_DAYS`: check-log retention (default: 30)
    /// - `UPTRAIL_DAILY_UPTIME_RETENTION_DAYS`: daily uptime retention (default: 90)
    ///
    /// Values that do not parse, or exceed their maximum, are ignored.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        let parse = |key: &str| lookup(key).and_then(|v| parse_value::<u64>(key, &v));
        let parse_at_most = |key: &str, max: u64| {
            parse(key).filter(|v| {
                if *v > max {
                    tracing::warn!("Ignoring {} for {}: the maximum is {}", v, key, max);
                }
                *v <= max
            })
        };

        if let Some(port) = lookup("UPTRAIL_HTTP_PORT").and_then(|v| parse_value("UPTRAIL_HTTP_PORT", &v)) {
            cfg.http_port = port;
        }
        if let Some(db_path) = lookup("UPTRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(ms) = parse("UPTRAIL_HTTP_TIMEOUT_MS") {
            cfg.probe_timeouts.http = Duration::from_millis(ms);
        }
        if let Some(ms) = parse("UPTRAIL_TCP_TIMEOUT_MS") {
            cfg.probe_timeouts.tcp = Duration::from_millis(ms);
        }
        if let Some(ms) = parse("UPTRAIL_SSL_TIMEOUT_MS") {
            cfg.probe_timeouts.ssl = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_at_most("UPTRAIL_CONFIRMATION_SECS", MAX_CONFIRMATION_SECS) {
            cfg.confirmation_window = Duration::from_secs(secs);
        }
        if let Some(ms) = parse("UPTRAIL_RESTART_SETTLE_MS") {
            cfg.restart_settle = Duration::from_millis(ms);
        }
        if let Some(secs) = parse("UPTRAIL_CONTROL_TIMEOUT_SECS") {
            cfg.control_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse("UPTRAIL_WEBHOOK_TIMEOUT_SECS") {
            cfg.webhook_timeout = Duration::from_secs(secs);
        }
        if let Some(days) = parse_at_most("UPTRAIL_CHECK_LOG_RETENTION_DAYS", MAX_RETENTION_DAYS) {
            cfg.check_log_retention_days = days as i64;
        }
        if let Some(days) = parse_at_most("UPTRAIL_DAILY_UPTIME_RETENTION_DAYS", MAX_RETENTION_DAYS) {
            cfg.daily_uptime_retention_days = days as i64;
        }

        cfg
    }

    pub fn confirmation_window_chrono(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.confirmation_window.as_secs() as i64)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid value {:?} for {}", value, key);
            None
        }
    }
}
