//! Database model types.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::probe::split_target;

/// Protocol used to probe a monitor's target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorKind {
    Http,
    Tcp,
    Ssl,
}

impl MonitorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorKind::Http => "http",
            MonitorKind::Tcp => "tcp",
            MonitorKind::Ssl => "ssl",
        }
    }
}

impl fmt::Display for MonitorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MonitorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(MonitorKind::Http),
            "tcp" => Ok(MonitorKind::Tcp),
            "ssl" => Ok(MonitorKind::Ssl),
            other => Err(format!("unknown monitor kind: {}", other)),
        }
    }
}

/// A monitored endpoint, as written by the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Monitor {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    /// URL for http monitors, host (optionally URL-shaped) for tcp and ssl.
    pub target: String,
    pub kind: MonitorKind,
    pub port: Option<u16>,
    pub interval_seconds: u32,
    pub webhook_url: Option<String>,
    pub active: bool,
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            id: 0,
            owner_id: 0,
            name: String::new(),
            target: String::new(),
            kind: MonitorKind::Http,
            port: None,
            interval_seconds: 300,
            webhook_url: None,
            active: true,
        }
    }
}

impl Monitor {
    /// Check that the definition can be scheduled.
    pub fn validate(&self) -> Result<(), String> {
        if self.target.trim().is_empty() {
            return Err("target cannot be empty".to_string());
        }
        if self.interval_seconds == 0 {
            return Err("interval must be at least one second".to_string());
        }
        if self.kind != MonitorKind::Http {
            let (_, target_port) = split_target(&self.target).map_err(|e| e.to_string())?;
            let port = self.port.or(target_port);
            if self.kind == MonitorKind::Tcp && port.is_none() {
                return Err("tcp monitors require a port".to_string());
            }
            if port == Some(0) {
                return Err("port 0 is not a valid probe port".to_string());
            }
        }
        if self.port == Some(0) {
            return Err("port 0 is not a valid probe port".to_string());
        }
        if let Some(url) = &self.webhook_url {
            if reqwest::Url::parse(url).is_err() {
                return Err(format!("invalid webhook url: {}", url));
            }
        }
        Ok(())
    }
}

/// The outcome of one probe against one monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub monitor_id: i64,
    pub success: bool,
    pub latency_ms: Option<i64>,
    pub diagnostic: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// The authoritative per-monitor status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentStatus {
    pub monitor_id: i64,
    pub is_up: bool,
    pub status_since: DateTime<Utc>,
    pub last_check_at: DateTime<Utc>,
    pub last_latency_ms: Option<i64>,
    pub last_diagnostic: Option<String>,
    pub checks_today: i64,
    pub successful_checks_today: i64,
    pub today_uptime_pct: f64,
}

/// An outage that has been observed but not yet confirmed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingOutage {
    pub monitor_id: i64,
    pub started_at: DateTime<Utc>,
    pub diagnostic: Option<String>,
}

/// A confirmed period of downtime. `ended_at` is `None` while ongoing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Incident {
    pub id: i64,
    pub monitor_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub diagnostic: Option<String>,
    pub duration_seconds: Option<i64>,
}

impl Incident {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Archived uptime percentage for one monitor and one day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyUptime {
    pub monitor_id: i64,
    pub date: NaiveDate,
    pub uptime_pct: f64,
}

/// Aggregated check-log statistics over a time window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorStats {
    pub checks: i64,
    pub successes: i64,
    pub avg_latency_ms: Option<f64>,
    pub min_latency_ms: Option<i64>,
    pub max_latency_ms: Option<i64>,
    pub uptime_pct: Option<f64>,
}
