//! Probe module for network monitoring.
//!
//! Supports HTTP, TCP and SSL certificate probes. Every probe folds its
//! errors into a failed [`ProbeOutcome`]; nothing is propagated to the
//! scheduler.

mod http;
mod ssl;
mod tcp;

pub use http::*;
pub use ssl::*;
pub use tcp::*;

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::db::{Monitor, MonitorKind};

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("HTTP {0}")]
    Status(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// The result of a single probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub success: bool,
    pub latency_ms: Option<i64>,
    pub diagnostic: Option<String>,
}

impl ProbeOutcome {
    pub fn up(latency_ms: i64, diagnostic: Option<String>) -> Self {
        Self {
            success: true,
            latency_ms: Some(latency_ms),
            diagnostic,
        }
    }

    pub fn down(diagnostic: impl Into<String>) -> Self {
        Self {
            success: false,
            latency_ms: None,
            diagnostic: Some(diagnostic.into()),
        }
    }
}

/// Per-protocol probe timeouts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeTimeouts {
    pub http: Duration,
    pub tcp: Duration,
    pub ssl: Duration,
}

impl Default for ProbeTimeouts {
    fn default() -> Self {
        Self {
            http: Duration::from_secs(10),
            tcp: Duration::from_secs(5),
            ssl: Duration::from_secs(5),
        }
    }
}

impl ProbeTimeouts {
    pub fn for_kind(&self, kind: MonitorKind) -> Duration {
        match kind {
            MonitorKind::Http => self.http,
            MonitorKind::Tcp => self.tcp,
            MonitorKind::Ssl => self.ssl,
        }
    }
}

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = ProbeOutcome> + Send + 'a>>;

/// Something that can check a monitor's target.
pub trait Prober: Send + Sync {
    fn probe<'a>(&'a self, monitor: &'a Monitor) -> ProbeFuture<'a>;
}

/// Prober that talks to the real network.
pub struct NetworkProber {
    timeouts: ProbeTimeouts,
    http: HttpProbe,
    ssl: SslProbe,
}

impl NetworkProber {
    pub fn new(timeouts: ProbeTimeouts) -> Result<Self, ProbeError> {
        Ok(Self {
            timeouts,
            http: HttpProbe::new(timeouts.http)?,
            ssl: SslProbe::new(timeouts.ssl),
        })
    }

    async fn dispatch(&self, monitor: &Monitor) -> Result<Option<String>, ProbeError> {
        match monitor.kind {
            MonitorKind::Http => self.http.check(&monitor.target).await,
            MonitorKind::Tcp => {
                let (host, target_port) = split_target(&monitor.target)?;
                let port = monitor
                    .port
                    .or(target_port)
                    .ok_or_else(|| ProbeError::Config("tcp monitor has no port".to_string()))?;
                run_tcp_probe(&host, port, self.timeouts.tcp).await
            }
            MonitorKind::Ssl => {
                let (host, target_port) = split_target(&monitor.target)?;
                let port = monitor.port.or(target_port).unwrap_or(DEFAULT_TLS_PORT);
                self.ssl.check(&host, port).await
            }
        }
    }
}

impl Prober for NetworkProber {
    fn probe<'a>(&'a self, monitor: &'a Monitor) -> ProbeFuture<'a> {
        Box::pin(async move {
            // Add jitter to avoid thundering herd
            let jitter = rand::random::<u64>() % 100;
            tokio::time::sleep(Duration::from_millis(jitter)).await;

            let timeout = self.timeouts.for_kind(monitor.kind);
            let start = Instant::now();

            // Each probe enforces its own timeout; this is the backstop.
            let result = match tokio::time::timeout(timeout + Duration::from_secs(1), self.dispatch(monitor)).await {
                Ok(r) => r,
                Err(_) => Err(ProbeError::Timeout(timeout)),
            };

            match result {
                Ok(diagnostic) => ProbeOutcome::up(start.elapsed().as_millis() as i64, diagnostic),
                Err(e) => {
                    tracing::debug!(monitor_id = monitor.id, "Probe failed for {}: {}", monitor.name, e);
                    ProbeOutcome::down(e.to_string())
                }
            }
        })
    }
}

/// Split a tcp/ssl target into host and optional port.
///
/// Accepts bare hosts (`db.internal`), `host:port`, and URLs
/// (`https://example.com:8443/path`).
pub fn split_target(target: &str) -> Result<(String, Option<u16>), ProbeError> {
    let target = target.trim();
    let url = if target.contains("://") {
        reqwest::Url::parse(target)
    } else {
        reqwest::Url::parse(&format!("tcp://{}", target))
    }
    .map_err(|e| ProbeError::Config(format!("invalid target {}: {}", target, e)))?;

    let host = url
        .host_str()
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    if host.is_empty() {
        return Err(ProbeError::Config(format!("target {} has no host", target)));
    }

    let port = if url.scheme() == "tcp" {
        url.port()
    } else {
        url.port_or_known_default()
    };
    Ok((host, port))
}
