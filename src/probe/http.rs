//! HTTP probe implementation.

use reqwest::redirect::Policy;
use std::time::Duration;

use super::ProbeError;

/// Redirects followed before the probe gives up.
pub const MAX_REDIRECTS: usize = 5;

/// Reusable HTTP prober with a shared connection pool.
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    /// GET the address and read the full body.
    ///
    /// Any final status in [200, 400) is up; everything else is an error
    /// carrying the status line or the transport error.
    pub async fn check(&self, address: &str) -> Result<Option<String>, ProbeError> {
        let url = normalize_url(address);

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(self.timeout)
            } else {
                ProbeError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !is_up_status(status.as_u16()) {
            return Err(ProbeError::Status(status.to_string()));
        }

        // Read the full body to measure complete transfer time
        let _body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(self.timeout)
            } else {
                ProbeError::Network(e.to_string())
            }
        })?;

        Ok(None)
    }
}

/// Whether an HTTP status code counts as reachable.
pub fn is_up_status(code: u16) -> bool {
    (200..400).contains(&code)
}

fn normalize_url(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, response::Redirect, routing::get, Router};
    use std::net::SocketAddr;

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn test_router() -> Router {
        Router::new()
            .route("/ok", get(|| async { "fine" }))
            .route("/moved", get(|| async { Redirect::to("/ok") }))
            .route("/loop", get(|| async { Redirect::to("/loop") }))
            .route("/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    "late"
                }),
            )
    }

    #[test]
    fn test_is_up_status() {
        assert!(is_up_status(200));
        assert!(is_up_status(204));
        assert!(is_up_status(301));
        assert!(is_up_status(399));
        assert!(!is_up_status(199));
        assert!(!is_up_status(400));
        assert!(!is_up_status(404));
        assert!(!is_up_status(503));
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("example.com"), "http://example.com");
        assert_eq!(normalize_url("https://example.com"), "https://example.com");
    }

    #[tokio::test]
    async fn test_http_probe_statuses() {
        let addr = serve(test_router()).await;
        let probe = HttpProbe::new(Duration::from_secs(2)).unwrap();

        assert!(probe.check(&format!("http://{}/ok", addr)).await.is_ok());
        assert!(probe.check(&format!("{}/ok", addr)).await.is_ok());
        assert!(probe.check(&format!("http://{}/moved", addr)).await.is_ok());

        let err = probe.check(&format!("http://{}/broken", addr)).await.unwrap_err();
        assert_eq!(err.to_string(), "HTTP 500 Internal Server Error");

        let err = probe.check(&format!("http://{}/missing", addr)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Status(_)));

        let err = probe.check(&format!("http://{}/loop", addr)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Network(_)));
    }

    #[tokio::test]
    async fn test_http_probe_timeout() {
        let addr = serve(test_router()).await;
        let probe = HttpProbe::new(Duration::from_millis(200)).unwrap();

        let err = probe.check(&format!("http://{}/slow", addr)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_http_probe_invalid_url() {
        let probe = HttpProbe::new(Duration::from_millis(100)).unwrap();
        let result = probe.check("http://256.256.256.256").await;
        assert!(result.is_err());
    }
}
