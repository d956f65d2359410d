//! TCP connect probe.

use std::time::Duration;
use tokio::net::TcpStream;

use super::ProbeError;

/// Succeeds iff a TCP connection to `host:port` completes within `timeout`.
pub async fn run_tcp_probe(host: &str, port: u16, timeout: Duration) -> Result<Option<String>, ProbeError> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => Ok(None),
        Ok(Err(e)) => Err(ProbeError::Network(format!(
            "connection to {}:{} failed: {}",
            host, port, e
        ))),
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = run_tcp_probe("127.0.0.1", port, Duration::from_secs(1)).await;
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn test_tcp_probe_closed_port() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = run_tcp_probe("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains(&format!("127.0.0.1:{}", port)));
    }

    #[tokio::test]
    async fn test_tcp_probe_unresolvable_host() {
        let result = run_tcp_probe("no-such-host.invalid", 80, Duration::from_secs(2)).await;
        assert!(result.is_err());
    }
}
