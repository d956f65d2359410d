//! TLS handshake and certificate probe.
//!
//! The handshake is verified against the platform trust store. Expiry is
//! reported in the diagnostic but never fails the probe on its own: an
//! expired certificate already fails verification.

use chrono::{DateTime, Utc};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::ProbeError;

pub const DEFAULT_TLS_PORT: u16 = 443;

const SECONDS_PER_DAY: i64 = 86_400;

pub struct SslProbe {
    connector: TlsConnector,
    timeout: Duration,
}

impl SslProbe {
    pub fn new(timeout: Duration) -> Self {
        Self::with_roots(native_roots(), timeout)
    }

    pub fn with_roots(roots: RootCertStore, timeout: Duration) -> Self {
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            connector: TlsConnector::from(Arc::new(config)),
            timeout,
        }
    }

    /// Complete a verified handshake with `host:port`.
    ///
    /// Returns the days-until-expiry note for the leaf certificate.
    pub async fn check(&self, host: &str, port: u16) -> Result<Option<String>, ProbeError> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ProbeError::Config(format!("invalid server name {}: {}", host, e)))?;

        let handshake = async {
            let tcp = TcpStream::connect((host, port))
                .await
                .map_err(|e| ProbeError::Network(format!("connection to {}:{} failed: {}", host, port, e)))?;
            let tls = self
                .connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| ProbeError::Tls(e.to_string()))?;

            let (_, session) = tls.get_ref();
            let leaf = session
                .peer_certificates()
                .and_then(|certs| certs.first())
                .ok_or_else(|| ProbeError::Tls("server presented no certificate".to_string()))?;

            Ok::<_, ProbeError>(expiry_note(leaf.as_ref(), Utc::now()))
        };

        tokio::time::timeout(self.timeout, handshake)
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
    }
}

/// Whole days until the certificate's notAfter, rounded down.
pub fn days_until_expiry(der: &[u8], now: DateTime<Utc>) -> Option<i64> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let not_after = cert.validity().not_after.timestamp();
    Some((not_after - now.timestamp()).div_euclid(SECONDS_PER_DAY))
}

fn expiry_note(der: &[u8], now: DateTime<Utc>) -> Option<String> {
    days_until_expiry(der, now).map(|days| format!("SSL certificate expires in {} days", days))
}

fn native_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for e in &loaded.errors {
        tracing::warn!("Failed to load a platform certificate: {}", e);
    }
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    tracing::debug!("Loaded {} platform root certificates ({} ignored)", added, ignored);
    roots
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rcgen::{CertificateParams, KeyPair};
    use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    fn probe(timeout: Duration) -> SslProbe {
        SslProbe::with_roots(RootCertStore::empty(), timeout)
    }

    /// Self-signed certificate for "localhost" expiring at the start of the given day.
    fn localhost_cert(year: i32, month: u8, day: u8) -> (CertificateDer<'static>, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.not_after = rcgen::date_time_ymd(year, month, day);
        let cert = params.self_signed(&key).unwrap();
        (cert.der().clone(), key)
    }

    /// Serve TLS handshakes with `cert` until the test ends.
    async fn serve_tls(cert: CertificateDer<'static>, key: &KeyPair) -> u16 {
        let key_der = PrivatePkcs8KeyDer::from(key.serialize_der()).into();
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key_der)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(mut tls) = acceptor.accept(socket).await {
                        let mut buf = [0u8; 64];
                        let _ = tls.read(&mut buf).await;
                    }
                });
            }
        });
        port
    }

    #[test]
    fn test_days_until_expiry_counts_whole_days() {
        let (der, _) = localhost_cert(2030, 1, 1);

        let now = Utc.with_ymd_and_hms(2029, 12, 22, 12, 0, 0).unwrap();
        assert_eq!(days_until_expiry(&der, now), Some(9));
        assert_eq!(expiry_note(&der, now).as_deref(), Some("SSL certificate expires in 9 days"));

        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(days_until_expiry(&der, now), Some(0));

        let now = Utc.with_ymd_and_hms(2030, 1, 2, 6, 0, 0).unwrap();
        assert_eq!(days_until_expiry(&der, now), Some(-2));
    }

    #[tokio::test]
    async fn test_verified_handshake_reports_expiry() {
        let (der, key) = localhost_cert(2100, 1, 1);
        let expected = days_until_expiry(&der, Utc::now()).unwrap();
        let mut roots = RootCertStore::empty();
        roots.add(der.clone()).unwrap();
        let port = serve_tls(der, &key).await;

        let note = SslProbe::with_roots(roots, Duration::from_secs(2))
            .check("localhost", port)
            .await
            .unwrap()
            .unwrap();
        let days: i64 = note
            .strip_prefix("SSL certificate expires in ")
            .and_then(|rest| rest.strip_suffix(" days"))
            .unwrap()
            .parse()
            .unwrap();
        assert!(days == expected || days == expected - 1, "{}", note);
    }

    #[tokio::test]
    async fn test_untrusted_certificate_fails() {
        let (der, key) = localhost_cert(2100, 1, 1);
        let port = serve_tls(der, &key).await;

        let err = probe(Duration::from_secs(2)).check("localhost", port).await.unwrap_err();
        assert!(matches!(err, ProbeError::Tls(_)));
    }

    #[test]
    fn test_days_until_expiry_rejects_garbage() {
        assert_eq!(days_until_expiry(b"not a certificate", Utc::now()), None);
        assert_eq!(expiry_note(&[], Utc::now()), None);
    }

    #[tokio::test]
    async fn test_ssl_probe_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = probe(Duration::from_secs(1)).check("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, ProbeError::Network(_)));
    }

    #[tokio::test]
    async fn test_ssl_probe_plaintext_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
            }
        });

        let err = probe(Duration::from_secs(2)).check("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, ProbeError::Tls(_) | ProbeError::Network(_)));
    }

    #[tokio::test]
    async fn test_ssl_probe_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let err = probe(Duration::from_millis(200)).check("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, ProbeError::Timeout(_)));
    }
}
