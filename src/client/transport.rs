//! TCP and TLS transports
//!
//! `rtmp://` runs over plain TCP, `rtmps://` over TLS via tokio-rustls.
//! Certificate checks are delegated to a [`CertificateValidator`]; the
//! handshake signatures are still verified by rustls itself.

use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{
    ring, verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

use super::config::{ClientConfig, ParsedUrl};

/// Byte stream the session runs over
pub trait RtmpIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RtmpIo for T {}

/// Decides whether a server certificate chain is acceptable
///
/// `chain` holds DER certificates, end entity first.
pub trait CertificateValidator: Send + Sync + fmt::Debug {
    fn validate(&self, host: &str, chain: &[&[u8]]) -> std::result::Result<(), String>;
}

/// Accepts every certificate. Only for test servers with self-signed certs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAnyCertificate;

impl CertificateValidator for AcceptAnyCertificate {
    fn validate(&self, _host: &str, _chain: &[&[u8]]) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Open the transport described by `config`
pub async fn open(config: &ClientConfig) -> Result<Box<dyn RtmpIo>> {
    let url = config
        .parse_url()
        .ok_or_else(|| Error::Config(format!("Invalid RTMP URL: {}", config.url)))?;

    // Checked before dialing so a bad config never opens a socket
    let validator = match (url.secure, &config.certificate_validator) {
        (true, None) => {
            return Err(Error::Config(
                "rtmps requires a certificate validator".into(),
            ))
        }
        (true, Some(v)) => Some(v.clone()),
        (false, _) => None,
    };

    let addr = format!("{}:{}", url.host, url.port);
    let socket = timeout(config.connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| Error::Timeout)??;

    if config.tcp_nodelay {
        socket.set_nodelay(true)?;
    }

    tracing::debug!(addr = %addr, secure = url.secure, "TCP connected");

    match validator {
        Some(validator) => {
            let tls = timeout(config.connect_timeout, wrap_tls(socket, &url, validator))
                .await
                .map_err(|_| Error::Timeout)??;
            Ok(tls)
        }
        None => Ok(Box::new(socket)),
    }
}

async fn wrap_tls(
    socket: TcpStream,
    url: &ParsedUrl,
    validator: Arc<dyn CertificateValidator>,
) -> Result<Box<dyn RtmpIo>> {
    let provider = ring::default_provider();
    let verifier = ValidatorVerifier {
        host: url.host.clone(),
        validator,
        algorithms: provider.signature_verification_algorithms,
    };

    let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    let name = ServerName::try_from(url.host.clone())
        .map_err(|e| Error::Tls(format!("invalid server name {}: {}", url.host, e)))?;

    let stream = TlsConnector::from(Arc::new(tls_config))
        .connect(name, socket)
        .await
        .map_err(|e| Error::Tls(e.to_string()))?;

    tracing::debug!(host = %url.host, "TLS established");
    Ok(Box::new(stream))
}

/// Bridges a [`CertificateValidator`] into rustls
#[derive(Debug)]
struct ValidatorVerifier {
    host: String,
    validator: Arc<dyn CertificateValidator>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for ValidatorVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let mut chain: Vec<&[u8]> = Vec::with_capacity(1 + intermediates.len());
        chain.push(end_entity.as_ref());
        chain.extend(intermediates.iter().map(|c| c.as_ref()));

        self.validator
            .validate(&self.host, &chain)
            .map(|_| ServerCertVerified::assertion())
            .map_err(|reason| {
                tracing::warn!(host = %self.host, reason = %reason, "Certificate rejected");
                rustls::Error::General(reason)
            })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct RejectAll;

    impl CertificateValidator for RejectAll {
        fn validate(&self, host: &str, _chain: &[&[u8]]) -> std::result::Result<(), String> {
            Err(format!("untrusted {}", host))
        }
    }

    fn verifier(validator: Arc<dyn CertificateValidator>) -> ValidatorVerifier {
        ValidatorVerifier {
            host: "example.com".into(),
            validator,
            algorithms: ring::default_provider().signature_verification_algorithms,
        }
    }

    #[tokio::test]
    async fn test_rtmps_without_validator_is_config_error() {
        let config = ClientConfig::new("rtmps://127.0.0.1:1/app");
        match open(&config).await {
            Err(Error::Config(msg)) => assert!(msg.contains("validator")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("should not connect"),
        }
    }

    #[tokio::test]
    async fn test_invalid_url_is_config_error() {
        let config = ClientConfig::new("http://example.com/app");
        assert!(matches!(open(&config).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_plain_tcp_connects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let config = ClientConfig::new(format!("rtmp://127.0.0.1:{}/app", port));
        assert!(open(&config).await.is_ok());
        accept.await.unwrap().unwrap();
    }

    #[test]
    fn test_verifier_delegates_to_validator() {
        let cert = CertificateDer::from(vec![1u8, 2, 3]);
        let name = ServerName::try_from("example.com").unwrap();

        let accept = verifier(Arc::new(AcceptAnyCertificate));
        assert!(accept
            .verify_server_cert(&cert, &[], &name, &[], UnixTime::now())
            .is_ok());

        let reject = verifier(Arc::new(RejectAll));
        let err = reject
            .verify_server_cert(&cert, &[], &name, &[], UnixTime::now())
            .unwrap_err();
        assert!(err.to_string().contains("untrusted example.com"));
    }

    #[test]
    fn test_verifier_advertises_schemes() {
        let v = verifier(Arc::new(AcceptAnyCertificate));
        assert!(!v.supported_verify_schemes().is_empty());
    }
}
