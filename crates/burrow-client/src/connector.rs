//! Dialing the tunnel server: plain TCP, optionally through an HTTP CONNECT
//! proxy, optionally wrapped in TLS.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use burrow_proto::BoxedStream;

use crate::config::ClientConfig;
use crate::error::ClientError;

#[derive(Clone)]
pub struct Connector {
    cfg: Arc<ClientConfig>,
}

impl Connector {
    pub fn new(cfg: Arc<ClientConfig>) -> Self {
        Self { cfg }
    }

    /// Open one connection to the server, ready to carry a control channel
    /// or a work connection.
    pub async fn connect(&self) -> Result<BoxedStream, ClientError> {
        let target = format!("{}:{}", self.cfg.server_addr, self.cfg.server_port);

        let tcp = match &self.cfg.http_proxy {
            Some(proxy_addr) => connect_via_http_proxy(proxy_addr, &target).await?,
            None => TcpStream::connect(&target).await?,
        };
        tcp.set_nodelay(true)?;

        if self.cfg.tls_enable {
            let tls = self.wrap_tls(tcp).await?;
            Ok(Box::new(tls))
        } else {
            Ok(Box::new(tcp))
        }
    }

    async fn wrap_tls(
        &self,
        tcp: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ClientError> {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let server_name = rustls::pki_types::ServerName::try_from(self.cfg.server_addr.clone())
            .map_err(|e| ClientError::Tls(e.to_string()))?;

        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ClientError::Tls(e.to_string()))
    }
}

/// Tunnel the TCP connection through an HTTP proxy with a CONNECT exchange.
async fn connect_via_http_proxy(
    proxy_addr: &str,
    target: &str,
) -> Result<TcpStream, ClientError> {
    debug!(proxy = %proxy_addr, target = %target, "dialing via http proxy");
    let stream = TcpStream::connect(proxy_addr).await?;
    let mut reader = BufReader::new(stream);

    let request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nUser-Agent: burrow\r\n\r\n"
    );
    reader.get_mut().write_all(request.as_bytes()).await?;

    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    if !status_line.contains(" 200") {
        return Err(ClientError::HttpProxy(status_line.trim().to_string()));
    }

    // Discard remaining response headers up to the blank line.
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    // The proxy sends nothing further until we speak, so no buffered bytes
    // are lost here.
    Ok(reader.into_inner())
}

/// Certificate verifier that accepts anything. The control channel brings
/// its own token-keyed encryption; TLS here only provides wire privacy
/// against passive observers, matching the insecure-skip-verify setting.
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
