use crate::engine::connection::BoxedStream;
use crate::model::TlsInfo;
use async_trait::async_trait;
use openssl::ssl::{ErrorCode, SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::X509NameRef;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::pin::Pin;
use tokio_openssl::SslStream;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The peer closed the connection cleanly while the handshake was running.
    #[error("peer closed the connection during the TLS handshake")]
    PeerClosed,
    #[error("failed to set up TLS: {0}")]
    Setup(String),
    #[error("TLS handshake failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct Upgraded {
    pub stream: BoxedStream,
    pub info: Option<TlsInfo>,
}

/// Layers TLS on top of an already established plaintext stream.
#[async_trait]
pub trait TlsUpgrader: Send + Sync {
    async fn upgrade(
        &self,
        stream: BoxedStream,
        server_name: &str,
    ) -> Result<Upgraded, HandshakeError>;
}

pub struct OpensslUpgrader {
    connector: SslConnector,
}

impl OpensslUpgrader {
    pub fn new() -> anyhow::Result<Self> {
        let mut builder = SslConnector::builder(SslMethod::tls())?;
        // Scanning arbitrary mail servers; certificates are recorded, not judged.
        builder.set_verify(SslVerifyMode::NONE);
        Ok(Self {
            connector: builder.build(),
        })
    }
}

#[async_trait]
impl TlsUpgrader for OpensslUpgrader {
    async fn upgrade(
        &self,
        stream: BoxedStream,
        server_name: &str,
    ) -> Result<Upgraded, HandshakeError> {
        let mut config = self
            .connector
            .configure()
            .map_err(|err| HandshakeError::Setup(err.to_string()))?;
        let use_sni = !server_name.is_empty() && server_name.parse::<IpAddr>().is_err();
        config.set_use_server_name_indication(use_sni);
        config.set_verify_hostname(false);
        let ssl = config
            .into_ssl(server_name)
            .map_err(|err| HandshakeError::Setup(err.to_string()))?;

        let mut tls_stream =
            SslStream::new(ssl, stream).map_err(|err| HandshakeError::Setup(err.to_string()))?;
        if let Err(err) = Pin::new(&mut tls_stream).connect().await {
            return Err(classify(err));
        }

        let info = extract_tls_info(&tls_stream);
        Ok(Upgraded {
            stream: Box::new(tls_stream),
            info: Some(info),
        })
    }
}

fn classify(err: openssl::ssl::Error) -> HandshakeError {
    if err.code() == ErrorCode::ZERO_RETURN {
        return HandshakeError::PeerClosed;
    }
    if err.code() == ErrorCode::SYSCALL {
        // SYSCALL without an io error is EOF in violation of the protocol.
        let closed = err.io_error().map_or(true, |io| is_peer_close(io.kind()));
        if closed {
            return HandshakeError::PeerClosed;
        }
        return match err.into_io_error() {
            Ok(io) => HandshakeError::Io(io),
            Err(err) => HandshakeError::Failed(err.to_string()),
        };
    }
    // OpenSSL 3 reports a bare FIN mid-handshake as a protocol error.
    let unexpected_eof = err.ssl_error().is_some_and(|stack| {
        stack
            .errors()
            .iter()
            .any(|e| e.reason().is_some_and(|r| r.contains("unexpected eof")))
    });
    if unexpected_eof {
        return HandshakeError::PeerClosed;
    }
    HandshakeError::Failed(err.to_string())
}

pub fn is_peer_close(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe)
}

fn extract_tls_info(stream: &SslStream<BoxedStream>) -> TlsInfo {
    let ssl = stream.ssl();
    let mut info = TlsInfo {
        cipher: ssl
            .current_cipher()
            .map(|cipher| cipher.name().to_string())
            .unwrap_or_default(),
        version: ssl.version_str().to_string(),
        ..TlsInfo::default()
    };

    if let Some(cert) = ssl.peer_certificate() {
        info.cert_subject = format_x509_name(cert.subject_name());
        info.cert_issuer = format_x509_name(cert.issuer_name());
        info.cert_valid_from = cert.not_before().to_string();
        info.cert_valid_to = cert.not_after().to_string();
    }

    info
}

fn format_x509_name(name: &X509NameRef) -> String {
    let mut parts = Vec::new();
    for entry in name.entries() {
        let key = entry.object().nid().short_name().unwrap_or("UNKNOWN");
        let value = entry
            .data()
            .as_utf8()
            .map(|val| val.to_string())
            .unwrap_or_default();
        if !value.is_empty() {
            parts.push(format!("{key}={value}"));
        }
    }
    parts.join(", ")
}
