//! Quinn-based QUIC transport.
//!
//! Every client connection is a QUIC connection negotiated with ALPN
//! `hush/1` over TLS 1.3. Production deployments load a PEM certificate and
//! key; without them a self-signed certificate is generated, which is only
//! fit for local testing.

use std::{net::SocketAddr, path::Path, sync::Arc};

use hush_proto::ALPN_PROTOCOL;
use quinn::{Endpoint, RecvStream, SendStream, ServerConfig};

use crate::error::ServerError;

/// QUIC listener for relay clients.
pub struct QuinnTransport {
    endpoint: Endpoint,
}

impl QuinnTransport {
    /// Bind a QUIC endpoint.
    ///
    /// Uses the given certificate and key when both are present, otherwise a
    /// freshly generated self-signed certificate.
    pub fn bind(
        address: &str,
        cert_path: Option<&Path>,
        key_path: Option<&Path>,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address '{address}': {e}")))?;

        let server_config = match (cert_path, key_path) {
            (Some(cert), Some(key)) => load_tls_config(cert, key)?,
            (None, None) => generate_self_signed_config()?,
            _ => {
                return Err(ServerError::Config(
                    "certificate and key must be given together".to_string(),
                ));
            },
        };

        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|e| ServerError::Transport(format!("failed to create endpoint: {e}")))?;

        tracing::info!("QUIC transport bound to {}", addr);

        Ok(Self { endpoint })
    }

    /// Wait for the next completed QUIC handshake.
    pub async fn accept(&self) -> Result<QuinnConnection, ServerError> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| ServerError::Transport("endpoint closed".to_string()))?;

        let connection = incoming
            .await
            .map_err(|e| ServerError::Transport(format!("connection failed: {e}")))?;

        Ok(QuinnConnection { connection })
    }

    /// Local address the transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.endpoint
            .local_addr()
            .map_err(|e| ServerError::Transport(format!("failed to get local address: {e}")))
    }
}

/// An accepted client connection.
///
/// Clones share the underlying QUIC connection.
#[derive(Clone)]
pub struct QuinnConnection {
    connection: quinn::Connection,
}

impl QuinnConnection {
    /// Accept the next client-opened bidirectional stream.
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), ServerError> {
        self.connection
            .accept_bi()
            .await
            .map_err(|e| ServerError::Transport(format!("accept_bi failed: {e}")))
    }

    /// Open the relay-to-client stream.
    pub async fn open_uni(&self) -> Result<SendStream, ServerError> {
        self.connection
            .open_uni()
            .await
            .map_err(|e| ServerError::Transport(format!("open_uni failed: {e}")))
    }

    /// Remote peer address. Keys rate limiting and the defense engine.
    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Close the connection with a reason.
    pub fn close(&self, reason: &str) {
        self.connection.close(0u32.into(), reason.as_bytes());
    }
}

fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, ServerError> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        ServerError::Config(format!("failed to read cert '{}': {e}", cert_path.display()))
    })?;
    let key_pem = std::fs::read(key_path).map_err(|e| {
        ServerError::Config(format!("failed to read key '{}': {e}", key_path.display()))
    })?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Config(format!("failed to parse certificates: {e}")))?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ServerError::Config(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| ServerError::Config("no private key found".to_string()))?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Config(format!("invalid TLS config: {e}")))?;

    quic_config(tls_config)
}

fn generate_self_signed_config() -> Result<ServerConfig, ServerError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| ServerError::Config(format!("failed to generate self-signed cert: {e}")))?;

    let key = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.cert.der().clone()], key.into())
        .map_err(|e| ServerError::Config(format!("invalid TLS config: {e}")))?;

    tracing::warn!("Using self-signed certificate - not for production use!");

    quic_config(tls_config)
}

fn quic_config(mut tls_config: rustls::ServerConfig) -> Result<ServerConfig, ServerError> {
    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
        .map_err(|e| ServerError::Config(format!("QUIC config error: {e}")))?;

    Ok(ServerConfig::with_crypto(Arc::new(crypto)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_with_self_signed_certificate() {
        let transport = QuinnTransport::bind("127.0.0.1:0", None, None).unwrap();

        assert_ne!(transport.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn rejects_invalid_address() {
        assert!(matches!(
            QuinnTransport::bind("invalid:address:format", None, None),
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn rejects_certificate_without_key() {
        let result = QuinnTransport::bind("127.0.0.1:0", Some(Path::new("cert.pem")), None);

        assert!(matches!(result, Err(ServerError::Config(_))));
    }
}
