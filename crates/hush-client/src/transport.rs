//! QUIC transport for the client.
//!
//! Provides [`ConnectedClient`], which moves frames between channels and a
//! QUIC connection. Protocol logic stays in the Sans-IO
//! [`ClientSession`](crate::ClientSession): a driver dials when the session
//! asks for [`ClientAction::Dial`](crate::ClientAction::Dial), feeds received
//! frames back as events and reports the connection closing.
//!
//! Client frames travel on one bidirectional stream; relay frames arrive on
//! the unidirectional stream the relay opens when the connection is
//! accepted.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::BytesMut;
use hush_proto::{ALPN_PROTOCOL, Frame, FrameHeader};
use quinn::{ClientConfig, Endpoint, RecvStream, SendStream};
use rustls::pki_types::CertificateDer;
use thiserror::Error;
use tokio::sync::mpsc;

const CHANNEL_DEPTH: usize = 64;
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Stream error.
    #[error("stream error: {0}")]
    Stream(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// TLS configuration rejected.
    #[error("tls configuration error: {0}")]
    Tls(String),
}

impl TransportError {
    /// Whether the reconnect machine should retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Stream(_))
    }
}

/// Handle to a connected client with QUIC transport.
///
/// Frames are sent and received through the channels; internal tasks do
/// the QUIC I/O. `from_server` closes when the connection ends.
pub struct ConnectedClient {
    /// Send frames to the relay.
    pub to_server: mpsc::Sender<Frame>,
    /// Receive frames from the relay.
    pub from_server: mpsc::Receiver<Frame>,
    connection: quinn::Connection,
    abort_handle: tokio::task::AbortHandle,
}

impl ConnectedClient {
    /// Close the connection.
    pub fn stop(&self) {
        self.connection.close(0u32.into(), b"client closed");
        self.abort_handle.abort();
    }
}

/// Connect to a relay.
///
/// With `trusted` the relay's certificate must chain to it. Without it any
/// certificate is accepted, which is only suitable for development against a
/// self-signed relay; envelopes stay end-to-end encrypted either way.
pub async fn connect(
    server_addr: &str,
    server_name: &str,
    trusted: Option<CertificateDer<'static>>,
) -> Result<ConnectedClient, TransportError> {
    let addr: SocketAddr = server_addr
        .parse()
        .map_err(|e| TransportError::Connection(format!("invalid address: {e}")))?;

    let client_config = client_config(trusted)?;
    let mut endpoint = Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))
        .map_err(|e| TransportError::Connection(format!("endpoint creation failed: {e}")))?;
    endpoint.set_default_client_config(client_config);

    let connection = endpoint
        .connect(addr, server_name)
        .map_err(|e| TransportError::Connection(format!("connect failed: {e}")))?
        .await
        .map_err(|e| TransportError::Connection(format!("connection failed: {e}")))?;

    let (send, _recv) = connection
        .open_bi()
        .await
        .map_err(|e| TransportError::Stream(format!("open_bi failed: {e}")))?;

    let (to_server_tx, to_server_rx) = mpsc::channel::<Frame>(CHANNEL_DEPTH);
    let (from_server_tx, from_server_rx) = mpsc::channel::<Frame>(CHANNEL_DEPTH);

    let handle =
        tokio::spawn(run_connection(connection.clone(), send, to_server_rx, from_server_tx));

    Ok(ConnectedClient {
        to_server: to_server_tx,
        from_server: from_server_rx,
        connection,
        abort_handle: handle.abort_handle(),
    })
}

/// Bridge the channels and the QUIC streams until either side goes away.
async fn run_connection(
    connection: quinn::Connection,
    mut send: SendStream,
    mut to_server: mpsc::Receiver<Frame>,
    from_server: mpsc::Sender<Frame>,
) {
    let reader = tokio::spawn(async move {
        match connection.accept_uni().await {
            Ok(recv) => {
                if let Err(e) = read_frames(recv, from_server).await {
                    tracing::debug!("Relay stream ended: {}", e);
                }
            },
            Err(e) => tracing::debug!("Accept uni error: {}", e),
        }
    });

    while let Some(frame) = to_server.recv().await {
        if let Err(e) = write_frame(&mut send, &frame).await {
            tracing::debug!("Send error: {}", e);
            break;
        }
    }

    let _ = send.finish();
    reader.abort();
}

/// Read frames from the relay's stream until it closes.
async fn read_frames(
    mut recv: RecvStream,
    tx: mpsc::Sender<Frame>,
) -> Result<(), TransportError> {
    let mut buf = BytesMut::with_capacity(FrameHeader::SIZE);

    loop {
        buf.clear();
        buf.resize(FrameHeader::SIZE, 0);
        recv.read_exact(&mut buf[..])
            .await
            .map_err(|e| TransportError::Stream(format!("header read failed: {e}")))?;

        let payload_size = FrameHeader::from_bytes(&buf)
            .map_err(|e| TransportError::Protocol(format!("invalid header: {e}")))?
            .payload_size() as usize;

        if payload_size > 0 {
            buf.resize(FrameHeader::SIZE + payload_size, 0);
            recv.read_exact(&mut buf[FrameHeader::SIZE..])
                .await
                .map_err(|e| TransportError::Stream(format!("payload read failed: {e}")))?;
        }

        let frame = Frame::decode(&buf)
            .map_err(|e| TransportError::Protocol(format!("frame decode failed: {e}")))?;

        tx.send(frame)
            .await
            .map_err(|e| TransportError::Stream(format!("channel send failed: {e}")))?;
    }
}

async fn write_frame(send: &mut SendStream, frame: &Frame) -> Result<(), TransportError> {
    let mut buf = Vec::with_capacity(frame.encoded_len());
    frame.encode(&mut buf).map_err(|e| TransportError::Protocol(format!("encode failed: {e}")))?;

    send.write_all(&buf).await.map_err(|e| TransportError::Stream(format!("write failed: {e}")))
}

fn client_config(
    trusted: Option<CertificateDer<'static>>,
) -> Result<ClientConfig, TransportError> {
    let builder = rustls::ClientConfig::builder();
    let mut crypto = match trusted {
        Some(cert) => {
            let mut roots = rustls::RootCertStore::empty();
            roots.add(cert).map_err(|e| TransportError::Tls(e.to_string()))?;
            builder.with_root_certificates(roots).with_no_client_auth()
        },
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth(),
    };
    crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let quic = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let mut config = ClientConfig::new(Arc::new(quic));

    let idle = quinn::IdleTimeout::try_from(IDLE_TIMEOUT)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(idle));
    config.transport_config(Arc::new(transport));

    Ok(config)
}

/// Certificate verifier that accepts anything. Development only.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
