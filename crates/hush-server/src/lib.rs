//! HUSH relay server.
//!
//! Stores and forwards encrypted envelopes by conversation identifier without
//! ever being able to open them, and gates access with a knowledge proof of
//! a shared passphrase backed by a configurable defense policy.
//!
//! # Architecture
//!
//! [`RelayDriver`] follows the Sans-IO pattern: it consumes [`RelayEvent`]s
//! and returns [`RelayAction`]s, touching only storage. [`Server`] executes
//! those actions with Quinn QUIC and Tokio.
//!
//! Every event goes through one driver lock, so subscription index
//! mutations are serialized. Sends leave the lock as non-blocking pushes into
//! a bounded per-connection queue drained by that connection's writer task.
//! A slow or dead subscriber fills its own queue and is disconnected; it
//! never holds up delivery to anyone else.
//!
//! # Components
//!
//! - [`RelayDriver`]: connection, subscription and broadcast logic
//! - [`DefenseEngine`]: failure tracking and threshold actions
//! - [`AuthGate`]: knowledge proof check and session tokens
//! - [`ConnectionRegistry`]: bidirectional session/channel index
//! - [`storage`]: envelope and security bookkeeping persistence
//! - [`Telemetry`]: relay counters shared by the driver and the runtime
//! - [`Server`]: production runtime
//! - [`QuinnTransport`]: QUIC transport
//! - [`SystemEnv`]: production environment (real time, OS RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod config;
mod defense;
mod driver;
mod error;
mod rate_limit;
mod registry;
mod server_error;
pub mod storage;
mod system_env;
mod telemetry;
mod transport;

use std::{collections::HashMap, net::IpAddr, path::PathBuf, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use hush_core::Environment;
use hush_crypto::TokenKey;
use hush_proto::{Frame, FrameHeader};
use tokio::sync::{Mutex, RwLock, mpsc};

pub use auth::{AuthConfig, AuthGate, AuthOutcome, DEFAULT_TOKEN_TTL};
pub use config::ServerConfig;
pub use defense::{
    AccessDecision, DEFAULT_BLOCK_DURATION, DEFAULT_MAX_FAILURES, DefenseAction, DefenseConfig,
    DefenseEngine, DefenseError, FailureMode, FailureOutcome,
};
pub use driver::{LogLevel, RelayAction, RelayConfig, RelayDriver, RelayEvent, RelayStats};
pub use error::ServerError;
pub use rate_limit::{AuthRateLimiter, BucketConfig, SendWindow};
pub use registry::{Channel, ConnectionRegistry, SessionInfo, SubscribeError};
pub use server_error::DriverError;
pub use storage::{MemoryStorage, RedbStorage, Storage, StorageError};
pub use system_env::SystemEnv;
pub use telemetry::{Counter, Telemetry, TelemetrySnapshot};
pub use transport::{QuinnConnection, QuinnTransport};

/// Frames buffered per connection before it counts as too slow to keep.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Interval between driver ticks (heartbeats, timeouts, pruning, expiry).
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Log target for security events.
pub const SECURITY_TARGET: &str = "hush::security";

type SharedDriver<S> = Arc<Mutex<RelayDriver<SystemEnv, S>>>;

/// Per-connection handles used to execute actions.
struct SharedState {
    /// Session ID to QUIC connection (for closing)
    connections: RwLock<HashMap<u64, QuinnConnection>>,
    /// Session ID to its outbound queue. One writer task per session drains
    /// the queue into a single uni stream, preserving order.
    outbound: RwLock<HashMap<u64, mpsc::Sender<Bytes>>>,
    /// Counters shared with the driver
    telemetry: Arc<Telemetry>,
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:4433")
    pub bind_address: String,
    /// Path to TLS certificate (PEM format)
    pub cert_path: Option<PathBuf>,
    /// Path to TLS private key (PEM format)
    pub key_path: Option<PathBuf>,
    /// Driver configuration
    pub relay: RelayConfig,
}

/// Production HUSH relay.
pub struct Server<S: Storage> {
    driver: RelayDriver<SystemEnv, S>,
    transport: QuinnTransport,
    env: SystemEnv,
}

impl<S: Storage> Server<S> {
    /// Create and bind a relay over `storage`.
    pub fn bind(
        config: ServerRuntimeConfig,
        storage: S,
        token_key: TokenKey,
    ) -> Result<Self, ServerError> {
        let env = SystemEnv::new();
        let driver = RelayDriver::new(env.clone(), storage, config.relay, token_key);

        let transport = QuinnTransport::bind(
            &config.bind_address,
            config.cert_path.as_deref(),
            config.key_path.as_deref(),
        )?;

        Ok(Self { driver, transport, env })
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// Accept connections until the endpoint closes or a halt is executed.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("Relay starting on {}", self.transport.local_addr()?);

        let env = self.env;
        let shared = Arc::new(SharedState {
            connections: RwLock::new(HashMap::new()),
            outbound: RwLock::new(HashMap::new()),
            telemetry: self.driver.telemetry(),
        });
        let driver = Arc::new(Mutex::new(self.driver));

        tokio::spawn(run_ticks(Arc::clone(&driver), Arc::clone(&shared)));

        loop {
            match self.transport.accept().await {
                Ok(conn) => {
                    let driver = Arc::clone(&driver);
                    let shared = Arc::clone(&shared);
                    let env = env.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(conn, driver, shared, env).await {
                            tracing::debug!("Connection error: {}", e);
                        }
                    });
                },
                Err(ServerError::Transport(msg)) if msg == "endpoint closed" => {
                    tracing::info!("Endpoint closed, relay stopping");
                    return Ok(());
                },
                Err(e) => {
                    tracing::warn!("Accept error: {}", e);
                },
            }
        }
    }
}

async fn run_ticks<S: Storage>(driver: SharedDriver<S>, shared: Arc<SharedState>) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let mut driver = driver.lock().await;
        match driver.process_event(RelayEvent::Tick) {
            Ok(actions) => execute_actions(actions, &shared).await,
            Err(e) => tracing::error!("Tick failed: {}", e),
        }
    }
}

/// Serve one QUIC connection until it closes.
async fn handle_connection<S: Storage>(
    conn: QuinnConnection,
    driver: SharedDriver<S>,
    shared: Arc<SharedState>,
    env: SystemEnv,
) -> Result<(), ServerError> {
    let remote_addr: IpAddr = conn.remote_addr().ip().to_canonical();
    let stream = conn.open_uni().await?;
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);

    // The id is drawn and claimed under one write lock so two accepts can
    // never share it.
    let session_id = {
        let mut outbound = shared.outbound.write().await;
        let session_id = fresh_session_id(&env, &*outbound);
        outbound.insert(session_id, tx);
        session_id
    };
    shared.connections.write().await.insert(session_id, conn.clone());

    tracing::debug!("New connection {} from {}", session_id, remote_addr);
    tokio::spawn(write_outbound(session_id, stream, rx));

    {
        let mut driver = driver.lock().await;
        let event = RelayEvent::ConnectionAccepted { session_id, remote_addr };
        match driver.process_event(event) {
            Ok(actions) => execute_actions(actions, &shared).await,
            Err(e) => {
                drop(driver);
                forget(session_id, &shared).await;
                conn.close("internal error");
                return Err(e.into());
            },
        }
    }

    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                // Replies travel on the uni stream.
                drop(send);

                let driver = Arc::clone(&driver);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = handle_stream(session_id, recv, driver, &shared).await {
                        tracing::debug!("Stream error on {}: {}", session_id, e);
                    }
                });
            },
            Err(e) => {
                tracing::debug!("Connection {} closed: {}", session_id, e);
                break;
            },
        }
    }

    forget(session_id, &shared).await;

    let mut driver = driver.lock().await;
    let actions = driver.process_event(RelayEvent::ConnectionClosed {
        session_id,
        reason: "connection closed".to_string(),
    })?;
    execute_actions(actions, &shared).await;

    Ok(())
}

/// Draw a session id not present in `live`. Zero is reserved for "no session".
fn fresh_session_id<E: Environment, V>(env: &E, live: &HashMap<u64, V>) -> u64 {
    loop {
        let candidate = env.random_u64();
        if candidate != 0 && !live.contains_key(&candidate) {
            return candidate;
        }
    }
}

async fn forget(session_id: u64, shared: &SharedState) {
    shared.connections.write().await.remove(&session_id);
    shared.outbound.write().await.remove(&session_id);
}

/// Read frames from one client stream and feed them to the driver.
async fn handle_stream<S: Storage>(
    session_id: u64,
    mut recv: quinn::RecvStream,
    driver: SharedDriver<S>,
    shared: &SharedState,
) -> Result<(), ServerError> {
    let mut buf = BytesMut::with_capacity(FrameHeader::SIZE);

    loop {
        buf.clear();
        buf.resize(FrameHeader::SIZE, 0);

        if let Err(e) = recv.read_exact(&mut buf[..]).await {
            tracing::debug!("Read error on {}: {}", session_id, e);
            return Ok(());
        }

        let payload_size = match FrameHeader::from_bytes(&buf) {
            Ok(header) => header.payload_size() as usize,
            Err(e) => {
                // Framing is lost; nothing after this point can be trusted.
                return Err(ServerError::Protocol(e.to_string()));
            },
        };

        if payload_size > 0 {
            buf.resize(FrameHeader::SIZE + payload_size, 0);
            recv.read_exact(&mut buf[FrameHeader::SIZE..])
                .await
                .map_err(|e| ServerError::Transport(format!("payload read failed: {e}")))?;
        }

        let frame = Frame::decode(&buf).map_err(|e| ServerError::Protocol(e.to_string()))?;

        let mut driver = driver.lock().await;
        match driver.process_event(RelayEvent::FrameReceived { session_id, frame }) {
            Ok(actions) => execute_actions(actions, shared).await,
            Err(e) => tracing::warn!("Frame processing error on {}: {}", session_id, e),
        }
    }
}

/// Drain a session's outbound queue into its uni stream.
async fn write_outbound(
    session_id: u64,
    mut stream: quinn::SendStream,
    mut rx: mpsc::Receiver<Bytes>,
) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = stream.write_all(&bytes).await {
            tracing::debug!("Write failed for {}: {}", session_id, e);
            return;
        }
    }

    if let Err(e) = stream.finish() {
        tracing::debug!("Failed to finish stream for {}: {}", session_id, e);
    }
}

fn encode(frame: &Frame) -> Option<Bytes> {
    let mut buf = BytesMut::with_capacity(frame.encoded_len());
    match frame.encode(&mut buf) {
        Ok(()) => Some(buf.freeze()),
        Err(e) => {
            tracing::error!("Failed to encode frame: {}", e);
            None
        },
    }
}

/// Queue `bytes` for a session without waiting.
///
/// A full queue means the peer is not keeping up; its connection is closed
/// and the accept loop reports the close to the driver.
fn enqueue(
    session_id: u64,
    bytes: Bytes,
    outbound: &HashMap<u64, mpsc::Sender<Bytes>>,
    connections: &HashMap<u64, QuinnConnection>,
    telemetry: &Telemetry,
) {
    let Some(tx) = outbound.get(&session_id) else {
        return;
    };

    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(bytes) {
        telemetry.increment(Counter::QueueOverflows, 1);
        tracing::warn!("Outbound queue full for {}, disconnecting", session_id);
        if let Some(conn) = connections.get(&session_id) {
            conn.close("too slow");
        }
    }
}

/// Execute relay actions. Never waits on a client.
async fn execute_actions(actions: Vec<RelayAction>, shared: &SharedState) {
    for action in actions {
        match action {
            RelayAction::SendToSession { session_id, frame } => {
                let Some(bytes) = encode(&frame) else { continue };
                let outbound = shared.outbound.read().await;
                let connections = shared.connections.read().await;
                enqueue(session_id, bytes, &outbound, &connections, &shared.telemetry);
            },

            RelayAction::Deliver { session_ids, frame } => {
                let Some(bytes) = encode(&frame) else { continue };
                let outbound = shared.outbound.read().await;
                let connections = shared.connections.read().await;
                for session_id in session_ids {
                    let telemetry = &shared.telemetry;
                    enqueue(session_id, bytes.clone(), &outbound, &connections, telemetry);
                }
            },

            RelayAction::CloseConnection { session_id, reason } => {
                tracing::debug!("Closing connection {}: {}", session_id, reason);
                // Dropping the sender lets the writer flush what is queued.
                shared.outbound.write().await.remove(&session_id);
                if let Some(conn) = shared.connections.write().await.remove(&session_id) {
                    conn.close(&reason);
                }
            },

            RelayAction::Log { level, message } => match level {
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },

            RelayAction::SecurityEvent { level, message } => match level {
                LogLevel::Debug => tracing::debug!(target: SECURITY_TARGET, "{}", message),
                LogLevel::Info => tracing::info!(target: SECURITY_TARGET, "{}", message),
                LogLevel::Warn => tracing::warn!(target: SECURITY_TARGET, "{}", message),
                LogLevel::Error => tracing::error!(target: SECURITY_TARGET, "{}", message),
            },

            RelayAction::Halt { reason } => {
                tracing::error!(target: SECURITY_TARGET, "Halting: {}", reason);
                std::process::exit(1);
            },
        }
    }
}
