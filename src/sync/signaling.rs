//! Authenticated session on the signaling relay
//!
//! The relay is untrusted: it sees who talks to whom but never plaintext
//! payloads between peers. The client authenticates with a challenge/response
//! handshake (the relay verifies an Ed25519 signature over 32 random bytes
//! before routing anything), then exchanges frames:
//!
//! - addressed payloads are sealed with the pairwise shared secret of the
//!   two endpoints before they reach the relay
//! - broadcasts (no recipient) are sent in clear and reserved for public
//!   discovery messages
//!
//! The client keeps one connection alive, reconnecting with exponential
//! backoff on transient failures. Outbound messages enqueue while the
//! connection is down and drain on reconnect, in order.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crypto::ContentCrypto;
use crate::error::{ShareError, ShareResult};
use crate::identity::{ClientId, PublicKey, SessionManager, Signature};
use crate::sync::connection::{ConnectRequest, Connection, Connector};

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Outbound queue depth; sends await when it is full
const OUTBOUND_QUEUE_CAPACITY: usize = 256;
/// Reconnect backoff: 500 ms doubling up to 30 s
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Concrete remote endpoint: identity plus session instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    /// The remote identity key
    pub public_key: PublicKey,
    /// The remote session instance
    pub client_id: ClientId,
}

/// Message recipient: a specific session, any session of an identity, or
/// (as `Option::None` at the call site) everyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    /// The recipient identity key
    pub public_key: PublicKey,
    /// Specific session, or all sessions of the identity when `None`
    pub client_id: Option<ClientId>,
}

impl From<PeerAddr> for Recipient {
    fn from(addr: PeerAddr) -> Self {
        Self {
            public_key: addr.public_key,
            client_id: Some(addr.client_id),
        }
    }
}

/// Frames sent by the relay to the client
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum ServerFrame {
    /// Authentication challenge; must be answered before anything else
    Challenge { challenge: [u8; 32] },
    /// Challenge accepted, routing is active
    Ready,
    /// A message from another client
    Deliver {
        from: PeerAddr,
        data: Vec<u8>,
        broadcast: bool,
    },
}

/// Frames sent by the client to the relay
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum ClientFrame {
    /// Signature over the server challenge
    Answer { signature: Signature },
    /// Deliver a payload to a recipient, or broadcast when `to` is `None`
    Send { to: Option<Recipient>, data: Vec<u8> },
}

pub(crate) fn encode_frame<T: Serialize>(frame: &T) -> ShareResult<Vec<u8>> {
    postcard::to_allocvec(frame)
        .map_err(|e| ShareError::Serialization(format!("Failed to encode frame: {}", e)))
}

pub(crate) fn decode_frame<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> ShareResult<T> {
    postcard::from_bytes(bytes)
        .map_err(|e| ShareError::Serialization(format!("Failed to decode frame: {}", e)))
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the signaling client
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Authenticated session established
    Connected,
    /// Connection lost or shut down
    Disconnected,
    /// A payload arrived, already decrypted when it was addressed to us
    Message { from: PeerAddr, data: Vec<u8> },
    /// A non-fatal error (handshake refused, undecryptable payload, ...)
    Error(String),
}

/// Authenticated client session on the signaling relay.
pub struct SignalingClient {
    session: Arc<SessionManager>,
    connector: Arc<dyn Connector>,
    state: Arc<RwLock<ConnectionState>>,
    events: broadcast::Sender<SignalingEvent>,
    outbound: RwLock<Option<mpsc::Sender<ClientFrame>>>,
    shutdown: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Create a client for `session` over the given transport.
    pub fn new(session: Arc<SessionManager>, connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            session,
            connector,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            events,
            outbound: RwLock::new(None),
            shutdown,
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Subscribe to signaling events
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.events.subscribe()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Whether an authenticated session is active
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Start the connection loop.
    ///
    /// Idempotent: a second call while the loop is running is a no-op.
    pub fn connect(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        *self.outbound.write() = Some(out_tx);
        let _ = self.shutdown.send(false);

        let driver = ConnectionDriver {
            session: self.session.clone(),
            connector: self.connector.clone(),
            state: self.state.clone(),
            events: self.events.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        *task = Some(tokio::spawn(driver.run(out_rx)));
    }

    /// Shut down the connection loop and close the connection.
    ///
    /// Documents and storage are untouched; `connect` may be called again.
    pub async fn disconnect(&self) {
        let _ = self.shutdown.send(true);
        *self.outbound.write() = None;

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Wait until an authenticated session is active.
    pub async fn wait_for_connection(&self) -> ShareResult<()> {
        let mut events = self.subscribe();
        if self.is_connected() {
            return Ok(());
        }
        loop {
            match events.recv().await {
                Ok(SignalingEvent::Connected) => return Ok(()),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if self.is_connected() {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ShareError::TransportClosed(
                        "Signaling client dropped".to_string(),
                    ))
                }
            }
        }
    }

    /// Send a payload to a recipient, or broadcast it when `to` is `None`.
    ///
    /// Addressed payloads are sealed with the pairwise shared secret before
    /// leaving the process; broadcasts go out in clear.
    pub async fn send_message(&self, to: Option<Recipient>, data: Vec<u8>) -> ShareResult<()> {
        let data = match &to {
            Some(recipient) => {
                let secret = self.session.shared_secret(&recipient.public_key)?;
                ContentCrypto::new(&secret).encrypt(&data)?
            }
            None => data,
        };

        let tx = self
            .outbound
            .read()
            .clone()
            .ok_or_else(|| ShareError::TransportClosed("Client is not connected".to_string()))?;

        tx.send(ClientFrame::Send { to, data })
            .await
            .map_err(|_| ShareError::TransportClosed("Client is shutting down".to_string()))
    }

    /// The session this client authenticates as
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }
}

/// Owns one reconnecting relay session on behalf of a [`SignalingClient`].
struct ConnectionDriver {
    session: Arc<SessionManager>,
    connector: Arc<dyn Connector>,
    state: Arc<RwLock<ConnectionState>>,
    events: broadcast::Sender<SignalingEvent>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionDriver {
    async fn run(self, mut out_rx: mpsc::Receiver<ClientFrame>) {
        let mut backoff = BACKOFF_BASE;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            *self.state.write() = ConnectionState::Connecting;
            let request = ConnectRequest {
                public_key: self.session.public_key(),
                client_id: self.session.client_id(),
            };

            match self.connector.connect(request).await {
                Ok(mut conn) => match self.handshake(&mut conn).await {
                    Ok(()) => {
                        info!("Signaling session established");
                        backoff = BACKOFF_BASE;
                        *self.state.write() = ConnectionState::Connected;
                        let _ = self.events.send(SignalingEvent::Connected);

                        let clean_exit = self.pump(&mut conn, &mut out_rx).await;

                        *self.state.write() = ConnectionState::Disconnected;
                        let _ = self.events.send(SignalingEvent::Disconnected);
                        if clean_exit {
                            conn.close();
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Signaling handshake failed");
                        let _ = self.events.send(SignalingEvent::Error(e.to_string()));
                    }
                },
                Err(e) => {
                    warn!(error = %e, "Signaling connect failed");
                    let _ = self.events.send(SignalingEvent::Error(e.to_string()));
                }
            }

            if *self.shutdown.borrow() {
                break;
            }
            debug!(?backoff, "Reconnecting after backoff");
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => {}
            }
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }

        *self.state.write() = ConnectionState::Disconnected;
    }

    async fn handshake(&self, conn: &mut Connection) -> ShareResult<()> {
        let frame = conn
            .recv()
            .await
            .ok_or_else(|| ShareError::TransportClosed("Closed during handshake".to_string()))?;
        let ServerFrame::Challenge { challenge } = decode_frame(&frame)? else {
            return Err(ShareError::Network(
                "Expected challenge from relay".to_string(),
            ));
        };

        let signature = self.session.keypair().sign(&challenge);
        conn.send(encode_frame(&ClientFrame::Answer { signature })?)
            .await?;

        let frame = conn
            .recv()
            .await
            .ok_or_else(|| ShareError::TransportClosed("Closed during handshake".to_string()))?;
        match decode_frame(&frame)? {
            ServerFrame::Ready => Ok(()),
            _ => Err(ShareError::Network(
                "Relay refused authentication".to_string(),
            )),
        }
    }

    /// Pump frames until shutdown (returns `true`) or connection loss
    /// (returns `false`, caller reconnects).
    async fn pump(&self, conn: &mut Connection, out_rx: &mut mpsc::Receiver<ClientFrame>) -> bool {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Flush frames already queued (peer teardown byes)
                        while let Ok(frame) = out_rx.try_recv() {
                            let Ok(bytes) = encode_frame(&frame) else { continue };
                            if conn.send(bytes).await.is_err() {
                                break;
                            }
                        }
                        return true;
                    }
                }
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { return true };
                    let Ok(bytes) = encode_frame(&frame) else { continue };
                    if conn.send(bytes).await.is_err() {
                        return false;
                    }
                }
                inbound = conn.recv() => {
                    let Some(bytes) = inbound else { return false };
                    self.handle_server_frame(&bytes);
                }
            }
        }
    }

    fn handle_server_frame(&self, bytes: &[u8]) {
        let frame: ServerFrame = match decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable relay frame");
                return;
            }
        };

        let ServerFrame::Deliver {
            from,
            data,
            broadcast,
        } = frame
        else {
            debug!("Ignoring unexpected relay frame");
            return;
        };

        let data = if broadcast {
            data
        } else {
            let secret = match self.session.shared_secret(&from.public_key) {
                Ok(secret) => secret,
                Err(e) => {
                    warn!(error = %e, "No shared secret for sender, dropping message");
                    let _ = self.events.send(SignalingEvent::Error(e.to_string()));
                    return;
                }
            };
            match ContentCrypto::new(&secret).decrypt(&data) {
                Ok(plain) => plain,
                Err(e) => {
                    warn!(error = %e, "Failed to decrypt addressed message, dropping");
                    let _ = self.events.send(SignalingEvent::Error(e.to_string()));
                    return;
                }
            }
        };

        let _ = self.events.send(SignalingEvent::Message { from, data });
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("public_key", &self.session.public_key())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
