//! Byte-frame connection abstraction
//!
//! A [`Connection`] carries opaque frames in both directions; `None` from
//! [`recv`](Connection::recv) means the other side is gone. Transports are
//! plugged in through [`Connector`], which receives the identity fields a
//! WebSocket transport would put in the `x-public-key` / `x-client-id`
//! headers. The crate ships an in-memory transport; network transports live
//! outside.

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::{ShareError, ShareResult};
use crate::identity::{ClientId, PublicKey};

/// Identity presented when opening a connection.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// The connecting client's public key
    pub public_key: PublicKey,
    /// The connecting client's session id
    pub client_id: ClientId,
}

/// Bidirectional frame channel.
pub struct Connection {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Connection {
    /// Assemble a connection from its channel halves.
    ///
    /// Transport implementations pump `tx`'s peer receiver onto the wire and
    /// feed inbound frames into `rx`'s peer sender.
    pub fn from_channels(tx: mpsc::Sender<Vec<u8>>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { tx, rx }
    }

    /// Send one frame; fails once the other side is gone.
    pub async fn send(&self, frame: Vec<u8>) -> ShareResult<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| ShareError::TransportClosed("Connection closed".to_string()))
    }

    /// Receive the next frame; `None` when the connection is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Whether the send direction is still open
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Close the connection; the other side observes end-of-stream.
    pub fn close(self) {}

    /// Clone of the outbound sender, for routing frames from other tasks.
    pub(crate) fn sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.tx.clone()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Pluggable transport factory.
pub trait Connector: Send + Sync {
    /// Open a connection, presenting the client identity.
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, ShareResult<Connection>>;
}

/// Create a connected in-memory pair.
///
/// Frames sent on one side arrive on the other; dropping a side closes the
/// peer's receive stream.
pub fn memory_pair(capacity: usize) -> (Connection, Connection) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        Connection::from_channels(a_tx, a_rx),
        Connection::from_channels(b_tx, b_rx),
    )
}
