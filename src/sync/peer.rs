//! Peer lifecycle over tunneled signaling
//!
//! Peers are direct byte channels between two clients, scoped to a single
//! document: the same remote appears once per shared document. Connection
//! setup follows the WebRTC shape (offer, answer, ICE candidates, `bye`),
//! carried as `signal` messages through the exchanger. The concrete
//! transport is pluggable via [`PeerConnector`]; this crate ships an
//! in-process loopback that drives the full handshake for tests and local
//! development.
//!
//! Incoming offers pass a [`SignalGate`] before a peer is created. The
//! sharing client's gate checks that the referenced document exists locally
//! and that the sender is an allowed user; signals failing the gate are
//! dropped silently.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::document::DocumentId;
use crate::error::{ShareError, ShareResult};
use crate::sync::exchange::{
    IceCandidate, Message, MessageExchanger, SessionDescription, SignalBody,
};
use crate::sync::signaling::PeerAddr;

/// Outbound frame buffer per peer; the high-water mark for backpressure.
/// Senders await when it is full and resume as the channel drains.
pub const PEER_HIGH_WATER: usize = 64;

/// Default capacity for peer event and data channels
const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Signal handshake channel depth
const SIGNAL_CHANNEL_CAPACITY: usize = 16;

/// Identity of a peer: one remote endpoint scoped to one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerKey {
    /// The document this peer carries
    pub document_id: DocumentId,
    /// The remote endpoint
    pub remote: PeerAddr,
}

/// Payloads multiplexed over a peer's data channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerPayload {
    /// CRDT sync protocol message
    Sync(Vec<u8>),
    /// Ephemeral presence state
    Presence(Vec<u8>),
    /// Signed header export, propagating ACL/metadata updates
    Header(Vec<u8>),
}

/// Peer connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Closed,
}

/// Established byte channel handed over by a transport.
pub struct PeerChannel {
    /// Frames to the remote side
    pub outbound: mpsc::Sender<Vec<u8>>,
    /// Frames from the remote side
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

/// A peer-connection handshake in progress.
///
/// The manager forwards `local_signals` to the remote side through the
/// exchanger and feeds remote signals back in; `established` resolves once
/// the data channel opens.
pub struct PeerHandshake {
    /// Signals this side produces (offer/answer/ICE)
    pub local_signals: mpsc::Receiver<SignalBody>,
    /// Feed for signals arriving from the remote side
    pub remote_signals: mpsc::Sender<SignalBody>,
    /// Resolves with the open data channel, or is dropped on failure
    pub established: oneshot::Receiver<PeerChannel>,
}

/// Pluggable peer transport factory (the `wrtc` seam).
pub trait PeerConnector: Send + Sync {
    /// Begin a handshake as initiator (producing an offer) or responder
    /// (waiting for one).
    fn create(&self, initiator: bool) -> PeerHandshake;
}

/// A bidirectional data channel to one remote, scoped to one document.
pub struct Peer {
    key: PeerKey,
    state: RwLock<PeerState>,
    outbound: mpsc::Sender<PeerPayload>,
    data: broadcast::Sender<PeerPayload>,
    closed: watch::Sender<bool>,
}

impl Peer {
    fn new(key: PeerKey) -> (Arc<Self>, mpsc::Receiver<PeerPayload>) {
        let (outbound, outbound_rx) = mpsc::channel(PEER_HIGH_WATER);
        let (data, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (closed, _) = watch::channel(false);
        (
            Arc::new(Self {
                key,
                state: RwLock::new(PeerState::Connecting),
                outbound,
                data,
                closed,
            }),
            outbound_rx,
        )
    }

    /// The peer's identity
    pub fn key(&self) -> &PeerKey {
        &self.key
    }

    /// The remote endpoint
    pub fn remote(&self) -> PeerAddr {
        self.key.remote
    }

    /// The document this peer carries
    pub fn document_id(&self) -> &DocumentId {
        &self.key.document_id
    }

    /// Current lifecycle state
    pub fn state(&self) -> PeerState {
        *self.state.read()
    }

    /// Send a payload; awaits while the send buffer is at the high-water
    /// mark, preserving per-peer FIFO order.
    pub async fn send(&self, payload: PeerPayload) -> ShareResult<()> {
        self.outbound
            .send(payload)
            .await
            .map_err(|_| ShareError::TransportClosed("Peer closed".to_string()))
    }

    /// Whether the send buffer is currently full
    pub fn is_backlogged(&self) -> bool {
        self.outbound.capacity() == 0
    }

    /// Subscribe to decoded inbound payloads
    pub fn subscribe_data(&self) -> broadcast::Receiver<PeerPayload> {
        self.data.subscribe()
    }

    /// Watch for the closed flag
    pub fn subscribe_close(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    fn mark_connected(&self) {
        let mut state = self.state.write();
        if *state == PeerState::Connecting {
            *state = PeerState::Connected;
        }
    }

    fn mark_closed(&self) {
        *self.state.write() = PeerState::Closed;
        let _ = self.closed.send(true);
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

/// Events emitted by the peer manager
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A peer was created (it may still be connecting)
    PeerCreated {
        document_id: DocumentId,
        peer: Arc<Peer>,
    },
    /// A peer was torn down
    PeerDestroyed {
        document_id: DocumentId,
        peer: Arc<Peer>,
    },
}

/// Admission check for incoming offers.
pub trait SignalGate: Send + Sync {
    /// Whether an offer from `from` for `document_id` may create a peer
    fn allow(&self, from: &PeerAddr, document_id: &DocumentId) -> bool;
}

struct PeerEntry {
    peer: Arc<Peer>,
    remote_signals: mpsc::Sender<SignalBody>,
    tasks: Vec<JoinHandle<()>>,
}

type PeerMap = Arc<Mutex<HashMap<PeerKey, PeerEntry>>>;

/// Peer lifecycle manager.
///
/// Keys peers by `(document, remote public key, remote client id)`, drives
/// handshakes over the exchanger, and emits
/// [`PeerCreated`](PeerEvent::PeerCreated) /
/// [`PeerDestroyed`](PeerEvent::PeerDestroyed).
pub struct PeerManager {
    connector: Arc<dyn PeerConnector>,
    exchanger: Arc<MessageExchanger>,
    gate: RwLock<Option<Arc<dyn SignalGate>>>,
    peers: PeerMap,
    events: broadcast::Sender<PeerEvent>,
}

impl PeerManager {
    /// Create a manager over a transport and an exchanger.
    ///
    /// The manager does not subscribe to messages itself: the owning client
    /// feeds `signal` messages through [`handle_signal`](Self::handle_signal)
    /// from its single dispatcher, which keeps signal handling ordered with
    /// the rest of the message stream.
    pub fn new(connector: Arc<dyn PeerConnector>, exchanger: Arc<MessageExchanger>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            connector,
            exchanger,
            gate: RwLock::new(None),
            peers: Arc::new(Mutex::new(HashMap::new())),
            events,
        })
    }

    /// Install the admission gate for incoming offers.
    ///
    /// Without a gate every incoming offer is dropped.
    pub fn set_gate(&self, gate: Arc<dyn SignalGate>) {
        *self.gate.write() = Some(gate);
    }

    /// Subscribe to peer lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// All live peers for a document
    pub fn peers_for_document(&self, document_id: &DocumentId) -> Vec<Arc<Peer>> {
        self.peers
            .lock()
            .values()
            .filter(|e| e.peer.document_id() == document_id)
            .map(|e| e.peer.clone())
            .collect()
    }

    /// Number of live peers
    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Create a peer for `(document_id, remote)`.
    ///
    /// Initiators generate an offer immediately; responders wait for one.
    /// Idempotent: an existing peer for the key is returned as-is.
    pub fn create_peer(
        &self,
        initiator: bool,
        document_id: DocumentId,
        remote: PeerAddr,
    ) -> Arc<Peer> {
        let key = PeerKey {
            document_id: document_id.clone(),
            remote,
        };

        let mut peers = self.peers.lock();
        if let Some(entry) = peers.get(&key) {
            return entry.peer.clone();
        }

        debug!(%document_id, remote = %remote.public_key, initiator, "Creating peer");
        let handshake = self.connector.create(initiator);
        let (peer, outbound_rx) = Peer::new(key.clone());

        let mut tasks = Vec::new();

        // Forward locally produced signals to the remote side
        tasks.push(tokio::spawn(forward_local_signals(
            handshake.local_signals,
            self.exchanger.clone(),
            document_id.clone(),
            remote,
        )));

        // Wire the data channel once the transport reports established
        tasks.push(tokio::spawn(run_established(
            handshake.established,
            peer.clone(),
            outbound_rx,
            self.peers.clone(),
            self.events.clone(),
        )));

        peers.insert(
            key,
            PeerEntry {
                peer: peer.clone(),
                remote_signals: handshake.remote_signals,
                tasks,
            },
        );
        drop(peers);

        let _ = self.events.send(PeerEvent::PeerCreated {
            document_id,
            peer: peer.clone(),
        });
        peer
    }

    /// Tear down a peer and emit [`PeerEvent::PeerDestroyed`].
    pub fn destroy_peer(&self, key: &PeerKey) {
        destroy_entry(&self.peers, &self.events, key);
    }

    /// Send `bye` to every remote and tear all peers down.
    pub async fn shutdown(&self) {
        let keys: Vec<PeerKey> = self.peers.lock().keys().cloned().collect();
        for key in keys {
            let bye = Message::signal(key.document_id.as_str().to_string(), SignalBody::Bye);
            if let Err(e) = self
                .exchanger
                .send_message(&bye, Some(key.remote.into()))
                .await
            {
                debug!(error = %e, "Failed to send bye");
            }
            self.destroy_peer(&key);
        }
    }

    /// Process one inbound `signal` message.
    ///
    /// Offers for unknown peers pass the gate or are dropped silently;
    /// answers and ICE candidates feed the matching handshake; `bye` tears
    /// the peer down.
    pub async fn handle_signal(&self, from: PeerAddr, document_id: &str, body: SignalBody) {
        let Ok(document_id) = DocumentId::parse(document_id) else {
            debug!("Dropping signal with malformed document id");
            return;
        };
        let key = PeerKey {
            document_id: document_id.clone(),
            remote: from,
        };

        match body {
            SignalBody::Bye => {
                self.destroy_peer(&key);
            }
            SignalBody::Sdp(sdp) if sdp.kind == "offer" => {
                let existing = self.peers.lock().get(&key).map(|e| e.remote_signals.clone());
                let signals = match existing {
                    Some(signals) => signals,
                    None => {
                        // Gate before admitting a new inbound peer
                        let allowed = self
                            .gate
                            .read()
                            .as_ref()
                            .is_some_and(|g| g.allow(&from, &document_id));
                        if !allowed {
                            debug!(
                                from = %from.public_key,
                                %document_id,
                                "Dropping unauthorized offer"
                            );
                            return;
                        }
                        self.create_peer(false, document_id, from);
                        match self.peers.lock().get(&key) {
                            Some(entry) => entry.remote_signals.clone(),
                            None => return,
                        }
                    }
                };
                let _ = signals.send(SignalBody::Sdp(sdp)).await;
            }
            body => {
                // Answers and ICE only make sense for a peer we already have
                let signals = self.peers.lock().get(&key).map(|e| e.remote_signals.clone());
                match signals {
                    Some(signals) => {
                        let _ = signals.send(body).await;
                    }
                    None => debug!(%document_id, "Dropping signal for unknown peer"),
                }
            }
        }
    }
}

impl std::fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerManager")
            .field("peers", &self.peer_count())
            .finish_non_exhaustive()
    }
}

impl Drop for PeerManager {
    fn drop(&mut self) {
        for (_, entry) in self.peers.lock().drain() {
            entry.peer.mark_closed();
            for task in entry.tasks {
                task.abort();
            }
        }
    }
}

fn destroy_entry(peers: &PeerMap, events: &broadcast::Sender<PeerEvent>, key: &PeerKey) {
    let entry = peers.lock().remove(key);
    if let Some(entry) = entry {
        entry.peer.mark_closed();
        for task in &entry.tasks {
            task.abort();
        }
        let _ = events.send(PeerEvent::PeerDestroyed {
            document_id: key.document_id.clone(),
            peer: entry.peer,
        });
    }
}

async fn forward_local_signals(
    mut local: mpsc::Receiver<SignalBody>,
    exchanger: Arc<MessageExchanger>,
    document_id: DocumentId,
    remote: PeerAddr,
) {
    while let Some(body) = local.recv().await {
        let message = Message::signal(document_id.as_str().to_string(), body);
        if let Err(e) = exchanger.send_message(&message, Some(remote.into())).await {
            debug!(error = %e, "Failed to forward signal");
        }
    }
}

async fn run_established(
    established: oneshot::Receiver<PeerChannel>,
    peer: Arc<Peer>,
    mut outbound_rx: mpsc::Receiver<PeerPayload>,
    peers: PeerMap,
    events: broadcast::Sender<PeerEvent>,
) {
    let Ok(channel) = established.await else {
        debug!(key = ?peer.key(), "Peer handshake failed");
        destroy_entry(&peers, &events, &peer.key().clone());
        return;
    };

    peer.mark_connected();
    debug!(key = ?peer.key(), "Peer data channel open");

    let PeerChannel {
        outbound: wire_tx,
        inbound: mut wire_rx,
    } = channel;

    // Writer: encode queued payloads onto the wire, strictly FIFO
    let writer = tokio::spawn(async move {
        while let Some(payload) = outbound_rx.recv().await {
            let Ok(bytes) = postcard::to_allocvec(&payload) else {
                continue;
            };
            if wire_tx.send(bytes).await.is_err() {
                break;
            }
        }
    });

    // Reader: decode inbound frames and fan them out
    while let Some(bytes) = wire_rx.recv().await {
        match postcard::from_bytes::<PeerPayload>(&bytes) {
            Ok(payload) => {
                let _ = peer.data.send(payload);
            }
            Err(e) => debug!(error = %e, "Dropping undecodable peer frame"),
        }
    }

    writer.abort();
    destroy_entry(&peers, &events, &peer.key().clone());
}

/// In-process peer transport.
///
/// Drives a faithful offer/answer/ICE exchange through the real signaling
/// path, then connects both sides with in-memory channels. Clones share a
/// rendezvous table, so every participant of a test must use clones of the
/// same connector.
#[derive(Clone, Default)]
pub struct LoopbackConnector {
    pending: Arc<Mutex<HashMap<String, PeerChannel>>>,
}

impl LoopbackConnector {
    /// Create a loopback transport
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeerConnector for LoopbackConnector {
    fn create(&self, initiator: bool) -> PeerHandshake {
        let (local_tx, local_rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        let (remote_tx, mut remote_rx) = mpsc::channel::<SignalBody>(SIGNAL_CHANNEL_CAPACITY);
        let (established_tx, established_rx) = oneshot::channel();
        let pending = self.pending.clone();

        if initiator {
            tokio::spawn(async move {
                // The offer carries a rendezvous token in place of real SDP
                let mut token_bytes = [0u8; 16];
                rand::RngCore::fill_bytes(&mut rand::rng(), &mut token_bytes);
                let token = bs58::encode(token_bytes).into_string();

                let offer = SignalBody::Sdp(SessionDescription {
                    kind: "offer".to_string(),
                    sdp: token.clone(),
                });
                if local_tx.send(offer).await.is_err() {
                    return;
                }

                while let Some(signal) = remote_rx.recv().await {
                    match signal {
                        SignalBody::Sdp(sdp) if sdp.kind == "answer" && sdp.sdp == token => {
                            let _ = local_tx
                                .send(SignalBody::Ice(placeholder_candidate()))
                                .await;
                            let channel = pending.lock().remove(&token);
                            if let Some(channel) = channel {
                                let _ = established_tx.send(channel);
                            }
                            return;
                        }
                        _ => continue,
                    }
                }
            });
        } else {
            tokio::spawn(async move {
                while let Some(signal) = remote_rx.recv().await {
                    match signal {
                        SignalBody::Sdp(sdp) if sdp.kind == "offer" => {
                            let token = sdp.sdp;

                            // Build the duplex pipe and park the initiator's
                            // half under the token before answering
                            let (a_tx, b_rx) = mpsc::channel(PEER_HIGH_WATER);
                            let (b_tx, a_rx) = mpsc::channel(PEER_HIGH_WATER);
                            pending.lock().insert(
                                token.clone(),
                                PeerChannel {
                                    outbound: a_tx,
                                    inbound: a_rx,
                                },
                            );

                            let answer = SignalBody::Sdp(SessionDescription {
                                kind: "answer".to_string(),
                                sdp: token,
                            });
                            if local_tx.send(answer).await.is_err() {
                                return;
                            }
                            let _ = local_tx
                                .send(SignalBody::Ice(placeholder_candidate()))
                                .await;

                            let _ = established_tx.send(PeerChannel {
                                outbound: b_tx,
                                inbound: b_rx,
                            });
                            return;
                        }
                        _ => continue,
                    }
                }
            });
        }

        PeerHandshake {
            local_signals: local_rx,
            remote_signals: remote_tx,
            established: established_rx,
        }
    }
}

fn placeholder_candidate() -> IceCandidate {
    IceCandidate {
        candidate: "candidate:0 1 udp 0 0.0.0.0 0 typ host".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SessionManager;
    use crate::sync::relay::LocalRelay;
    use crate::sync::signaling::SignalingClient;
    use std::time::Duration;

    struct AllowAll;
    impl SignalGate for AllowAll {
        fn allow(&self, _from: &PeerAddr, _document_id: &DocumentId) -> bool {
            true
        }
    }

    struct DenyAll;
    impl SignalGate for DenyAll {
        fn allow(&self, _from: &PeerAddr, _document_id: &DocumentId) -> bool {
            false
        }
    }

    /// Feed inbound signals into the manager, as the sharing client's
    /// dispatcher does in production.
    fn spawn_signal_pump(manager: Arc<PeerManager>, exchanger: &MessageExchanger) {
        let mut events = exchanger.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some((id, body)) = event.message.signal_body() {
                            let id = id.to_string();
                            manager.handle_signal(event.from, &id, body).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn test_client(
        relay: &LocalRelay,
        loopback: &LoopbackConnector,
    ) -> (Arc<PeerManager>, PeerAddr) {
        let session = Arc::new(SessionManager::generate());
        let addr = PeerAddr {
            public_key: session.public_key(),
            client_id: session.client_id(),
        };
        let client = Arc::new(SignalingClient::new(session, Arc::new(relay.connector())));
        client.connect();
        client.wait_for_connection().await.unwrap();
        let exchanger = Arc::new(MessageExchanger::new(client));
        let manager = PeerManager::new(Arc::new(loopback.clone()), exchanger.clone());
        spawn_signal_pump(manager.clone(), &exchanger);
        (manager, addr)
    }

    fn test_document_id() -> DocumentId {
        use crate::document::Address;
        use crate::identity::Keypair;
        Address::new(Keypair::generate().public_key())
            .document_id()
            .clone()
    }

    async fn wait_connected(peer: &Arc<Peer>) {
        for _ in 0..100 {
            if peer.state() == PeerState::Connected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("peer never connected: {:?}", peer);
    }

    #[tokio::test]
    async fn test_peer_handshake_and_data() {
        let relay = LocalRelay::new();
        let loopback = LoopbackConnector::new();
        let (alice, alice_addr) = test_client(&relay, &loopback).await;
        let (bob, bob_addr) = test_client(&relay, &loopback).await;
        bob.set_gate(Arc::new(AllowAll));

        let doc_id = test_document_id();
        let peer = alice.create_peer(true, doc_id.clone(), bob_addr);
        wait_connected(&peer).await;
        assert!(!peer.is_backlogged());

        // Bob's side created a responder peer keyed to Alice
        let bob_peers = bob.peers_for_document(&doc_id);
        assert_eq!(bob_peers.len(), 1);
        assert_eq!(bob_peers[0].remote(), alice_addr);
        wait_connected(&bob_peers[0]).await;

        // Data flows both ways
        let mut bob_data = bob_peers[0].subscribe_data();
        peer.send(PeerPayload::Sync(vec![1, 2, 3])).await.unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(5), bob_data.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(payload, PeerPayload::Sync(ref data) if data == &vec![1, 2, 3]));

        let mut alice_data = peer.subscribe_data();
        bob_peers[0]
            .send(PeerPayload::Presence(vec![9]))
            .await
            .unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(5), alice_data.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(payload, PeerPayload::Presence(ref data) if data == &vec![9]));
    }

    #[tokio::test]
    async fn test_gate_drops_unauthorized_offer() {
        let relay = LocalRelay::new();
        let loopback = LoopbackConnector::new();
        let (alice, _) = test_client(&relay, &loopback).await;
        let (bob, bob_addr) = test_client(&relay, &loopback).await;
        bob.set_gate(Arc::new(DenyAll));

        let doc_id = test_document_id();
        alice.create_peer(true, doc_id.clone(), bob_addr);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(bob.peers_for_document(&doc_id).is_empty());
    }

    #[tokio::test]
    async fn test_missing_gate_drops_offer() {
        let relay = LocalRelay::new();
        let loopback = LoopbackConnector::new();
        let (alice, _) = test_client(&relay, &loopback).await;
        let (bob, bob_addr) = test_client(&relay, &loopback).await;
        // No gate installed on bob

        let doc_id = test_document_id();
        alice.create_peer(true, doc_id.clone(), bob_addr);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bob.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_bye_destroys_peer() {
        let relay = LocalRelay::new();
        let loopback = LoopbackConnector::new();
        let (alice, _) = test_client(&relay, &loopback).await;
        let (bob, bob_addr) = test_client(&relay, &loopback).await;
        bob.set_gate(Arc::new(AllowAll));

        let doc_id = test_document_id();
        let peer = alice.create_peer(true, doc_id.clone(), bob_addr);
        wait_connected(&peer).await;

        let mut bob_events = bob.subscribe();
        // Drain the created event if still buffered
        while let Ok(event) = bob_events.try_recv() {
            let _ = event;
        }

        alice.shutdown().await;
        assert_eq!(alice.peer_count(), 0);

        // Bob receives the bye and destroys his side
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if bob.peer_count() == 0 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "bye never arrived");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(peer.state(), PeerState::Closed);
        assert!(*peer.subscribe_close().borrow());
    }

    #[tokio::test]
    async fn test_create_peer_is_idempotent() {
        let relay = LocalRelay::new();
        let loopback = LoopbackConnector::new();
        let (alice, _) = test_client(&relay, &loopback).await;
        let (_bob, bob_addr) = test_client(&relay, &loopback).await;

        let doc_id = test_document_id();
        let p1 = alice.create_peer(true, doc_id.clone(), bob_addr);
        let p2 = alice.create_peer(true, doc_id, bob_addr);
        assert!(Arc::ptr_eq(&p1, &p2));
        assert_eq!(alice.peer_count(), 1);
    }
}
