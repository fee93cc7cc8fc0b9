//! Ephemeral per-document presence
//!
//! Presence state (cursor position, selection) rides the same peer data
//! channels as sync messages but never touches the document or storage: it
//! exists only while the peers are connected and is pruned when they leave.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::document::DocumentId;
use crate::sync::peer::{Peer, PeerEvent, PeerManager, PeerPayload};
use crate::sync::signaling::PeerAddr;

/// Default capacity for the presence event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Ephemeral state one participant shows the others.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    /// Pointer position in document coordinates
    pub cursor: Option<(f64, f64)>,
    /// Ids of the currently selected elements
    pub selection: Vec<String>,
}

/// Presence notifications for one document
#[derive(Debug, Clone)]
pub enum PresenceEvent {
    /// A remote participant announced new state
    Updated {
        peer: PeerAddr,
        state: PresenceState,
    },
    /// A remote participant's peer closed
    Left { peer: PeerAddr },
}

/// Presence tracker for one document.
pub struct DocumentPresence {
    document_id: DocumentId,
    manager: Arc<PeerManager>,
    local: Arc<RwLock<PresenceState>>,
    remote: Arc<RwLock<HashMap<PeerAddr, PresenceState>>>,
    events: broadcast::Sender<PresenceEvent>,
    task: JoinHandle<()>,
}

impl DocumentPresence {
    /// Attach presence tracking to a document's peers.
    pub fn spawn(document_id: DocumentId, manager: Arc<PeerManager>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let local = Arc::new(RwLock::new(PresenceState::default()));
        let remote = Arc::new(RwLock::new(HashMap::new()));

        let task = tokio::spawn(run(
            document_id.clone(),
            manager.clone(),
            local.clone(),
            remote.clone(),
            events.clone(),
        ));

        Self {
            document_id,
            manager,
            local,
            remote,
            events,
            task,
        }
    }

    /// Subscribe to remote presence changes
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    /// The document this tracker belongs to
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// Our currently announced state
    pub fn local_state(&self) -> PresenceState {
        self.local.read().clone()
    }

    /// Last known state of every connected participant
    pub fn remote_states(&self) -> HashMap<PeerAddr, PresenceState> {
        self.remote.read().clone()
    }

    /// Announce new local state to every connected peer of the document.
    pub async fn set_local_state(&self, state: PresenceState) {
        *self.local.write() = state.clone();
        let Ok(bytes) = postcard::to_allocvec(&state) else {
            return;
        };
        for peer in self.manager.peers_for_document(&self.document_id) {
            let _ = peer.send(PeerPayload::Presence(bytes.clone())).await;
        }
    }
}

impl Drop for DocumentPresence {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for DocumentPresence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentPresence")
            .field("document_id", &self.document_id)
            .finish_non_exhaustive()
    }
}

async fn run(
    id: DocumentId,
    manager: Arc<PeerManager>,
    local: Arc<RwLock<PresenceState>>,
    remote: Arc<RwLock<HashMap<PeerAddr, PresenceState>>>,
    events: broadcast::Sender<PresenceEvent>,
) {
    let mut peer_events = manager.subscribe();
    let (inbound_tx, mut inbound) = mpsc::unbounded_channel::<(PeerAddr, PresenceState)>();
    let mut readers: HashMap<PeerAddr, JoinHandle<()>> = HashMap::new();

    for peer in manager.peers_for_document(&id) {
        attach(&mut readers, &inbound_tx, &local, peer).await;
    }

    loop {
        tokio::select! {
            event = peer_events.recv() => match event {
                Ok(PeerEvent::PeerCreated { document_id, peer }) if document_id == id => {
                    attach(&mut readers, &inbound_tx, &local, peer).await;
                }
                Ok(PeerEvent::PeerDestroyed { document_id, peer }) if document_id == id => {
                    let addr = peer.remote();
                    if let Some(reader) = readers.remove(&addr) {
                        reader.abort();
                    }
                    if remote.write().remove(&addr).is_some() {
                        let _ = events.send(PresenceEvent::Left { peer: addr });
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },

            message = inbound.recv() => {
                let Some((addr, state)) = message else { break };
                remote.write().insert(addr, state.clone());
                let _ = events.send(PresenceEvent::Updated { peer: addr, state });
            }
        }
    }

    for reader in readers.values() {
        reader.abort();
    }
    debug!(%id, "Presence tracker stopped");
}

async fn attach(
    readers: &mut HashMap<PeerAddr, JoinHandle<()>>,
    inbound_tx: &mpsc::UnboundedSender<(PeerAddr, PresenceState)>,
    local: &Arc<RwLock<PresenceState>>,
    peer: Arc<Peer>,
) {
    let addr = peer.remote();
    if readers.contains_key(&addr) {
        return;
    }

    let mut data = peer.subscribe_data();
    let tx = inbound_tx.clone();
    let reader = tokio::spawn(async move {
        loop {
            match data.recv().await {
                Ok(PeerPayload::Presence(bytes)) => {
                    match postcard::from_bytes::<PresenceState>(&bytes) {
                        Ok(state) => {
                            if tx.send((addr, state)).is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!(error = %e, "Dropping undecodable presence payload"),
                    }
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    readers.insert(addr, reader);

    // Introduce ourselves to the newcomer
    let state = local.read().clone();
    if state != PresenceState::default() {
        if let Ok(bytes) = postcard::to_allocvec(&state) {
            let _ = peer.send(PeerPayload::Presence(bytes)).await;
        }
    }
}
