//! Per-document CRDT synchronization
//!
//! One synchronizer runs per live document. It tracks a sync state per peer,
//! marks peers dirty on local changes and inbound messages, and flushes
//! dirty peers on a 16 ms coalescing tick so bursts of edits become one
//! round of messages. Outbound sends await on the peer's bounded channel,
//! which is the backpressure mechanism; inbound processing is never paused.
//!
//! The synchronizer holds only a weak reference to its document: it must
//! not keep a destroyed document alive, and it stops when the document is
//! destroyed or dropped.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::document::{Document, DocumentEvent, DocumentHeader, DocumentId, SyncState};
use crate::sync::peer::{Peer, PeerEvent, PeerManager, PeerPayload};
use crate::sync::signaling::PeerAddr;

/// Outbound coalescing tick
const FLUSH_INTERVAL: Duration = Duration::from_millis(16);

struct PeerSync {
    peer: Arc<Peer>,
    state: SyncState,
    dirty: bool,
    reader: JoinHandle<()>,
}

/// Driver of the CRDT sync protocol across all peers of one document.
pub struct DocumentSynchronizer {
    task: JoinHandle<()>,
}

impl DocumentSynchronizer {
    /// Attach a synchronizer to a document and start its background task.
    pub fn spawn(document: &Arc<Document>, manager: Arc<PeerManager>) -> Self {
        let id = document.id();
        let events = document.subscribe();
        let weak = Arc::downgrade(document);
        let task = tokio::spawn(run(id, weak, events, manager));
        Self { task }
    }

    /// Stop the synchronizer
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for DocumentSynchronizer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    id: DocumentId,
    weak: Weak<Document>,
    mut doc_events: broadcast::Receiver<DocumentEvent>,
    manager: Arc<PeerManager>,
) {
    debug!(%id, "Synchronizer started");

    let mut peer_events = manager.subscribe();
    let (inbound_tx, mut inbound) = mpsc::unbounded_channel::<(PeerAddr, PeerPayload)>();
    let mut peers: HashMap<PeerAddr, PeerSync> = HashMap::new();

    for peer in manager.peers_for_document(&id) {
        attach(&mut peers, &inbound_tx, &weak, peer).await;
    }

    let mut tick = tokio::time::interval(FLUSH_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = peer_events.recv() => match event {
                Ok(PeerEvent::PeerCreated { document_id, peer }) if document_id == id => {
                    attach(&mut peers, &inbound_tx, &weak, peer).await;
                }
                Ok(PeerEvent::PeerDestroyed { document_id, peer }) if document_id == id => {
                    if let Some(entry) = peers.remove(&peer.remote()) {
                        entry.reader.abort();
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(%id, missed = n, "Synchronizer lagged behind peer events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            event = doc_events.recv() => match event {
                Ok(DocumentEvent::Changed { .. }) => {
                    for entry in peers.values_mut() {
                        entry.dirty = true;
                    }
                }
                Ok(DocumentEvent::HeaderUpdated { .. }) => {
                    broadcast_header(&weak, &peers).await;
                }
                Ok(DocumentEvent::Destroyed { .. }) => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // Missed events: conservatively resync everyone
                    for entry in peers.values_mut() {
                        entry.dirty = true;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            message = inbound.recv() => {
                let Some((addr, payload)) = message else { break };
                if !handle_inbound(&id, &weak, &mut peers, addr, payload) {
                    break;
                }
            }

            _ = tick.tick() => {
                if !flush_dirty(&weak, &mut peers).await {
                    break;
                }
            }
        }
    }

    for entry in peers.values() {
        entry.reader.abort();
    }
    debug!(%id, "Synchronizer stopped");
}

async fn attach(
    peers: &mut HashMap<PeerAddr, PeerSync>,
    inbound_tx: &mpsc::UnboundedSender<(PeerAddr, PeerPayload)>,
    weak: &Weak<Document>,
    peer: Arc<Peer>,
) {
    let addr = peer.remote();
    if peers.contains_key(&addr) {
        return;
    }

    let mut data = peer.subscribe_data();
    let tx = inbound_tx.clone();
    let reader = tokio::spawn(async move {
        loop {
            match data.recv().await {
                Ok(payload) => {
                    if tx.send((addr, payload)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Announce our header so the remote converges on the newest ACL
    if let Some(doc) = weak.upgrade() {
        if let Ok(bytes) = doc.header().export() {
            let _ = peer.send(PeerPayload::Header(bytes)).await;
        }
    }

    peers.insert(
        addr,
        PeerSync {
            peer,
            state: SyncState::new(),
            dirty: true,
            reader,
        },
    );
}

/// Returns `false` when the document is gone and the synchronizer must stop.
fn handle_inbound(
    id: &DocumentId,
    weak: &Weak<Document>,
    peers: &mut HashMap<PeerAddr, PeerSync>,
    addr: PeerAddr,
    payload: PeerPayload,
) -> bool {
    let Some(doc) = weak.upgrade() else {
        return false;
    };

    match payload {
        PeerPayload::Sync(bytes) => {
            let Some(entry) = peers.get_mut(&addr) else {
                return true;
            };
            match doc.receive_sync_message(&mut entry.state, &bytes) {
                // A reply may be due either way; the tick will decide
                Ok(_) => entry.dirty = true,
                Err(e) => warn!(%id, error = %e, "Failed to apply sync message"),
            }
        }
        PeerPayload::Header(bytes) => match DocumentHeader::import(&bytes) {
            Ok(header) => {
                doc.update_header(header);
            }
            Err(e) => warn!(%id, error = %e, "Dropping invalid header from peer"),
        },
        // Presence payloads are consumed by DocumentPresence
        PeerPayload::Presence(_) => {}
    }
    true
}

/// Returns `false` when the document is gone.
async fn flush_dirty(weak: &Weak<Document>, peers: &mut HashMap<PeerAddr, PeerSync>) -> bool {
    for entry in peers.values_mut() {
        if !entry.dirty {
            continue;
        }
        let Some(doc) = weak.upgrade() else {
            return false;
        };
        while let Some(message) = doc.generate_sync_message(&mut entry.state) {
            if entry.peer.send(PeerPayload::Sync(message)).await.is_err() {
                break;
            }
        }
        entry.dirty = false;
    }
    true
}

async fn broadcast_header(weak: &Weak<Document>, peers: &HashMap<PeerAddr, PeerSync>) {
    let Some(doc) = weak.upgrade() else { return };
    let Ok(bytes) = doc.header().export() else {
        return;
    };
    for entry in peers.values() {
        let _ = entry.peer.send(PeerPayload::Header(bytes.clone())).await;
    }
}
