//! Sharing client facade
//!
//! `SharingClient` wires everything together: one signaling session, one
//! message exchanger, one peer manager, one storage pipeline, and the
//! registry of live documents. It answers `request-document` broadcasts with
//! signed exports (for allowed users only), imports `document-response`
//! payloads, gates incoming peer offers by header ACLs, and attaches a
//! synchronizer plus presence tracker to every live document.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::document::{Document, DocumentEvent, DocumentId};
use crate::error::{ShareError, ShareResult};
use crate::identity::{Keypair, PublicKey, SessionManager};
use crate::registry::{DocumentRegistry, RegistryEvent};
use crate::storage::{Storage, StorageProvider};
use crate::sync::{
    Connector, DocumentPresence, DocumentSynchronizer, ExchangeEvent, Message, MessageExchanger,
    PeerAddr, PeerConnector, PeerManager, SignalGate, SignalingClient,
};

/// Deadline for `request_document`
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a sharing client needs to run.
pub struct ClientConfig {
    /// Transport to the signaling relay
    pub connector: Arc<dyn Connector>,
    /// Peer transport factory (the WebRTC seam)
    pub peer_connector: Arc<dyn PeerConnector>,
    /// Backing key/value store
    pub storage_provider: Arc<dyn StorageProvider>,
    /// Session identity
    pub session: Arc<SessionManager>,
}

impl ClientConfig {
    /// Assemble a config around an existing session.
    pub fn new(
        connector: Arc<dyn Connector>,
        peer_connector: Arc<dyn PeerConnector>,
        storage_provider: Arc<dyn StorageProvider>,
        session: Arc<SessionManager>,
    ) -> Self {
        Self {
            connector,
            peer_connector,
            storage_provider,
            session,
        }
    }

    /// Assemble a config from a bare private key.
    pub fn with_keypair(
        connector: Arc<dyn Connector>,
        peer_connector: Arc<dyn PeerConnector>,
        storage_provider: Arc<dyn StorageProvider>,
        keypair: Keypair,
    ) -> Self {
        Self::new(
            connector,
            peer_connector,
            storage_provider,
            Arc::new(SessionManager::new(keypair)),
        )
    }
}

/// Offer gate: the document must exist locally and the sender must be an
/// allowed user of its header.
struct RegistryGate {
    registry: Arc<DocumentRegistry>,
}

impl SignalGate for RegistryGate {
    fn allow(&self, from: &PeerAddr, document_id: &DocumentId) -> bool {
        match self.registry.find_document(document_id) {
            Ok(Some(document)) => document.header().has_allowed_user(&from.public_key),
            _ => false,
        }
    }
}

/// Public facade over the document-sharing core.
pub struct SharingClient {
    session: Arc<SessionManager>,
    signaling: Arc<SignalingClient>,
    exchanger: Arc<MessageExchanger>,
    peers: Arc<PeerManager>,
    storage: Storage,
    registry: Arc<DocumentRegistry>,
    presences: Arc<Mutex<HashMap<DocumentId, Arc<DocumentPresence>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SharingClient {
    /// Build a client from its configuration.
    ///
    /// Background dispatchers start immediately; the relay connection does
    /// not open until [`connect`](Self::connect).
    pub fn new(config: ClientConfig) -> Self {
        let session = config.session;
        let storage = Storage::new(config.storage_provider, &session);
        let registry = Arc::new(DocumentRegistry::new(storage.clone()));

        let signaling = Arc::new(SignalingClient::new(session.clone(), config.connector));
        let exchanger = Arc::new(MessageExchanger::new(signaling.clone()));
        let peers = PeerManager::new(config.peer_connector, exchanger.clone());
        peers.set_gate(Arc::new(RegistryGate {
            registry: registry.clone(),
        }));

        let presences = Arc::new(Mutex::new(HashMap::new()));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(run_dispatch(
            exchanger.subscribe(),
            session.clone(),
            exchanger.clone(),
            peers.clone(),
            registry.clone(),
        )));
        tasks.push(tokio::spawn(run_attach(
            registry.subscribe(),
            peers.clone(),
            storage.clone(),
            presences.clone(),
        )));

        Self {
            session,
            signaling,
            exchanger,
            peers,
            storage,
            registry,
            presences,
            tasks: Mutex::new(tasks),
        }
    }

    /// Start the relay connection loop
    pub fn connect(&self) {
        self.signaling.connect();
    }

    /// Wait until the relay session is authenticated
    pub async fn wait_for_connection(&self) -> ShareResult<()> {
        self.signaling.wait_for_connection().await
    }

    /// Tear down peers (with `bye`) and close the relay connection.
    ///
    /// Documents and storage state are preserved; `connect` may be called
    /// again afterwards.
    pub async fn disconnect(&self) {
        info!("Disconnecting sharing client");
        self.peers.shutdown().await;
        self.signaling.disconnect().await;
    }

    /// Create, register, and persist a new document owned by this session.
    pub fn create_document(
        &self,
        allowed_users: impl IntoIterator<Item = PublicKey>,
        metadata: BTreeMap<String, String>,
    ) -> ShareResult<Arc<Document>> {
        let document = Document::create(self.session.keypair(), allowed_users, metadata);
        self.registry.set_document(document)
    }

    /// Fetch a document: locally if present, otherwise by broadcasting a
    /// `request-document` and racing the response against a 5-second
    /// deadline.
    ///
    /// On timeout the pending wait is dropped, but a late response still
    /// registers normally.
    pub async fn request_document(&self, id: &DocumentId) -> ShareResult<Arc<Document>> {
        // Subscribe before looking locally so nothing slips between
        let mut events = self.registry.subscribe();

        if let Some(document) = self.registry.find_document(id)? {
            return Ok(document);
        }

        debug!(%id, "Broadcasting document request");
        self.exchanger
            .send_message(
                &Message::RequestDocument {
                    document_id: id.to_string(),
                },
                None,
            )
            .await?;

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(RegistryEvent::DocumentAdded { id: got, document }) if &got == id => {
                        return Ok(document);
                    }
                    Ok(RegistryEvent::DocumentUpdated { id: got }) if &got == id => {
                        if let Some(document) = self.registry.find_document(id)? {
                            return Ok(document);
                        }
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(document) = self.registry.find_document(id)? {
                            return Ok(document);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(ShareError::TransportClosed(
                            "Registry closed while waiting".to_string(),
                        ));
                    }
                }
            }
        };

        match tokio::time::timeout(REQUEST_TIMEOUT, wait).await {
            Ok(result) => result,
            Err(_) => Err(ShareError::DocumentRequestTimeout(id.to_string())),
        }
    }

    /// Look up a document locally (memory, then storage)
    pub fn find_document(&self, id: &DocumentId) -> ShareResult<Option<Arc<Document>>> {
        self.registry.find_document(id)
    }

    /// Destroy a document and delete its storage records.
    pub fn remove_document(&self, id: &DocumentId) -> ShareResult<bool> {
        let removed = self.registry.remove_document(id);
        self.storage.remove(id)?;
        Ok(removed)
    }

    /// Ids of all persisted documents
    pub fn list_document_ids(&self) -> ShareResult<Vec<DocumentId>> {
        self.registry.list_document_ids()
    }

    /// Presence tracker for a live document
    pub fn presence(&self, id: &DocumentId) -> Option<Arc<DocumentPresence>> {
        self.presences.lock().get(id).cloned()
    }

    /// Subscribe to document lifecycle events
    pub fn subscribe_documents(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    /// The session identity
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// The storage pipeline
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// The document registry
    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    /// The peer manager
    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    /// The signaling client
    pub fn signaling(&self) -> &Arc<SignalingClient> {
        &self.signaling
    }
}

impl Drop for SharingClient {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SharingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharingClient")
            .field("public_key", &self.session.public_key())
            .finish_non_exhaustive()
    }
}

/// Handle inbound exchanger messages in arrival order.
///
/// Signals route through the peer manager from here so that a document
/// response is always processed before the offer that follows it.
async fn run_dispatch(
    mut events: broadcast::Receiver<ExchangeEvent>,
    session: Arc<SessionManager>,
    exchanger: Arc<MessageExchanger>,
    peers: Arc<PeerManager>,
    registry: Arc<DocumentRegistry>,
) {
    loop {
        match events.recv().await {
            Ok(ExchangeEvent { from, message }) => match message {
                Message::RequestDocument { document_id } => {
                    handle_request_document(
                        &session,
                        &exchanger,
                        &peers,
                        &registry,
                        from,
                        &document_id,
                    )
                    .await;
                }
                Message::DocumentResponse { document } => {
                    handle_document_response(&registry, from, &document);
                }
                signal @ Message::Signal { .. } => {
                    if let Some((document_id, body)) = signal.signal_body() {
                        let document_id = document_id.to_string();
                        peers.handle_signal(from, &document_id, body).await;
                    }
                }
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(missed = n, "Client dispatcher lagged behind messages");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn handle_request_document(
    session: &Arc<SessionManager>,
    exchanger: &Arc<MessageExchanger>,
    peers: &Arc<PeerManager>,
    registry: &Arc<DocumentRegistry>,
    from: PeerAddr,
    document_id: &str,
) {
    let Ok(id) = DocumentId::parse(document_id) else {
        debug!("Dropping request with malformed document id");
        return;
    };

    let document = match registry.find_document(&id) {
        Ok(Some(document)) => document,
        Ok(None) => {
            debug!(%id, "Requested document not held here");
            return;
        }
        Err(e) => {
            warn!(%id, error = %e, "Lookup failed for requested document");
            return;
        }
    };

    // ACL check: requesters outside the allowed set get nothing, not even
    // an error
    if !document.header().has_allowed_user(&from.public_key) {
        debug!(%id, from = %from.public_key, "Dropping request from non-allowed user");
        return;
    }

    let export = match document.export(session.keypair()) {
        Ok(export) => export,
        Err(e) => {
            warn!(%id, error = %e, "Cannot export requested document");
            return;
        }
    };

    debug!(%id, to = %from.public_key, "Answering document request");
    if let Err(e) = exchanger
        .send_message(&Message::DocumentResponse { document: export }, Some(from.into()))
        .await
    {
        warn!(%id, error = %e, "Failed to send document response");
        return;
    }

    // Open the data channel for ongoing sync
    peers.create_peer(true, id, from);
}

fn handle_document_response(registry: &Arc<DocumentRegistry>, from: PeerAddr, bytes: &[u8]) {
    match Document::import(bytes) {
        Ok(document) => {
            let id = document.id();
            // Unsolicited responses register like any other
            match registry.set_document(document) {
                Ok(_) => debug!(%id, from = %from.public_key, "Imported document response"),
                Err(e) => debug!(%id, error = %e, "Document response rejected"),
            }
        }
        Err(e) => {
            warn!(from = %from.public_key, error = %e, "Dropping invalid document response");
        }
    }
}

/// Attach a synchronizer, presence tracker, and change-triggered save watch
/// to every document that becomes live.
async fn run_attach(
    mut events: broadcast::Receiver<RegistryEvent>,
    peers: Arc<PeerManager>,
    storage: Storage,
    presences: Arc<Mutex<HashMap<DocumentId, Arc<DocumentPresence>>>>,
) {
    let mut synchronizers: HashMap<DocumentId, DocumentSynchronizer> = HashMap::new();

    loop {
        match events.recv().await {
            Ok(RegistryEvent::DocumentAdded { id, document }) => {
                debug!(%id, "Attaching synchronizer and presence");
                synchronizers.insert(
                    id.clone(),
                    DocumentSynchronizer::spawn(&document, peers.clone()),
                );
                presences.lock().insert(
                    id.clone(),
                    Arc::new(DocumentPresence::spawn(id.clone(), peers.clone())),
                );
                tokio::spawn(run_save_watch(document, storage.clone()));
            }
            Ok(RegistryEvent::DocumentDestroyed { id }) => {
                synchronizers.remove(&id);
                presences.lock().remove(&id);
            }
            Ok(RegistryEvent::DocumentUpdated { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(missed = n, "Attach loop lagged behind registry events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Persist a document's changes through the debounced save path; on destroy,
/// flush the pending save so the final write is never lost.
async fn run_save_watch(document: Arc<Document>, storage: Storage) {
    let mut events = document.subscribe();
    let id = document.id();
    loop {
        match events.recv().await {
            Ok(DocumentEvent::Changed { .. }) => {
                storage.save_later(document.clone());
            }
            Ok(DocumentEvent::HeaderUpdated { .. }) => {
                // Header changes are rare and authorization-critical;
                // persist them immediately rather than debounced
                if let Err(e) = storage.set_document(&document) {
                    warn!(%id, error = %e, "Failed to persist updated header");
                }
            }
            Ok(DocumentEvent::Destroyed { .. }) => {
                storage.flush(&id).await;
                break;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {
                storage.save_later(document.clone());
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
