//! Encrypted storage pipeline
//!
//! Persists one record pair per document: the raw signed header under
//! `hdr/<id>` (plaintext, it is self-authenticating and needed to bootstrap)
//! and the CRDT binary under `bin/<id>`, sealed by the content-encrypting
//! wrapper. Saves triggered by document changes are debounced per document
//! on a 500 ms trailing edge and retried with backoff before surfacing a
//! storage error event.

mod debounce;
mod provider;
mod secure;

pub use debounce::Debouncer;
pub use provider::{MemoryProvider, RedbProvider, StorageProvider};
pub use secure::SecureProvider;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::document::{CrdtDoc, Document, DocumentHeader, DocumentId};
use crate::error::{ShareError, ShareResult};
use crate::identity::SessionManager;

/// Key prefix for signed header blobs
pub const HEADER_PREFIX: &str = "hdr/";
/// Key prefix for encrypted content blobs
pub const BINARY_PREFIX: &str = "bin/";

/// Debounce window for change-triggered saves
const SAVE_DEBOUNCE: Duration = Duration::from_millis(500);
/// Background save retry schedule: 3 attempts, 100/200/400 ms apart
const SAVE_MAX_ATTEMPTS: u32 = 3;
const SAVE_BASE_DELAY_MS: u64 = 100;

/// Default capacity for the storage event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events emitted by background storage work
#[derive(Debug, Clone)]
pub enum StorageEvent {
    /// A debounced save exhausted its retries
    SaveFailed {
        /// The document whose save failed
        id: DocumentId,
        /// The final error message
        error: String,
    },
}

/// Storage pipeline over a pluggable provider.
///
/// Cheap to clone; all clones share the provider and the debouncer.
#[derive(Clone)]
pub struct Storage {
    provider: Arc<dyn StorageProvider>,
    secure: Arc<SecureProvider>,
    saver: Arc<Debouncer<DocumentId>>,
    events: broadcast::Sender<StorageEvent>,
}

impl Storage {
    /// Build the pipeline over `provider`, deriving the content key from the
    /// session.
    pub fn new(provider: Arc<dyn StorageProvider>, session: &SessionManager) -> Self {
        let secure = Arc::new(SecureProvider::new(provider.clone(), &session.storage_key()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            provider,
            secure,
            saver: Arc::new(Debouncer::new(SAVE_DEBOUNCE)),
            events,
        }
    }

    /// Subscribe to background storage events
    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    /// Persist a document's header and content.
    ///
    /// The header write lands first; if the binary write then fails, reload
    /// still produces a live document with empty content.
    pub fn set_document(&self, doc: &Document) -> ShareResult<()> {
        let id = doc.id();
        let header = doc.header().export()?;
        self.provider.put(&header_key(&id), &header)?;
        self.save(doc)
    }

    /// Persist only a document's content binary.
    pub fn save(&self, doc: &Document) -> ShareResult<()> {
        let id = doc.id();
        let content = doc.snapshot();
        self.secure.put(&binary_key(&id), &content)
    }

    /// Schedule a debounced content save for a document.
    ///
    /// Bursts of changes coalesce into one write 500 ms after the last
    /// trigger. Failures retry with backoff and finally surface as
    /// [`StorageEvent::SaveFailed`].
    pub fn save_later(&self, doc: Arc<Document>) {
        let id = doc.id();
        let storage = self.clone();
        self.saver.trigger(id, move || async move {
            storage.save_with_retry(&doc).await;
        });
    }

    /// Run any pending debounced save for `id` immediately.
    pub async fn flush(&self, id: &DocumentId) {
        self.saver.flush(id).await;
    }

    /// Load and verify a stored header.
    pub fn load_header(&self, id: &DocumentId) -> ShareResult<Option<DocumentHeader>> {
        match self.provider.get(&header_key(id))? {
            Some(bytes) => Ok(Some(DocumentHeader::import(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load and decrypt a stored content binary.
    pub fn load_binary(&self, id: &DocumentId) -> ShareResult<Option<Vec<u8>>> {
        self.secure.get(&binary_key(id))
    }

    /// Load a full document (header plus content) from storage.
    pub fn load_document(&self, id: &DocumentId) -> ShareResult<Option<Document>> {
        let Some(header) = self.load_header(id)? else {
            return Ok(None);
        };
        let data = match self.load_binary(id)? {
            Some(bytes) if !bytes.is_empty() => CrdtDoc::load(&bytes)?,
            _ => CrdtDoc::new(),
        };
        Ok(Some(Document::from_parts(header, data)))
    }

    /// Remove a document's records and cancel any pending save.
    pub fn remove(&self, id: &DocumentId) -> ShareResult<()> {
        self.saver.cancel(id);
        self.provider.remove(&header_key(id))?;
        self.secure.remove(&binary_key(id))
    }

    /// List the ids of all stored documents.
    pub fn list(&self) -> ShareResult<Vec<DocumentId>> {
        let keys = self.provider.list(HEADER_PREFIX)?;
        let mut ids = Vec::with_capacity(keys.len());
        for key in keys {
            match DocumentId::parse(&key[HEADER_PREFIX.len()..]) {
                Ok(id) => ids.push(id),
                Err(e) => debug!(key, error = %e, "Skipping unparseable storage key"),
            }
        }
        Ok(ids)
    }

    async fn save_with_retry(&self, doc: &Document) {
        let id = doc.id();
        for attempt in 1..=SAVE_MAX_ATTEMPTS {
            match self.save(doc) {
                Ok(()) => {
                    debug!(%id, "Debounced save complete");
                    return;
                }
                Err(e) if attempt < SAVE_MAX_ATTEMPTS => {
                    let delay_ms = SAVE_BASE_DELAY_MS * (1 << (attempt - 1));
                    warn!(%id, attempt, delay_ms, error = %e, "Save failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(e) => {
                    warn!(%id, error = %e, "Save failed after all retries");
                    let _ = self.events.send(StorageEvent::SaveFailed {
                        id: id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }
}

fn header_key(id: &DocumentId) -> String {
    format!("{}{}", HEADER_PREFIX, id)
}

fn binary_key(id: &DocumentId) -> String {
    format!("{}{}", BINARY_PREFIX, id)
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use std::collections::BTreeMap;

    fn test_storage() -> (Storage, SessionManager) {
        let session = SessionManager::generate();
        let storage = Storage::new(Arc::new(MemoryProvider::new()), &session);
        (storage, session)
    }

    fn make_document(session: &SessionManager) -> Document {
        let mut metadata = BTreeMap::new();
        metadata.insert("title".to_string(), "stored".to_string());
        let doc = Document::create(session.keypair(), [], metadata);
        doc.update(|d| d.put("count", 3_u64)).unwrap();
        doc
    }

    #[test]
    fn test_set_and_load_document() {
        let (storage, session) = test_storage();
        let doc = make_document(&session);

        storage.set_document(&doc).unwrap();

        let loaded = storage.load_document(&doc.id()).unwrap().unwrap();
        assert_eq!(loaded.heads(), doc.heads());
        assert_eq!(loaded.get("count").unwrap().unwrap().to_u64(), Some(3));
        assert_eq!(loaded.header(), doc.header());
    }

    #[test]
    fn test_header_is_plaintext_binary_is_sealed() {
        let session = SessionManager::generate();
        let provider = Arc::new(MemoryProvider::new());
        let storage = Storage::new(provider.clone(), &session);
        let doc = make_document(&session);
        storage.set_document(&doc).unwrap();

        let id = doc.id();
        let raw_header = provider.get(&header_key(&id)).unwrap().unwrap();
        assert!(DocumentHeader::import(&raw_header).is_ok());

        let raw_binary = provider.get(&binary_key(&id)).unwrap().unwrap();
        assert_ne!(raw_binary, doc.snapshot());
    }

    #[test]
    fn test_list_and_remove() {
        let (storage, session) = test_storage();
        let doc1 = make_document(&session);
        let doc2 = make_document(&session);

        storage.set_document(&doc1).unwrap();
        storage.set_document(&doc2).unwrap();

        let mut ids = storage.list().unwrap();
        ids.sort();
        let mut expected = vec![doc1.id(), doc2.id()];
        expected.sort();
        assert_eq!(ids, expected);

        storage.remove(&doc1.id()).unwrap();
        assert!(storage.load_header(&doc1.id()).unwrap().is_none());
        assert!(storage.load_binary(&doc1.id()).unwrap().is_none());
        assert_eq!(storage.list().unwrap(), vec![doc2.id()]);
    }

    #[test]
    fn test_wrong_session_cannot_read_binary() {
        let provider = Arc::new(MemoryProvider::new());
        let alice = SessionManager::generate();
        let mallory = SessionManager::generate();

        let storage_a = Storage::new(provider.clone(), &alice);
        let doc = make_document(&alice);
        storage_a.set_document(&doc).unwrap();

        let storage_m = Storage::new(provider, &mallory);
        // Header is readable (self-authenticating), binary is not
        assert!(storage_m.load_header(&doc.id()).unwrap().is_some());
        assert!(storage_m.load_binary(&doc.id()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_later_coalesces() {
        let (storage, session) = test_storage();
        let doc = Arc::new(make_document(&session));
        storage.set_document(&doc).unwrap();

        doc.update(|d| d.put("count", 4_u64)).unwrap();
        storage.save_later(doc.clone());
        doc.update(|d| d.put("count", 5_u64)).unwrap();
        storage.save_later(doc.clone());

        // Before the window closes, the stored binary is stale
        tokio::time::sleep(Duration::from_millis(100)).await;
        let loaded = storage.load_document(&doc.id()).unwrap().unwrap();
        assert_eq!(loaded.get("count").unwrap().unwrap().to_u64(), Some(3));

        tokio::time::sleep(Duration::from_millis(600)).await;
        let loaded = storage.load_document(&doc.id()).unwrap().unwrap();
        assert_eq!(loaded.heads(), doc.heads());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_forces_pending_save() {
        let (storage, session) = test_storage();
        let doc = Arc::new(make_document(&session));
        storage.set_document(&doc).unwrap();

        doc.update(|d| d.put("count", 9_u64)).unwrap();
        storage.save_later(doc.clone());
        storage.flush(&doc.id()).await;

        let loaded = storage.load_document(&doc.id()).unwrap().unwrap();
        assert_eq!(loaded.get("count").unwrap().unwrap().to_u64(), Some(9));
    }
}
