//! In-memory registry of live documents
//!
//! The registry owns the `Arc<Document>` handles. Adding a document whose id
//! already exists merges the two instead of replacing; lookups fall through
//! to storage and adopt what they find.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::document::{Document, DocumentId};
use crate::error::ShareResult;
use crate::storage::Storage;

/// Default capacity for the registry event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Registry lifecycle events
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A document became live (created, imported, or adopted from storage)
    DocumentAdded {
        id: DocumentId,
        document: Arc<Document>,
    },
    /// An existing document absorbed new state
    DocumentUpdated { id: DocumentId },
    /// A document was destroyed and dropped from the registry
    DocumentDestroyed { id: DocumentId },
}

/// Registry of live documents backed by encrypted storage.
pub struct DocumentRegistry {
    documents: RwLock<HashMap<DocumentId, Arc<Document>>>,
    storage: Storage,
    events: broadcast::Sender<RegistryEvent>,
}

impl DocumentRegistry {
    /// Create a registry over a storage pipeline
    pub fn new(storage: Storage) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            documents: RwLock::new(HashMap::new()),
            storage,
            events,
        }
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register a document, merging when the id is already live.
    ///
    /// New documents are persisted and announced with
    /// [`RegistryEvent::DocumentAdded`]; merges persist the combined state
    /// and announce [`RegistryEvent::DocumentUpdated`].
    pub fn set_document(&self, document: Document) -> ShareResult<Arc<Document>> {
        let id = document.id();

        let existing = self.documents.read().get(&id).cloned();
        if let Some(existing) = existing {
            existing.merge_document(&document)?;
            self.storage.set_document(&existing)?;
            debug!(%id, "Merged incoming document into live copy");
            let _ = self.events.send(RegistryEvent::DocumentUpdated { id });
            return Ok(existing);
        }

        let document = Arc::new(document);
        self.documents.write().insert(id.clone(), document.clone());
        self.storage.set_document(&document)?;
        debug!(%id, "Registered document");
        let _ = self.events.send(RegistryEvent::DocumentAdded {
            id,
            document: document.clone(),
        });
        Ok(document)
    }

    /// Find a document in memory, falling through to storage.
    ///
    /// A document adopted from storage becomes live and is announced with
    /// [`RegistryEvent::DocumentAdded`].
    pub fn find_document(&self, id: &DocumentId) -> ShareResult<Option<Arc<Document>>> {
        if let Some(document) = self.documents.read().get(id) {
            return Ok(Some(document.clone()));
        }

        let Some(document) = self.storage.load_document(id)? else {
            return Ok(None);
        };
        let document = Arc::new(document);
        self.documents.write().insert(id.clone(), document.clone());
        debug!(%id, "Adopted document from storage");
        let _ = self.events.send(RegistryEvent::DocumentAdded {
            id: id.clone(),
            document: document.clone(),
        });
        Ok(Some(document))
    }

    /// Whether a document is currently live in memory
    pub fn contains(&self, id: &DocumentId) -> bool {
        self.documents.read().contains_key(id)
    }

    /// Destroy a live document and drop it from the registry.
    ///
    /// Storage records are untouched; callers remove them separately when
    /// the document should be gone for good.
    pub fn remove_document(&self, id: &DocumentId) -> bool {
        let removed = self.documents.write().remove(id);
        match removed {
            Some(document) => {
                document.destroy();
                let _ = self.events.send(RegistryEvent::DocumentDestroyed { id: id.clone() });
                true
            }
            None => false,
        }
    }

    /// Ids of all persisted documents
    pub fn list_document_ids(&self) -> ShareResult<Vec<DocumentId>> {
        self.storage.list()
    }

    /// The documents currently live in memory
    pub fn live_documents(&self) -> Vec<Arc<Document>> {
        self.documents.read().values().cloned().collect()
    }

    /// The storage pipeline behind this registry
    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

impl std::fmt::Debug for DocumentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentRegistry")
            .field("live", &self.documents.read().len())
            .finish_non_exhaustive()
    }
}
