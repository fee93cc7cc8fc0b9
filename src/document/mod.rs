//! Documents: a signed header paired with CRDT state
//!
//! A [`Document`] couples a [`DocumentHeader`] (identity and authorization)
//! with opaque CRDT content. It is shared as `Arc<Document>`; all state lives
//! behind one lock and observers subscribe to a typed event channel instead
//! of string-keyed emitters.

mod address;
mod crdt;
mod header;

pub use address::{Address, DocumentId, ADDRESS_NONCE_SIZE, ADDRESS_SIZE};
pub use crdt::{ChangeHash, CrdtDoc, Patch, ScalarValue, SyncState};
pub use header::DocumentHeader;

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{ShareError, ShareResult};
use crate::identity::{Keypair, PublicKey};

/// Default capacity for the document event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by a document
#[derive(Debug, Clone)]
pub enum DocumentEvent {
    /// The document heads moved after a local mutation or inbound sync
    Changed {
        /// The document that changed
        id: DocumentId,
        /// Heads after the change
        heads: Vec<ChangeHash>,
    },
    /// Detailed description of a mutation
    Patch {
        /// The document that was mutated
        id: DocumentId,
        /// Heads before the mutation
        before: Vec<ChangeHash>,
        /// Heads after the mutation
        after: Vec<ChangeHash>,
        /// Patches produced by the mutation
        patches: Vec<Patch>,
    },
    /// The header was replaced by a newer version
    HeaderUpdated {
        /// The document whose header changed
        id: DocumentId,
        /// The new header version
        version: u64,
    },
    /// The document was destroyed; no further events follow
    Destroyed {
        /// The document that was destroyed
        id: DocumentId,
    },
}

/// Signed export wire format: CBOR map `{header, content, signature}`.
#[derive(Serialize, Deserialize)]
struct SignedDocument {
    header: ByteBuf,
    content: ByteBuf,
    signature: ByteBuf,
}

struct DocumentInner {
    header: DocumentHeader,
    data: CrdtDoc,
    destroyed: bool,
    last_accessed: i64,
}

/// A shared document: header plus CRDT state.
pub struct Document {
    inner: Mutex<DocumentInner>,
    events: broadcast::Sender<DocumentEvent>,
}

impl Document {
    /// Create a new empty document owned by `keypair`.
    pub fn create(
        keypair: &Keypair,
        allowed_users: impl IntoIterator<Item = PublicKey>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        let header = DocumentHeader::create(keypair, allowed_users, metadata);
        Self::from_parts(header, CrdtDoc::new())
    }

    /// Assemble a document from an already-verified header and CRDT state.
    ///
    /// Used when adopting documents from storage.
    pub fn from_parts(header: DocumentHeader, data: CrdtDoc) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(DocumentInner {
                header,
                data,
                destroyed: false,
                last_accessed: chrono::Utc::now().timestamp_millis(),
            }),
            events,
        }
    }

    /// Decode and verify a signed export.
    ///
    /// The header must carry a valid owner signature and the content
    /// signature must verify under one of the allowed users (the exporter
    /// may be any member, so the owner is tried first, then the rest).
    pub fn import(bytes: &[u8]) -> ShareResult<Self> {
        let signed: SignedDocument = ciborium::from_reader(bytes)
            .map_err(|e| ShareError::Serialization(format!("Bad document export: {}", e)))?;

        let header = DocumentHeader::import(&signed.header)?;

        let signature = crate::identity::Signature::from_bytes(&signed.signature)
            .map_err(|e| ShareError::InvalidHeader(format!("Bad content signature: {}", e)))?;
        if !header.verify_signature_any(&signed.content, &signature) {
            return Err(ShareError::SignatureInvalid(format!(
                "Content signature does not verify for document {}",
                header.document_id()
            )));
        }

        let data = if signed.content.is_empty() {
            CrdtDoc::new()
        } else {
            CrdtDoc::load(&signed.content)?
        };

        Ok(Self::from_parts(header, data))
    }

    /// Produce a signed export of the current state.
    ///
    /// Fails with [`ShareError::Unauthorized`] unless `keypair` belongs to an
    /// allowed user.
    pub fn export(&self, keypair: &Keypair) -> ShareResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.last_accessed = chrono::Utc::now().timestamp_millis();

        if !inner.header.has_allowed_user(&keypair.public_key()) {
            return Err(ShareError::Unauthorized(format!(
                "{} is not an allowed user of document {}",
                keypair.public_key(),
                inner.header.document_id()
            )));
        }

        let header = inner.header.export()?;
        let content = inner.data.save();
        let signature = keypair.sign(&content);

        let signed = SignedDocument {
            header: ByteBuf::from(header),
            content: ByteBuf::from(content),
            signature: ByteBuf::from(signature.as_bytes().to_vec()),
        };

        let mut out = Vec::new();
        ciborium::into_writer(&signed, &mut out)
            .map_err(|e| ShareError::Serialization(format!("Failed to encode export: {}", e)))?;
        Ok(out)
    }

    /// Subscribe to document events
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.events.subscribe()
    }

    /// The document id
    pub fn id(&self) -> DocumentId {
        self.inner.lock().header.document_id().clone()
    }

    /// A snapshot of the current header
    pub fn header(&self) -> DocumentHeader {
        let mut inner = self.inner.lock();
        inner.last_accessed = chrono::Utc::now().timestamp_millis();
        inner.header.clone()
    }

    /// Current heads of the CRDT state
    pub fn heads(&self) -> Vec<ChangeHash> {
        let mut inner = self.inner.lock();
        inner.last_accessed = chrono::Utc::now().timestamp_millis();
        inner.data.heads()
    }

    /// Read a scalar from the document root map
    pub fn get(&self, key: &str) -> ShareResult<Option<ScalarValue>> {
        let mut inner = self.inner.lock();
        inner.last_accessed = chrono::Utc::now().timestamp_millis();
        inner.data.get(key)
    }

    /// Full CRDT save of the current state
    pub fn snapshot(&self) -> Vec<u8> {
        let mut inner = self.inner.lock();
        inner.last_accessed = chrono::Utc::now().timestamp_millis();
        inner.data.save()
    }

    /// Unix millisecond timestamp of the last read or mutation
    pub fn last_accessed(&self) -> i64 {
        self.inner.lock().last_accessed
    }

    /// Whether the document has been destroyed
    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    /// Run a mutation against the CRDT state.
    ///
    /// Emits [`DocumentEvent::Changed`] when the heads moved, followed by a
    /// [`DocumentEvent::Patch`] describing the mutation. A no-op after
    /// `destroy`.
    pub fn update<F>(&self, f: F) -> ShareResult<()>
    where
        F: FnOnce(&mut CrdtDoc) -> ShareResult<()>,
    {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Ok(());
        }
        inner.last_accessed = chrono::Utc::now().timestamp_millis();

        let before = inner.data.heads();
        f(&mut inner.data)?;
        let after = inner.data.heads();

        self.emit_mutation(&mut inner, before, after);
        Ok(())
    }

    /// Convenience alias for [`update`](Self::update) matching the CRDT
    /// library's structured-change entry point.
    pub fn change<F>(&self, f: F) -> ShareResult<()>
    where
        F: FnOnce(&mut CrdtDoc) -> ShareResult<()>,
    {
        self.update(f)
    }

    /// Run a mutation rooted at a historical heads set.
    pub fn change_at<F>(&self, heads: &[ChangeHash], f: F) -> ShareResult<()>
    where
        F: FnOnce(&mut CrdtDoc) -> ShareResult<()>,
    {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Ok(());
        }
        inner.last_accessed = chrono::Utc::now().timestamp_millis();

        let before = inner.data.heads();
        inner.data.isolate(heads);
        let result = f(&mut inner.data);
        inner.data.integrate();
        result?;
        let after = inner.data.heads();

        self.emit_mutation(&mut inner, before, after);
        Ok(())
    }

    /// Attempt to replace the header with a newer version.
    ///
    /// Returns `true` and emits [`DocumentEvent::HeaderUpdated`] when the
    /// upgrade rules accept the candidate; `false` leaves the current header
    /// untouched.
    pub fn update_header(&self, candidate: DocumentHeader) -> bool {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return false;
        }

        match DocumentHeader::upgrade(&inner.header, candidate) {
            Ok(header) => {
                let id = header.document_id().clone();
                let version = header.version();
                inner.header = header;
                let _ = self.events.send(DocumentEvent::HeaderUpdated { id, version });
                true
            }
            Err(e) => {
                debug!(error = %e, "Header upgrade refused");
                false
            }
        }
    }

    /// Merge another document's state into this one.
    ///
    /// Accepts the merge when the headers are already equal or when the
    /// other header passes the upgrade rules (in which case the header is
    /// replaced first). A stale or invalid header rejects the merge without
    /// mutation.
    pub fn merge_document(&self, other: &Document) -> ShareResult<()> {
        let (other_header, mut other_data) = {
            let mut guard = other.inner.lock();
            (guard.header.clone(), guard.data.fork())
        };

        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Ok(());
        }
        inner.last_accessed = chrono::Utc::now().timestamp_millis();

        if other_header != inner.header {
            let header = DocumentHeader::upgrade(&inner.header, other_header)?;
            let id = header.document_id().clone();
            let version = header.version();
            inner.header = header;
            let _ = self.events.send(DocumentEvent::HeaderUpdated { id, version });
        }

        let before = inner.data.heads();
        inner.data.merge(&mut other_data)?;
        let after = inner.data.heads();
        self.emit_mutation(&mut inner, before, after);
        Ok(())
    }

    /// Generate the next sync message for a peer, if any.
    pub fn generate_sync_message(&self, state: &mut SyncState) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return None;
        }
        inner.data.generate_sync_message(state)
    }

    /// Apply a peer's sync message; returns whether the heads moved.
    pub fn receive_sync_message(
        &self,
        state: &mut SyncState,
        data: &[u8],
    ) -> ShareResult<bool> {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Ok(false);
        }
        inner.last_accessed = chrono::Utc::now().timestamp_millis();

        let before = inner.data.heads();
        inner.data.receive_sync_message(state, data)?;
        let after = inner.data.heads();

        let changed = before != after;
        self.emit_mutation(&mut inner, before, after);
        Ok(changed)
    }

    /// Destroy the document.
    ///
    /// Emits [`DocumentEvent::Destroyed`]; subsequent mutations are no-ops
    /// while getters keep returning the last-known state.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return;
        }
        inner.destroyed = true;
        let id = inner.header.document_id().clone();
        let _ = self.events.send(DocumentEvent::Destroyed { id });
    }

    fn emit_mutation(
        &self,
        inner: &mut DocumentInner,
        before: Vec<ChangeHash>,
        after: Vec<ChangeHash>,
    ) {
        let id = inner.header.document_id().clone();
        if before != after {
            let _ = self.events.send(DocumentEvent::Changed {
                id: id.clone(),
                heads: after.clone(),
            });
        }
        let patches = inner.data.diff(&before, &after);
        let _ = self.events.send(DocumentEvent::Patch {
            id,
            before,
            after,
            patches,
        });
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Document")
            .field("id", inner.header.document_id())
            .field("version", &inner.header.version())
            .field("destroyed", &inner.destroyed)
            .finish()
    }
}
