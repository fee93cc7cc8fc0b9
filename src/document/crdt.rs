//! Automerge document wrapper
//!
//! CrdtDoc is the only module that touches the CRDT library directly. It
//! exposes exactly the operations the rest of the crate needs: load/save,
//! fork/merge, heads, root-map edits, patch diffing, and the incremental
//! sync protocol. Everything else treats the document state as opaque.

use automerge::sync::SyncDoc;
use automerge::transaction::Transactable;
use automerge::{sync, AutoCommit, ReadDoc, ROOT};

use crate::error::ShareError;

pub use automerge::{ChangeHash, Patch, ScalarValue};

/// Per-peer sync protocol state.
///
/// One instance per (document, peer) pair; opaque to callers.
pub struct SyncState {
    inner: sync::State,
}

impl SyncState {
    /// Create fresh sync state for a new peer
    pub fn new() -> Self {
        Self {
            inner: sync::State::new(),
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncState").finish_non_exhaustive()
    }
}

/// Opaque CRDT document state.
///
/// All mutations are tracked by Automerge for conflict-free merging during
/// sync. The root object is a map; nested structure is created on demand.
pub struct CrdtDoc {
    doc: AutoCommit,
}

impl CrdtDoc {
    /// Create a new empty document
    pub fn new() -> Self {
        Self {
            doc: AutoCommit::new(),
        }
    }

    /// Load a document from a full save
    pub fn load(data: &[u8]) -> Result<Self, ShareError> {
        let doc = AutoCommit::load(data).map_err(|e| ShareError::Automerge(e.to_string()))?;
        Ok(Self { doc })
    }

    /// Apply an incremental save (changes since some earlier state)
    pub fn load_incremental(&mut self, data: &[u8]) -> Result<(), ShareError> {
        self.doc
            .load_incremental(data)
            .map_err(|e| ShareError::Automerge(e.to_string()))?;
        Ok(())
    }

    /// Save the full document state to bytes
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Fork the document for concurrent editing
    pub fn fork(&mut self) -> Self {
        Self {
            doc: self.doc.fork(),
        }
    }

    /// Merge another document's changes into this one
    pub fn merge(&mut self, other: &mut CrdtDoc) -> Result<(), ShareError> {
        self.doc
            .merge(&mut other.doc)
            .map_err(|e| ShareError::Automerge(e.to_string()))?;
        Ok(())
    }

    /// Current heads of the document DAG
    pub fn heads(&mut self) -> Vec<ChangeHash> {
        self.doc.get_heads()
    }

    /// Patches describing the difference between two sets of heads
    pub fn diff(&mut self, before: &[ChangeHash], after: &[ChangeHash]) -> Vec<Patch> {
        self.doc.diff(before, after)
    }

    /// Rebase subsequent edits onto a historical heads set
    pub(crate) fn isolate(&mut self, heads: &[ChangeHash]) {
        self.doc.isolate(heads);
    }

    /// Re-integrate after [`isolate`](Self::isolate)
    pub(crate) fn integrate(&mut self) {
        self.doc.integrate();
    }

    /// Put a scalar value into the root map
    pub fn put(
        &mut self,
        key: &str,
        value: impl Into<ScalarValue>,
    ) -> Result<(), ShareError> {
        self.doc
            .put(ROOT, key, value.into())
            .map_err(|e| ShareError::Automerge(e.to_string()))?;
        Ok(())
    }

    /// Get a scalar value from the root map
    pub fn get(&self, key: &str) -> Result<Option<ScalarValue>, ShareError> {
        let value = self
            .doc
            .get(ROOT, key)
            .map_err(|e| ShareError::Automerge(e.to_string()))?;
        Ok(match value {
            Some((automerge::Value::Scalar(s), _)) => Some(s.into_owned()),
            _ => None,
        })
    }

    /// Delete a key from the root map
    pub fn delete(&mut self, key: &str) -> Result<(), ShareError> {
        self.doc
            .delete(ROOT, key)
            .map_err(|e| ShareError::Automerge(e.to_string()))?;
        Ok(())
    }

    /// Keys currently present in the root map
    pub fn keys(&self) -> Vec<String> {
        self.doc.keys(ROOT).collect()
    }

    /// Generate the next sync message for a peer, if any is due.
    ///
    /// Returns `None` when the peer is known to be up to date.
    pub fn generate_sync_message(&mut self, state: &mut SyncState) -> Option<Vec<u8>> {
        self.doc
            .sync()
            .generate_sync_message(&mut state.inner)
            .map(|m| m.encode())
    }

    /// Feed a peer's sync message into the document.
    pub fn receive_sync_message(
        &mut self,
        state: &mut SyncState,
        data: &[u8],
    ) -> Result<(), ShareError> {
        let message = sync::Message::decode(data)
            .map_err(|e| ShareError::Serialization(format!("Bad sync message: {}", e)))?;
        self.doc
            .sync()
            .receive_sync_message(&mut state.inner, message)
            .map_err(|e| ShareError::Automerge(e.to_string()))?;
        Ok(())
    }
}

impl Default for CrdtDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CrdtDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrdtDoc").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_roundtrip() {
        let mut doc = CrdtDoc::new();
        doc.put("count", 1_u64).unwrap();

        let value = doc.get("count").unwrap().unwrap();
        assert_eq!(value.to_u64(), Some(1));
    }

    #[test]
    fn test_save_and_load() {
        let mut doc = CrdtDoc::new();
        doc.put("title", "whiteboard").unwrap();

        let bytes = doc.save();
        let loaded = CrdtDoc::load(&bytes).unwrap();
        assert_eq!(
            loaded.get("title").unwrap().unwrap().to_str(),
            Some("whiteboard")
        );
    }

    #[test]
    fn test_load_rejects_garbage() {
        assert!(CrdtDoc::load(b"not an automerge doc").is_err());
    }

    #[test]
    fn test_fork_and_merge() {
        let mut doc1 = CrdtDoc::new();
        doc1.put("a", 1_u64).unwrap();

        let mut doc2 = doc1.fork();
        doc2.put("b", 2_u64).unwrap();
        doc1.put("c", 3_u64).unwrap();

        doc1.merge(&mut doc2).unwrap();
        let mut keys = doc1.keys();
        keys.sort();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_heads_change_on_edit() {
        let mut doc = CrdtDoc::new();
        let before = doc.heads();
        doc.put("x", true).unwrap();
        assert_ne!(before, doc.heads());
    }

    #[test]
    fn test_diff_reports_patches() {
        let mut doc = CrdtDoc::new();
        let before = doc.heads();
        doc.put("n", 42_u64).unwrap();
        let after = doc.heads();

        let patches = doc.diff(&before, &after);
        assert!(!patches.is_empty());
    }

    #[test]
    fn test_sync_protocol_converges() {
        let mut a = CrdtDoc::new();
        let mut b = CrdtDoc::new();
        a.put("n", 42_u64).unwrap();

        let mut state_a = SyncState::new();
        let mut state_b = SyncState::new();

        // Ping-pong until neither side has anything left to say
        for _ in 0..10 {
            let msg_a = a.generate_sync_message(&mut state_a);
            if let Some(m) = &msg_a {
                b.receive_sync_message(&mut state_b, m).unwrap();
            }
            let msg_b = b.generate_sync_message(&mut state_b);
            if let Some(m) = &msg_b {
                a.receive_sync_message(&mut state_a, m).unwrap();
            }
            if msg_a.is_none() && msg_b.is_none() {
                break;
            }
        }

        assert_eq!(a.heads(), b.heads());
        assert_eq!(b.get("n").unwrap().unwrap().to_u64(), Some(42));
    }

    #[test]
    fn test_incremental_load() {
        let mut doc1 = CrdtDoc::new();
        doc1.put("first", 1_u64).unwrap();
        let full = doc1.save();

        let mut doc2 = CrdtDoc::load(&full).unwrap();
        doc1.put("second", 2_u64).unwrap();

        // Full save of doc1 applied incrementally brings doc2 up to date
        let update = doc1.save();
        doc2.load_incremental(&update).unwrap();
        assert_eq!(doc2.get("second").unwrap().unwrap().to_u64(), Some(2));
    }
}
