//! Distributed document-sharing core
//!
//! The collaboration engine behind a peer-to-peer whiteboard/notes system:
//! mutually-authenticating clients co-author CRDT documents over an
//! untrusted signaling relay and direct per-document data channels, with
//! encrypted durable local storage and conflict-free merge of concurrent
//! edits.
//!
//! ## Overview
//!
//! - **Documents** pair a signed [`DocumentHeader`] (owner, allowed users,
//!   version) with opaque Automerge state. Headers authorize everything:
//!   exports, request answering, and peer admission.
//! - **Signaling** rides any [`sync::Connector`] transport. Payloads between
//!   two clients are sealed with their pairwise shared secret; the relay
//!   only ever routes ciphertext.
//! - **Peers** are direct byte channels scoped to one document, set up by
//!   offer/answer/ICE signals tunneled through the same relay and gated by
//!   the document ACL.
//! - **Synchronizers** drive the CRDT sync protocol per document and peer,
//!   coalescing bursts on a 16 ms tick.
//! - **Storage** persists signed headers plus AEAD-sealed content blobs
//!   through a pluggable provider, with debounced change-triggered saves.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use docshare_core::{ClientConfig, SharingClient, SessionManager};
//! use docshare_core::storage::MemoryProvider;
//! use docshare_core::sync::{LocalRelay, LoopbackConnector};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = LocalRelay::new();
//!     let client = SharingClient::new(ClientConfig::new(
//!         Arc::new(relay.connector()),
//!         Arc::new(LoopbackConnector::new()),
//!         Arc::new(MemoryProvider::new()),
//!         Arc::new(SessionManager::generate()),
//!     ));
//!     client.connect();
//!     client.wait_for_connection().await?;
//!
//!     let doc = client.create_document([], Default::default())?;
//!     doc.update(|d| d.put("title", "first board"))?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod crypto;
pub mod document;
pub mod error;
pub mod identity;
pub mod registry;
pub mod storage;
pub mod sync;

// Re-exports
pub use client::{ClientConfig, SharingClient};
pub use crypto::ContentCrypto;
pub use document::{
    Address, CrdtDoc, Document, DocumentEvent, DocumentHeader, DocumentId, SyncState,
};
pub use error::{ShareError, ShareResult};
pub use identity::{ClientId, Keypair, PublicKey, SessionManager, Signature};
pub use registry::{DocumentRegistry, RegistryEvent};
pub use storage::{Storage, StorageEvent, StorageProvider};
pub use sync::{
    DocumentPresence, DocumentSynchronizer, Message, MessageExchanger, PeerAddr, PeerManager,
    PresenceState, SignalingClient,
};
