//! Error types for the document-sharing core

use thiserror::Error;

/// Main error type for document-sharing operations
#[derive(Error, Debug)]
pub enum ShareError {
    /// Header failed to decode or its signature did not verify
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Header replacement violated the upgrade rules
    #[error("Header upgrade rejected: {0}")]
    HeaderUpgradeRejected(String),

    /// Export or share attempted by a key that is not an allowed user
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Inbound message failed schema validation
    #[error("Schema rejected: {0}")]
    SchemaRejected(String),

    /// No peer produced the requested document within the deadline
    #[error("Document request timed out: {0}")]
    DocumentRequestTimeout(String),

    /// Document was not found locally
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    /// The underlying connection is gone
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// Error during storage operations
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Signature verification failed
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// Decryption failed (wrong key, tampered data, or malformed input)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Automerge document error
    #[error("Automerge error: {0}")]
    Automerge(String),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Identity-related error (keys, signatures, ids)
    #[error("Identity error: {0}")]
    Identity(String),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type alias using ShareError
pub type ShareResult<T> = Result<T, ShareError>;
