//! Error taxonomy for the offline queue.
//!
//! Only [`StorageError`] and dead-lettered rejections ever reach the operator.
//! Submission failures are folded into sync engine state transitions.

use std::time::Duration;

use crate::model::{LocalId, Transaction};

// ---------------------------------------------------------------------------
// Local persistence
// ---------------------------------------------------------------------------

/// Local durable storage could not be read or written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("local storage unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode {record}: {message}")]
    Encode { record: String, message: String },

    #[error("stored record {record} is unreadable: {message}")]
    Corrupt { record: String, message: String },
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Unavailable(err.to_string())
    }
}

/// `enqueue` could not persist the transaction. The transaction is handed back
/// and is still held in memory until the next successful flush.
#[derive(Debug, Clone, thiserror::Error)]
#[error("transaction {} held in memory only: {source}", .transaction.local_id)]
pub struct EnqueueError {
    pub transaction: Box<Transaction>,
    #[source]
    pub source: StorageError,
}

/// Queue bookkeeping failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("transaction {0} is not queued")]
    NotQueued(LocalId),

    #[error("transaction {0} is already in flight")]
    AlreadyInFlight(LocalId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

// ---------------------------------------------------------------------------
// Remote submission
// ---------------------------------------------------------------------------

/// Failure reported by the authoritative backend collaborator, before
/// classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct AuthorityError {
    /// HTTP status when the backend answered at all.
    pub status: Option<u16>,
    pub message: String,
    /// Server-provided hint (Retry-After / `retry_after_seconds`).
    pub retry_after_secs: Option<u64>,
}

impl AuthorityError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            retry_after_secs: None,
        }
    }
}

/// Classified outcome of a failed `submit`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmissionError {
    /// Network, timeout, or server-side trouble. Retry later, unchanged.
    #[error("transient submission failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The server refused the payload. Never retried automatically.
    #[error("submission rejected: {message}")]
    Rejected { message: String, status: Option<u16> },
}

impl SubmissionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SubmissionError::Transient { .. })
    }
}

// ---------------------------------------------------------------------------
// Identifiers and configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a local transaction id: {0:?}")]
pub struct InvalidLocalId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing credential {0}")]
    MissingCredential(&'static str),

    #[error("invalid connection string")]
    InvalidConnectionString,

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}
