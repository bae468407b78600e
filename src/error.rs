/// Error types for Concord operations.
///
/// This module provides the error taxonomy for the state layer. Every variant
/// maps to a distinct caller decision: a `ScopeMismatch` is a programming
/// error and is never retried, a `TransactionAborted` means "re-read and
/// decide", a `NotFound` means "already gone", and a `StreamTerminated` means
/// "state unknown, re-synchronize by direct read".
use thiserror::Error;

/// The main error type for Concord operations.
///
/// All fallible operations in Concord return `Result<T, StateError>`.
#[derive(Error, Debug)]
pub enum StateError {
    /// A document key carries the wrong environment prefix.
    ///
    /// Cross-environment key confusion is a programming error, not a
    /// recoverable condition; callers must not retry.
    #[error("key '{doc_id}' is not scoped to environment '{env_uuid}'")]
    ScopeMismatch {
        /// The caller's environment UUID
        env_uuid: String,
        /// The offending document key
        doc_id: String,
    },

    /// A transaction's assertions failed and the retry budget is exhausted.
    ///
    /// The caller must re-read current state and decide how to proceed
    /// rather than assume either success or failure.
    #[error("transaction aborted: assertions failed after retrying")]
    TransactionAborted,

    /// Lookup against a key that does not exist.
    #[error("document '{key}' not found in collection '{collection}'")]
    NotFound {
        /// The collection that was queried
        collection: String,
        /// The local key that was not found
        key: String,
    },

    /// The watcher's underlying event stream ended or errored.
    ///
    /// Terminal for that subscription; restart is the subscriber's
    /// responsibility, after re-synchronizing by direct read.
    #[error("change stream terminated: {0}")]
    StreamTerminated(String),

    /// Invalid data passed to or read from the store.
    #[error("invalid data: {reason}")]
    InvalidData {
        /// Description of why the data is invalid
        reason: String,
    },

    /// Serialization error when converting documents to/from JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for Concord operations.
pub type StateResult<T> = Result<T, StateError>;
