//! Error taxonomy shared by every public operation on [`crate::StreamStore`].
//!
//! The variant name is part of the contract: callers match on shape, not on
//! message text.

use uuid::Uuid;

/// Errors returned by the public [`crate::StreamStore`] API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A request was rejected before any I/O was attempted.
    #[error("{0}")]
    InvalidParameter(String),

    /// `expectedVersion` did not match the stream's current version, and
    /// retries (if applicable) were exhausted.
    #[error("expected version check failed")]
    Concurrency,

    /// A `messageId` already existed somewhere in the store.
    #[error("message with id {0} already exists in the store")]
    DuplicateMessage(Uuid),

    /// The write targeted a stream whose stored type does not match the
    /// type implied by the write. Enforced by the storage driver.
    #[error("stream {stream_id} has type '{actual}', expected '{expected}'")]
    InconsistentStreamType {
        stream_id: String,
        expected: String,
        actual: String,
    },

    /// `dispose()` had already begun when the operation was attempted.
    #[error("the store has been disposed")]
    Disposed,

    /// An unclassified storage or transport failure. Never retried.
    #[error("storage driver fault: {0}")]
    StorageFault(#[source] anyhow::Error),
}

impl Error {
    pub fn invalid_parameter(field: &str) -> Self {
        Error::InvalidParameter(format!("{field} is required"))
    }

    pub fn invalid_uuid(field: &str) -> Self {
        Error::InvalidParameter(format!("{field} must be a UUID"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
