use thiserror::Error;

use crate::types::ProcessId;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, StorageError>;

/// The error taxonomy surfaced at the storage boundary.
///
/// Callers are expected to match on the variant: `NotFound` and
/// `NoMoreElements` are ordinary control-flow outcomes for queue consumers,
/// while `Kv` wraps unrecoverable failures of the underlying store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested record does not exist.
    #[error("record not found")]
    NotFound,

    /// A record with the same content-addressed key (or an in-flight
    /// nullifier) already exists.
    #[error("key already exists")]
    KeyAlreadyExists,

    /// A queue pull found no eligible element.
    #[error("no more elements")]
    NoMoreElements,

    /// A stored record could not be decoded into the expected type.
    #[error("failed to decode stored record: {0}")]
    Decode(String),

    /// A process identifier with a non-canonical encoding was supplied.
    #[error("invalid process id")]
    InvalidProcessId,

    /// An unrecognized stat kind tag was supplied at the boundary.
    #[error("unknown stat kind {0}")]
    UnknownStatKind(u8),

    /// Failure recovery needed the process's on-chain state root, but none
    /// is recorded.
    #[error("process {0} has no known state root")]
    MissingStateRoot(ProcessId),

    /// A failure reported by the backing key-value store.
    #[error("kv backend failure: {0}")]
    Kv(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl StorageError {
    pub(crate) fn decode(err: impl std::fmt::Display) -> Self {
        StorageError::Decode(err.to_string())
    }

    pub(crate) fn kv(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StorageError::Kv(Box::new(err))
    }
}
