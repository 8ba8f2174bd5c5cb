//! Error taxonomy for archive operations

use crate::key::ArchiveKey;

/// Result alias used throughout the archive core
pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;

/// Errors returned by the archive core
///
/// Validation errors (`MalformedKey`, `InvalidQuery`) indicate caller misuse and
/// are never worth retrying. `Backend` wraps whatever the storage driver reported.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// A key was not exactly [`ArchiveKey::LEN`] bytes
    #[error("malformed archive key: expected {} bytes, got {len}", ArchiveKey::LEN)]
    MalformedKey { len: usize },

    /// The envelope could not be serialized; nothing was written
    #[error("failed to encode envelope: {0}")]
    Encode(String),

    /// Query parameters were rejected before any backend I/O
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Point lookup found no row for the key
    #[error("envelope not found: {0}")]
    NotFound(ArchiveKey),

    /// The store was closed
    #[error("archive store is closed")]
    Closed,

    /// A stored row could not be decoded
    #[error("corrupt archive row: {0}")]
    Corrupt(String),

    /// Opaque driver / I/O failure
    #[error("archive backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ArchiveError {
    /// Wrap any driver error as a backend failure
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }

    /// Whether re-issuing the same call could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

macro_rules! backend_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for ArchiveError {
                fn from(err: $ty) -> Self {
                    Self::backend(err)
                }
            }
        )*
    };
}

backend_error_from!(
    std::io::Error,
    rusqlite::Error,
    rusqlite_migration::Error,
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);
