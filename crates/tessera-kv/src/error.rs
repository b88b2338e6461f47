//! Key-value store errors

use tessera_common::Error;

/// Error type for key-value store operations
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// No value stored under the key
    #[error("key not found: {0}")]
    NotFound(String),
    /// A value already exists under the key
    #[error("key already exists: {0}")]
    AlreadyExists(String),
    /// Compare-and-set against a stale version
    #[error("version mismatch for key {key}: expected {expected}, current {current}")]
    VersionMismatch {
        key: String,
        expected: u64,
        current: u64,
    },
    #[error("invalid history range [{from}, {to})")]
    InvalidHistoryRange { from: u64, to: u64 },
    #[error("watch closed for key {0}")]
    WatchClosed(String),
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("prost decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for KvError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

pub type KvResult<T> = Result<T, KvError>;

impl From<KvError> for Error {
    fn from(e: KvError) -> Self {
        match e {
            KvError::NotFound(key) => Self::KeyNotFound(key),
            KvError::AlreadyExists(key) => Self::KeyAlreadyExists(key),
            KvError::VersionMismatch { .. } => Self::VersionMismatch,
            KvError::Decode(e) => Self::codec(e.to_string()),
            other => Self::store(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_errors_map_to_common_taxonomy() {
        let err: Error = KvError::VersionMismatch {
            key: "k".into(),
            expected: 1,
            current: 2,
        }
        .into();
        assert!(err.is_retryable());

        let err: Error = KvError::NotFound("k".into()).into();
        assert!(err.is_not_found());

        let err: Error = KvError::AlreadyExists("k".into()).into();
        assert!(matches!(err, Error::KeyAlreadyExists(k) if k == "k"));

        let err: Error = KvError::InvalidHistoryRange { from: 3, to: 1 }.into();
        assert!(matches!(err, Error::Store(_)));
    }
}
