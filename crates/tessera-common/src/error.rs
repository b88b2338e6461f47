//! Error types for tessera
//!
//! This module defines the error type shared by the placement engine, the
//! storage adapter and the staged placement watcher.

use thiserror::Error;

/// Common result type for tessera operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for tessera
#[derive(Debug, Error)]
pub enum Error {
    // Algorithm selection errors
    #[error("could not apply {0} algo on the placement")]
    IncompatibleAlgorithm(&'static str),

    #[error("not supported: {0}")]
    Unsupported(String),

    // Invariant violations
    #[error("invalid placement: {0}")]
    InvalidPlacement(String),

    // Capacity errors
    #[error(
        "not enough isolation groups to take shards, please make sure RF is less than number of isolation groups"
    )]
    NotEnoughIsolationGroups,

    #[error("could not fully replace all shards from {instance}, {unassigned} shards left unassigned")]
    PartialReplacement { instance: String, unassigned: usize },

    #[error("no valid instance: {0}")]
    NoValidInstance(String),

    // Precondition errors
    #[error("instance {0} does not exist in placement")]
    InstanceNotFound(String),

    #[error("instance {0} already exist in the placement")]
    InstanceAlreadyExists(String),

    #[error("instance {instance} is in an invalid state: {reason}")]
    InvalidInstanceState { instance: String, reason: String },

    #[error("shard {shard} does not exist in instance {instance}")]
    ShardNotFound { shard: u32, instance: String },

    #[error("invalid shard state: {0}")]
    InvalidShardState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Backing store errors
    #[error("version mismatch")]
    VersionMismatch,

    #[error("key already exists: {0}")]
    KeyAlreadyExists(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("codec error: {0}")]
    Codec(String),

    // Staged placement and watch lifecycle errors
    #[error("no applicable placement found")]
    NoApplicablePlacement,

    #[error("active staged placement is closed")]
    ActivePlacementClosed,

    #[error("placement watcher is already watching")]
    AlreadyWatching,

    #[error("placement watcher is not watching")]
    NotWatching,

    #[error("placement watcher is closed")]
    WatcherClosed,

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid placement error
    pub fn invalid_placement(msg: impl Into<String>) -> Self {
        Self::InvalidPlacement(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an invalid shard state error
    pub fn invalid_shard_state(msg: impl Into<String>) -> Self {
        Self::InvalidShardState(msg.into())
    }

    /// Create an invalid instance state error
    pub fn invalid_instance_state(instance: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInstanceState {
            instance: instance.into(),
            reason: reason.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create a no valid instance error
    pub fn no_valid_instance(msg: impl Into<String>) -> Self {
        Self::NoValidInstance(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a retryable error
    ///
    /// A lost compare-and-set means another writer got in first; re-reading
    /// the placement and re-running the operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionMismatch)
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::InstanceNotFound(_) | Self::ShardNotFound { .. } | Self::KeyNotFound(_)
        )
    }

    /// Check if the placement could not satisfy the replica factor with the
    /// instances at hand
    #[must_use]
    pub const fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::NotEnoughIsolationGroups
                | Self::PartialReplacement { .. }
                | Self::NoValidInstance(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::VersionMismatch.is_retryable());
        assert!(!Error::NotEnoughIsolationGroups.is_retryable());
        assert!(!Error::KeyNotFound("k".into()).is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::InstanceNotFound("i1".into()).is_not_found());
        assert!(
            Error::ShardNotFound {
                shard: 3,
                instance: "i1".into()
            }
            .is_not_found()
        );
        assert!(!Error::VersionMismatch.is_not_found());
    }

    #[test]
    fn test_error_capacity() {
        assert!(Error::NotEnoughIsolationGroups.is_capacity());
        assert!(
            Error::PartialReplacement {
                instance: "i1".into(),
                unassigned: 2
            }
            .is_capacity()
        );
        assert!(!Error::invalid_placement("dup shard").is_capacity());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            Error::IncompatibleAlgorithm("sharded").to_string(),
            "could not apply sharded algo on the placement"
        );
        assert_eq!(
            Error::PartialReplacement {
                instance: "i1".into(),
                unassigned: 2
            }
            .to_string(),
            "could not fully replace all shards from i1, 2 shards left unassigned"
        );
    }
}
