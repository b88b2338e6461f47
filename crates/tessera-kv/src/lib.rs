//! tessera kv - versioned key-value store
//!
//! The placement engine persists placements through the [`Store`] contract:
//! opaque byte values addressed by key, versioned from 1, with
//! compare-and-set, per-key history and change watches.
//!
//! Two backends are provided:
//! - [`MemStore`]: in-memory, for tests and embedded operators
//! - [`RedbStore`]: persistent, backed by a redb database file

pub mod error;
pub mod mem;
pub mod store;
pub mod tables;
pub mod value;

use bytes::Bytes;

pub use error::{KvError, KvResult};
pub use mem::MemStore;
pub use store::RedbStore;
pub use value::{Value, ValueWatch};

/// A versioned key-value store
pub trait Store: Send + Sync {
    /// Latest value of a key
    fn get(&self, key: &str) -> KvResult<Value>;

    /// Subscribe to changes of a key
    fn watch(&self, key: &str) -> KvResult<ValueWatch>;

    /// Write a new version unconditionally, returning the new version
    fn set(&self, key: &str, data: Bytes) -> KvResult<u64>;

    /// Write the first version of a key
    fn set_if_not_exists(&self, key: &str, data: Bytes) -> KvResult<u64>;

    /// Write a new version if the current version equals `version`
    /// (0 for an absent key)
    fn check_and_set(&self, key: &str, version: u64, data: Bytes) -> KvResult<u64>;

    /// Remove a key and all its history, returning the last value
    fn delete(&self, key: &str) -> KvResult<Value>;

    /// Values of a key with versions in `[from, to)`
    fn history(&self, key: &str, from: u64, to: u64) -> KvResult<Vec<Value>>;
}

impl<S: Store + ?Sized> Store for std::sync::Arc<S> {
    fn get(&self, key: &str) -> KvResult<Value> {
        (**self).get(key)
    }

    fn watch(&self, key: &str) -> KvResult<ValueWatch> {
        (**self).watch(key)
    }

    fn set(&self, key: &str, data: Bytes) -> KvResult<u64> {
        (**self).set(key, data)
    }

    fn set_if_not_exists(&self, key: &str, data: Bytes) -> KvResult<u64> {
        (**self).set_if_not_exists(key, data)
    }

    fn check_and_set(&self, key: &str, version: u64, data: Bytes) -> KvResult<u64> {
        (**self).check_and_set(key, version, data)
    }

    fn delete(&self, key: &str) -> KvResult<Value> {
        (**self).delete(key)
    }

    fn history(&self, key: &str, from: u64, to: u64) -> KvResult<Vec<Value>> {
        (**self).history(key, from, to)
    }
}
