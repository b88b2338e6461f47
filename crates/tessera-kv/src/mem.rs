//! In-memory key-value store

use crate::error::{KvError, KvResult};
use crate::value::{Value, ValueWatch, Watchables};
use crate::Store;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// In-memory versioned store keeping the full history of every key
///
/// Used by tests and by operators that never persist placements.
#[derive(Debug, Default)]
pub struct MemStore {
    /// All versions of each key, oldest first
    values: RwLock<HashMap<String, Vec<Value>>>,
    watchables: Watchables,
}

impl MemStore {
    /// Create a new empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn set_locked(
        &self,
        values: &mut HashMap<String, Vec<Value>>,
        key: &str,
        data: Bytes,
    ) -> u64 {
        let history = values.entry(key.to_string()).or_default();
        let version = history.last().map_or(1, |v| v.version() + 1);
        let value = Value::new(version, data);
        history.push(value.clone());
        self.watchables.notify(key, Some(value));
        debug!("Set key '{}' at version {}", key, version);
        version
    }
}

impl Store for MemStore {
    fn get(&self, key: &str) -> KvResult<Value> {
        self.values
            .read()
            .get(key)
            .and_then(|history| history.last().cloned())
            .ok_or_else(|| KvError::NotFound(key.to_string()))
    }

    fn watch(&self, key: &str) -> KvResult<ValueWatch> {
        let values = self.values.read();
        let current = values.get(key).and_then(|history| history.last().cloned());
        Ok(self.watchables.subscribe(key, current))
    }

    fn set(&self, key: &str, data: Bytes) -> KvResult<u64> {
        let mut values = self.values.write();
        Ok(self.set_locked(&mut values, key, data))
    }

    fn set_if_not_exists(&self, key: &str, data: Bytes) -> KvResult<u64> {
        let mut values = self.values.write();
        if values.get(key).is_some_and(|history| !history.is_empty()) {
            return Err(KvError::AlreadyExists(key.to_string()));
        }
        Ok(self.set_locked(&mut values, key, data))
    }

    fn check_and_set(&self, key: &str, version: u64, data: Bytes) -> KvResult<u64> {
        let mut values = self.values.write();
        let current = values
            .get(key)
            .and_then(|history| history.last())
            .map_or(0, Value::version);
        if current != version {
            return Err(KvError::VersionMismatch {
                key: key.to_string(),
                expected: version,
                current,
            });
        }
        Ok(self.set_locked(&mut values, key, data))
    }

    fn delete(&self, key: &str) -> KvResult<Value> {
        let mut values = self.values.write();
        let last = values
            .remove(key)
            .and_then(|mut history| history.pop())
            .ok_or_else(|| KvError::NotFound(key.to_string()))?;
        self.watchables.notify(key, None);
        debug!("Deleted key '{}' at version {}", key, last.version());
        Ok(last)
    }

    fn history(&self, key: &str, from: u64, to: u64) -> KvResult<Vec<Value>> {
        if from == 0 || from > to {
            return Err(KvError::InvalidHistoryRange { from, to });
        }
        Ok(self
            .values
            .read()
            .get(key)
            .map(|history| {
                history
                    .iter()
                    .filter(|v| v.version() >= from && v.version() < to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
