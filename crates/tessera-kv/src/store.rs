//! Persistent key-value store backed by redb.
//!
//! Every version of every key is kept in the `HISTORY` table; `LATEST`
//! points at the current version. All writes are synchronous (write txn +
//! commit) and watchers are notified after the commit succeeds.

use crate::error::{KvError, KvResult};
use crate::tables::{self, history_key, history_upper_bound, version_of};
use crate::value::{Value, ValueWatch, Watchables};
use crate::Store;
use bytes::Bytes;
use parking_lot::Mutex;
use redb::{Database, ReadableTable};
use std::path::Path;
use tracing::{debug, info};

/// Persistent versioned store backed by redb.
pub struct RedbStore {
    db: Database,
    watchables: Watchables,
    /// Serializes writers so watch notifications follow commit order
    write_lock: Mutex<()>,
}

impl RedbStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> KvResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::LATEST)?;
            let _t = write_txn.open_table(tables::HISTORY)?;
        }
        write_txn.commit()?;

        info!("Opened placement store at {}", path.display());
        Ok(Self {
            db,
            watchables: Watchables::default(),
            write_lock: Mutex::new(()),
        })
    }

    fn latest_version(&self, key: &str) -> KvResult<Option<u64>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::LATEST)?;
        Ok(table.get(key)?.map(|v| v.value()))
    }

    fn read_version(&self, key: &str, version: u64) -> KvResult<Option<Value>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::HISTORY)?;
        Ok(table
            .get(history_key(key, version).as_str())?
            .map(|v| Value::new(version, Bytes::copy_from_slice(v.value()))))
    }

    fn current(&self, key: &str) -> KvResult<Option<Value>> {
        match self.latest_version(key)? {
            Some(version) => self.read_version(key, version),
            None => Ok(None),
        }
    }

    /// Write `data` as the next version of `key` if `precondition` accepts
    /// the current version (0 when absent).
    fn write_if(
        &self,
        key: &str,
        data: Bytes,
        precondition: impl FnOnce(u64) -> KvResult<()>,
    ) -> KvResult<u64> {
        let _guard = self.write_lock.lock();
        let write_txn = self.db.begin_write()?;
        let version = {
            let mut latest = write_txn.open_table(tables::LATEST)?;
            let current = latest.get(key)?.map_or(0, |v| v.value());
            precondition(current)?;
            let version = current + 1;
            latest.insert(key, version)?;

            let mut history = write_txn.open_table(tables::HISTORY)?;
            history.insert(history_key(key, version).as_str(), data.as_ref())?;
            version
        };
        write_txn.commit()?;

        debug!("Set key '{}' at version {}", key, version);
        self.watchables
            .notify(key, Some(Value::new(version, data)));
        Ok(version)
    }
}

impl Store for RedbStore {
    fn get(&self, key: &str) -> KvResult<Value> {
        self.current(key)?
            .ok_or_else(|| KvError::NotFound(key.to_string()))
    }

    fn watch(&self, key: &str) -> KvResult<ValueWatch> {
        let _guard = self.write_lock.lock();
        let current = self.current(key)?;
        Ok(self.watchables.subscribe(key, current))
    }

    fn set(&self, key: &str, data: Bytes) -> KvResult<u64> {
        self.write_if(key, data, |_| Ok(()))
    }

    fn set_if_not_exists(&self, key: &str, data: Bytes) -> KvResult<u64> {
        self.write_if(key, data, |current| {
            if current == 0 {
                Ok(())
            } else {
                Err(KvError::AlreadyExists(key.to_string()))
            }
        })
    }

    fn check_and_set(&self, key: &str, version: u64, data: Bytes) -> KvResult<u64> {
        self.write_if(key, data, |current| {
            if current == version {
                Ok(())
            } else {
                Err(KvError::VersionMismatch {
                    key: key.to_string(),
                    expected: version,
                    current,
                })
            }
        })
    }

    fn delete(&self, key: &str) -> KvResult<Value> {
        let _guard = self.write_lock.lock();
        let last = self
            .current(key)?
            .ok_or_else(|| KvError::NotFound(key.to_string()))?;

        let write_txn = self.db.begin_write()?;
        {
            let mut latest = write_txn.open_table(tables::LATEST)?;
            latest.remove(key)?;

            let mut history = write_txn.open_table(tables::HISTORY)?;
            let lower = history_key(key, 0);
            let upper = history_upper_bound(key);
            let mut keys = Vec::new();
            for entry in history.range(lower.as_str()..upper.as_str())? {
                let entry = entry?;
                keys.push(entry.0.value().to_string());
            }
            for k in &keys {
                history.remove(k.as_str())?;
            }
        }
        write_txn.commit()?;

        debug!("Deleted key '{}' at version {}", key, last.version());
        self.watchables.notify(key, None);
        Ok(last)
    }

    fn history(&self, key: &str, from: u64, to: u64) -> KvResult<Vec<Value>> {
        if from == 0 || from > to {
            return Err(KvError::InvalidHistoryRange { from, to });
        }
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::HISTORY)?;
        let lower = history_key(key, from);
        let upper = history_key(key, to);
        let mut result = Vec::new();
        for entry in table.range(lower.as_str()..upper.as_str())? {
            let entry = entry?;
            if let Some(version) = version_of(entry.0.value()) {
                result.push(Value::new(version, Bytes::copy_from_slice(entry.1.value())));
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn data(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn open_store(dir: &TempDir) -> RedbStore {
        RedbStore::open(dir.path().join("kv.redb")).unwrap()
    }

    #[test]
    fn test_set_and_get() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(matches!(store.get("k"), Err(KvError::NotFound(_))));
        assert_eq!(store.set("k", data("a")).unwrap(), 1);
        assert_eq!(store.set("k", data("b")).unwrap(), 2);
        let value = store.get("k").unwrap();
        assert_eq!(value.version(), 2);
        assert_eq!(value.data(), &data("b"));
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            store.set("svc", data("a")).unwrap();
            store.set("svc", data("b")).unwrap();
        }
        let store = open_store(&dir);
        assert_eq!(store.get("svc").unwrap().version(), 2);
        assert_eq!(store.history("svc", 1, 2).unwrap()[0].data(), &data("a"));
    }

    #[test]
    fn test_conditional_writes() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert_eq!(store.set_if_not_exists("k", data("a")).unwrap(), 1);
        assert!(matches!(
            store.set_if_not_exists("k", data("b")),
            Err(KvError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.check_and_set("k", 0, data("b")),
            Err(KvError::VersionMismatch { current: 1, .. })
        ));
        assert_eq!(store.check_and_set("k", 1, data("b")).unwrap(), 2);
    }

    #[test]
    fn test_delete_clears_history() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.set("k", data("a")).unwrap();
        store.set("k", data("b")).unwrap();
        store.set("k2", data("x")).unwrap();
        assert_eq!(store.delete("k").unwrap().data(), &data("b"));
        assert!(store.get("k").is_err());
        assert!(store.history("k", 1, 3).unwrap().is_empty());
        assert_eq!(store.get("k2").unwrap().version(), 1);
        assert_eq!(store.set("k", data("c")).unwrap(), 1);
    }

    #[test]
    fn test_history_range() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        for s in ["a", "b", "c"] {
            store.set("k", data(s)).unwrap();
        }
        let values = store.history("k", 2, 10).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].version(), 2);
        assert_eq!(values[1].version(), 3);
        assert!(store.history("k", 2, 1).is_err());
    }

    #[tokio::test]
    async fn test_watch_notifies_after_commit() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let mut w = store.watch("k").unwrap();
        store.set("k", data("a")).unwrap();
        let value = w.changed().await.unwrap().unwrap();
        assert_eq!(value.version(), 1);
        assert_eq!(value.data(), &data("a"));
    }
}
