//! Placement persistence on a versioned key-value store
//!
//! A placement lives under a single key. A plain placement is stored as a
//! [`proto::Placement`]. With staging enabled the key holds
//! [`proto::PlacementSnapshots`] and every write appends a snapshot whose
//! cutover must be later than the last one.

use crate::options::Options;
use crate::placement::{Placement, Placements};
use crate::validate::validate;
use bytes::Bytes;
use prost::Message;
use tessera_common::{Error, Result};
use tessera_kv::{KvError, Store, Value, ValueWatch};
use tessera_proto as proto;
use tracing::debug;

/// Raw stored form of a placement key
#[derive(Clone, Debug, PartialEq)]
pub enum PlacementProto {
    Single(proto::Placement),
    Snapshots(proto::PlacementSnapshots),
}

impl PlacementProto {
    fn encode(&self) -> Bytes {
        match self {
            Self::Single(p) => Bytes::from(p.encode_to_vec()),
            Self::Snapshots(ps) => Bytes::from(ps.encode_to_vec()),
        }
    }
}

/// Reads and writes placements under one key
#[derive(Debug)]
pub struct KvPlacementStorage<S: Store> {
    store: S,
    key: String,
    opts: Options,
}

impl<S: Store> KvPlacementStorage<S> {
    pub fn new(store: S, key: impl Into<String>, opts: Options) -> Self {
        Self {
            store,
            key: key.into(),
            opts,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Write unconditionally
    pub fn set(&self, p: &Placement) -> Result<Placement> {
        let data = self.generate(p)?;
        if self.opts.dryrun {
            return Ok(p.clone());
        }
        let version = self.store.set(&self.key, data)?;
        debug!("Set placement {} at version {}", self.key, version);
        Ok(p.clone().with_version(version))
    }

    /// Write if the stored version is still `version`
    pub fn check_and_set(&self, p: &Placement, version: u64) -> Result<Placement> {
        let data = self.generate(p)?;
        if self.opts.dryrun {
            return Ok(p.clone());
        }
        let new_version = self.store.check_and_set(&self.key, version, data)?;
        debug!(
            "Updated placement {} from version {} to {}",
            self.key, version, new_version
        );
        Ok(p.clone().with_version(new_version))
    }

    /// Write the first placement under the key
    pub fn set_if_not_exist(&self, p: &Placement) -> Result<Placement> {
        let data = self.generate(p)?;
        if self.opts.dryrun {
            return Ok(p.clone());
        }
        let version = self.store.set_if_not_exists(&self.key, data)?;
        Ok(p.clone().with_version(version))
    }

    /// Current placement with its store version attached. With staging
    /// this is the latest snapshot.
    pub fn placement(&self) -> Result<Placement> {
        let value = self.store.get(&self.key)?;
        self.placement_from_value(&value)
    }

    /// Placement as stored at `version`
    pub fn placement_for_version(&self, version: u64) -> Result<Placement> {
        let values = self
            .store
            .history(&self.key, version, version.saturating_add(1))?;
        match values.as_slice() {
            [value] => self.placement_from_value(value),
            _ => Err(Error::KeyNotFound(format!(
                "{} at version {version}: got {} values, expecting 1",
                self.key,
                values.len()
            ))),
        }
    }

    /// Remove the key and its history
    pub fn delete(&self) -> Result<()> {
        if self.opts.dryrun {
            return Ok(());
        }
        self.store.delete(&self.key)?;
        debug!("Deleted placement {}", self.key);
        Ok(())
    }

    /// Stored message and its version
    pub fn proto(&self) -> Result<(PlacementProto, u64)> {
        let value = self.store.get(&self.key)?;
        let message = if self.opts.is_staged {
            PlacementProto::Snapshots(value.decode()?)
        } else {
            PlacementProto::Single(value.decode()?)
        };
        Ok((message, value.version()))
    }

    /// Overwrite the key with a raw message after validating it
    pub fn set_proto(&self, message: &PlacementProto) -> Result<u64> {
        match (message, self.opts.is_staged) {
            (PlacementProto::Single(p), false) => validate(&Placement::from_proto(p)?)?,
            (PlacementProto::Snapshots(ps), true) => {
                Placements::from_proto(ps)?;
            }
            (PlacementProto::Single(_), true) => {
                return Err(Error::invalid_argument(
                    "invalid proto for placement snapshots",
                ));
            }
            (PlacementProto::Snapshots(_), false) => {
                return Err(Error::invalid_argument("invalid proto for single placement"));
            }
        }
        if self.opts.dryrun {
            return Ok(0);
        }
        Ok(self.store.set(&self.key, message.encode())?)
    }

    /// Follow the key, decoding every update
    pub fn watch(&self) -> Result<PlacementWatch> {
        Ok(PlacementWatch {
            inner: self.store.watch(&self.key)?,
            staged: self.opts.is_staged,
        })
    }

    /// Validate `p` and encode what the key should hold once it is written
    fn generate(&self, p: &Placement) -> Result<Bytes> {
        validate(p)?;
        if !self.opts.is_staged {
            return Ok(PlacementProto::Single(p.to_proto()?).encode());
        }

        let mut placements = match self.store.get(&self.key) {
            Ok(value) => Placements::from_proto(&value.decode()?)?,
            Err(KvError::NotFound(_)) => Placements::default(),
            Err(e) => return Err(e.into()),
        };
        if let Some(last) = placements.latest()
            && last.cutover_nanos >= p.cutover_nanos
        {
            return Err(Error::invalid_placement(format!(
                "cutover nanos {} must be later than last placement cutover nanos {}",
                p.cutover_nanos, last.cutover_nanos
            )));
        }
        placements.push(p.clone())?;
        Ok(PlacementProto::Snapshots(placements.to_proto()?).encode())
    }

    fn placement_from_value(&self, value: &Value) -> Result<Placement> {
        decode_placement(value, self.opts.is_staged)
    }
}

fn decode_placement(value: &Value, staged: bool) -> Result<Placement> {
    let placement = if staged {
        Placements::from_proto(&value.decode()?)?
            .into_vec()
            .pop()
            .ok_or_else(|| Error::KeyNotFound("no placement in the snapshots".to_string()))?
    } else {
        Placement::from_proto(&value.decode()?)?
    };
    Ok(placement.with_version(value.version()))
}

/// Decoded change stream of a placement key
#[derive(Debug)]
pub struct PlacementWatch {
    inner: ValueWatch,
    staged: bool,
}

impl PlacementWatch {
    /// Latest placement seen, `None` while the key is absent
    pub fn get(&self) -> Result<Option<Placement>> {
        self.inner
            .get()
            .map(|value| decode_placement(&value, self.staged))
            .transpose()
    }

    /// Wait for the next update
    pub async fn changed(&mut self) -> Result<Option<Placement>> {
        self.inner
            .changed()
            .await?
            .map(|value| decode_placement(&value, self.staged))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Instance;
    use crate::shard::{Shard, ShardState, Shards};
    use std::sync::Arc;
    use tessera_kv::MemStore;

    fn placement(cutover: i64) -> Placement {
        let shards: Shards = [0, 1]
            .into_iter()
            .map(|id| Shard::new(id).with_state(ShardState::Available))
            .collect();
        Placement::new()
            .with_instances([Instance::new_empty("i1", "r1", "z1", "i1:1", 1).with_shards(shards)])
            .with_shards(vec![0, 1])
            .with_replica_factor(1)
            .with_is_sharded(true)
            .with_cutover_nanos(cutover)
    }

    fn storage(opts: Options) -> KvPlacementStorage<Arc<MemStore>> {
        KvPlacementStorage::new(Arc::new(MemStore::new()), "_sd.placement/svc", opts)
    }

    #[test]
    fn test_set_and_read_back() {
        let s = storage(Options::default());
        assert!(s.placement().unwrap_err().is_not_found());

        let written = s.set_if_not_exist(&placement(0)).unwrap();
        assert_eq!(written.version, 1);
        assert!(matches!(
            s.set_if_not_exist(&placement(0)),
            Err(Error::KeyAlreadyExists(_))
        ));

        let read = s.placement().unwrap();
        assert_eq!(read, written);

        let updated = s.check_and_set(&read, 1).unwrap();
        assert_eq!(updated.version, 2);
        assert!(s.check_and_set(&read, 1).unwrap_err().is_retryable());

        assert_eq!(s.placement_for_version(1).unwrap().version, 1);
        assert!(s.placement_for_version(5).is_err());
    }

    #[test]
    fn test_invalid_placement_is_not_written() {
        let s = storage(Options::default());
        let mut p = placement(0);
        p.replica_factor = 2;
        assert!(matches!(s.set(&p), Err(Error::InvalidPlacement(_))));
        assert!(s.placement().is_err());
    }

    #[test]
    fn test_dryrun_skips_writes() {
        let s = storage(Options::default().with_dryrun(true));
        let p = s.set(&placement(0)).unwrap();
        assert_eq!(p.version, 0);
        assert!(s.placement().is_err());
        s.delete().unwrap();
    }

    #[test]
    fn test_staged_snapshots_append() {
        let s = storage(Options::default().with_is_staged(true));
        s.set(&placement(10)).unwrap();
        s.set(&placement(20)).unwrap();
        assert!(matches!(s.set(&placement(20)), Err(Error::InvalidPlacement(_))));

        let latest = s.placement().unwrap();
        assert_eq!(latest.cutover_nanos, 20);
        assert_eq!(latest.version, 2);

        let (message, version) = s.proto().unwrap();
        assert_eq!(version, 2);
        let PlacementProto::Snapshots(snapshots) = message else {
            panic!("expected snapshots");
        };
        assert_eq!(snapshots.snapshots.len(), 2);

        assert_eq!(s.placement_for_version(1).unwrap().cutover_nanos, 10);
    }

    #[test]
    fn test_set_proto_checks_kind() {
        let s = storage(Options::default());
        let single = PlacementProto::Single(placement(0).to_proto().unwrap());
        assert_eq!(s.set_proto(&single).unwrap(), 1);
        let (read, _) = s.proto().unwrap();
        assert_eq!(read, single);

        let snapshots = PlacementProto::Snapshots(proto::PlacementSnapshots::default());
        assert!(matches!(s.set_proto(&snapshots), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_delete() {
        let s = storage(Options::default());
        s.set(&placement(0)).unwrap();
        s.delete().unwrap();
        assert!(s.placement().is_err());
        assert!(s.delete().unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_watch_decodes_updates() {
        let s = storage(Options::default());
        let mut watch = s.watch().unwrap();
        assert!(watch.get().unwrap().is_none());

        s.set(&placement(0)).unwrap();
        let p = watch.changed().await.unwrap().unwrap();
        assert_eq!(p.version, 1);

        s.delete().unwrap();
        assert!(watch.changed().await.unwrap().is_none());
    }
}
