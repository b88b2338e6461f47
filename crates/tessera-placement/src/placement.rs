//! Placement snapshots
//!
//! A [`Placement`] is the assignment of shards to instances at one point in
//! time. Placements are values: every algorithm returns a new one and never
//! mutates its input. [`Placements`] is a cutover-ordered list of snapshots
//! (a staged placement).

use crate::instance::Instance;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tessera_common::{Error, Result};
use tessera_proto as proto;

/// Assignment of shards to instances
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Placement {
    /// Instances keyed by id
    pub instances: BTreeMap<String, Instance>,
    pub replica_factor: usize,
    /// Canonical shard ids
    pub shards: Vec<u32>,
    pub is_sharded: bool,
    pub is_mirrored: bool,
    /// Time at which the placement takes effect
    pub cutover_nanos: i64,
    /// High-water mark of shard set ids ever assigned
    pub max_shard_set_id: u32,
    /// Version in the backing store, 0 if never persisted
    pub version: u64,
}

impl Placement {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the instance set
    #[must_use]
    pub fn with_instances(mut self, instances: impl IntoIterator<Item = Instance>) -> Self {
        self.instances = instances
            .into_iter()
            .map(|instance| (instance.id.clone(), instance))
            .collect();
        self
    }

    #[must_use]
    pub fn with_shards(mut self, shards: Vec<u32>) -> Self {
        self.shards = shards;
        self
    }

    #[must_use]
    pub const fn with_replica_factor(mut self, rf: usize) -> Self {
        self.replica_factor = rf;
        self
    }

    #[must_use]
    pub const fn with_is_sharded(mut self, v: bool) -> Self {
        self.is_sharded = v;
        self
    }

    #[must_use]
    pub const fn with_is_mirrored(mut self, v: bool) -> Self {
        self.is_mirrored = v;
        self
    }

    #[must_use]
    pub const fn with_cutover_nanos(mut self, nanos: i64) -> Self {
        self.cutover_nanos = nanos;
        self
    }

    #[must_use]
    pub const fn with_max_shard_set_id(mut self, id: u32) -> Self {
        self.max_shard_set_id = id;
        self
    }

    #[must_use]
    pub const fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Instances in ascending id order
    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    #[must_use]
    pub fn instance(&self, id: &str) -> Option<&Instance> {
        self.instances.get(id)
    }

    /// Instances holding a copy of the shard in any state, in id order
    #[must_use]
    pub fn instances_for_shard(&self, shard: u32) -> Vec<&Instance> {
        self.instances
            .values()
            .filter(|instance| instance.shards.contains(shard))
            .collect()
    }

    #[must_use]
    pub fn num_instances(&self) -> usize {
        self.instances.len()
    }

    #[must_use]
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn to_proto(&self) -> Result<proto::Placement> {
        let mut instances = std::collections::HashMap::with_capacity(self.instances.len());
        for instance in self.instances.values() {
            instances.insert(instance.id.clone(), instance.to_proto()?);
        }
        Ok(proto::Placement {
            instances,
            replica_factor: u32::try_from(self.replica_factor)
                .map_err(|_| Error::invalid_argument("replica factor out of range"))?,
            num_shards: u32::try_from(self.shards.len())
                .map_err(|_| Error::invalid_argument("too many shards"))?,
            is_sharded: self.is_sharded,
            cutover_time: self.cutover_nanos,
            is_mirrored: self.is_mirrored,
            max_shard_set_id: self.max_shard_set_id,
        })
    }

    /// Decode a placement. Shard ids are `0..num_shards`.
    pub fn from_proto(p: &proto::Placement) -> Result<Self> {
        let mut instances = BTreeMap::new();
        for instance in p.instances.values() {
            let instance = Instance::from_proto(instance)?;
            instances.insert(instance.id.clone(), instance);
        }
        Ok(Self {
            instances,
            replica_factor: p.replica_factor as usize,
            shards: (0..p.num_shards).collect(),
            is_sharded: p.is_sharded,
            is_mirrored: p.is_mirrored,
            cutover_nanos: p.cutover_time,
            max_shard_set_id: p.max_shard_set_id,
            version: 0,
        })
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Placement[NumInstances={}, NumShards={}, ReplicaFactor={}, IsSharded={}, IsMirrored={}]",
            self.num_instances(),
            self.num_shards(),
            self.replica_factor,
            self.is_sharded,
            self.is_mirrored
        )
    }
}

/// Placements ordered by ascending cutover time
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Placements(Vec<Placement>);

impl Placements {
    /// Build from placements in any order; they are sorted by cutover.
    #[must_use]
    pub fn new(mut placements: Vec<Placement>) -> Self {
        placements.sort_by_key(|p| p.cutover_nanos);
        Self(placements)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Placement> {
        self.0.iter()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Placement] {
        &self.0
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<Placement> {
        self.0
    }

    /// Placement with the latest cutover
    #[must_use]
    pub fn latest(&self) -> Option<&Placement> {
        self.0.last()
    }

    /// Append a placement whose cutover is later than every existing one
    pub fn push(&mut self, placement: Placement) -> Result<()> {
        if let Some(last) = self.0.last()
            && placement.cutover_nanos <= last.cutover_nanos
        {
            return Err(Error::invalid_argument(format!(
                "placement cutover time {} must be later than the last cutover time {}",
                placement.cutover_nanos, last.cutover_nanos
            )));
        }
        self.0.push(placement);
        Ok(())
    }

    /// Index of the last placement whose cutover is no later than
    /// `time_nanos`, or `None` if every placement is still in the future.
    #[must_use]
    pub fn active_index(&self, time_nanos: i64) -> Option<usize> {
        self.0
            .partition_point(|p| p.cutover_nanos <= time_nanos)
            .checked_sub(1)
    }

    pub fn to_proto(&self) -> Result<proto::PlacementSnapshots> {
        Ok(proto::PlacementSnapshots {
            snapshots: self
                .0
                .iter()
                .map(Placement::to_proto)
                .collect::<Result<_>>()?,
        })
    }

    pub fn from_proto(p: &proto::PlacementSnapshots) -> Result<Self> {
        let placements = p
            .snapshots
            .iter()
            .map(Placement::from_proto)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(placements))
    }
}

impl From<Vec<Placement>> for Placements {
    fn from(placements: Vec<Placement>) -> Self {
        Self::new(placements)
    }
}
