//! Shards and shard sets
//!
//! A shard is an integer id together with its lifecycle state on one
//! instance. Shards move `Initializing -> Available -> Leaving`; the
//! `Unknown` state only exists inside the helper for shards that were
//! assigned during the current operation and have not been emitted yet.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use tessera_common::{Error, Result};
use tessera_proto as proto;

/// Default cutover: the shard may serve immediately
pub const DEFAULT_CUTOVER_NANOS: i64 = 0;

/// Default cutoff: a leaving shard keeps serving forever
pub const DEFAULT_CUTOFF_NANOS: i64 = i64::MAX;

/// Lifecycle state of a shard on one instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ShardState {
    /// Assigned in the current operation, not yet emitted
    Unknown,
    Initializing,
    Available,
    Leaving,
}

impl ShardState {
    /// Wire representation. `Unknown` shards cannot be persisted.
    pub fn to_proto(self) -> Result<proto::ShardState> {
        match self {
            Self::Initializing => Ok(proto::ShardState::Initializing),
            Self::Available => Ok(proto::ShardState::Available),
            Self::Leaving => Ok(proto::ShardState::Leaving),
            Self::Unknown => Err(Error::invalid_shard_state(
                "shard in unknown state cannot be encoded",
            )),
        }
    }

    /// Parse the wire representation
    pub fn from_proto(state: i32) -> Result<Self> {
        match proto::ShardState::try_from(state) {
            Ok(proto::ShardState::Initializing) => Ok(Self::Initializing),
            Ok(proto::ShardState::Available) => Ok(Self::Available),
            Ok(proto::ShardState::Leaving) => Ok(Self::Leaving),
            Err(_) => Err(Error::invalid_shard_state(format!(
                "invalid proto shard state {state}"
            ))),
        }
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "Unknown",
            Self::Initializing => "Initializing",
            Self::Available => "Available",
            Self::Leaving => "Leaving",
        };
        f.write_str(s)
    }
}

/// A shard owned by an instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Shard {
    id: u32,
    state: ShardState,
    source_id: String,
    cutover_nanos: i64,
    /// Stored as 0 when it equals [`DEFAULT_CUTOFF_NANOS`]
    cutoff_nanos: i64,
}

impl Shard {
    /// Create a shard in the `Unknown` state
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self {
            id,
            state: ShardState::Unknown,
            source_id: String::new(),
            cutover_nanos: 0,
            cutoff_nanos: 0,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub const fn state(&self) -> ShardState {
        self.state
    }

    #[must_use]
    pub const fn with_state(mut self, state: ShardState) -> Self {
        self.state = state;
        self
    }

    pub const fn set_state(&mut self, state: ShardState) {
        self.state = state;
    }

    /// Instance the shard is migrating from, empty if none
    #[must_use]
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    #[must_use]
    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = source_id.into();
        self
    }

    pub fn set_source_id(&mut self, source_id: impl Into<String>) {
        self.source_id = source_id.into();
    }

    /// Earliest time the shard may serve traffic
    #[must_use]
    pub const fn cutover_nanos(&self) -> i64 {
        self.cutover_nanos
    }

    #[must_use]
    pub const fn with_cutover_nanos(mut self, nanos: i64) -> Self {
        self.cutover_nanos = nanos;
        self
    }

    pub const fn set_cutover_nanos(&mut self, nanos: i64) {
        self.cutover_nanos = nanos;
    }

    /// Latest time a leaving shard keeps serving traffic
    #[must_use]
    pub const fn cutoff_nanos(&self) -> i64 {
        if self.cutoff_nanos == 0 {
            DEFAULT_CUTOFF_NANOS
        } else {
            self.cutoff_nanos
        }
    }

    #[must_use]
    pub const fn with_cutoff_nanos(mut self, nanos: i64) -> Self {
        self.set_cutoff_nanos(nanos);
        self
    }

    pub const fn set_cutoff_nanos(&mut self, nanos: i64) {
        self.cutoff_nanos = if nanos == DEFAULT_CUTOFF_NANOS { 0 } else { nanos };
    }

    pub fn to_proto(&self) -> Result<proto::Shard> {
        Ok(proto::Shard {
            id: self.id,
            state: self.state.to_proto()? as i32,
            source_id: self.source_id.clone(),
            cutover_nanos: self.cutover_nanos,
            cutoff_nanos: self.cutoff_nanos,
        })
    }

    pub fn from_proto(shard: &proto::Shard) -> Result<Self> {
        Ok(Self::new(shard.id)
            .with_state(ShardState::from_proto(shard.state)?)
            .with_source_id(shard.source_id.clone())
            .with_cutover_nanos(shard.cutover_nanos)
            .with_cutoff_nanos(shard.cutoff_nanos))
    }
}

/// A set of shards keyed and ordered by shard id
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Shards(BTreeMap<u32, Shard>);

impl Shards {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of shards in the set
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Shard ids in ascending order
    #[must_use]
    pub fn ids(&self) -> Vec<u32> {
        self.0.keys().copied().collect()
    }

    /// Shards in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = &Shard> {
        self.0.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Shard> {
        self.0.values_mut()
    }

    /// Add a shard, replacing any shard with the same id
    pub fn add(&mut self, shard: Shard) {
        self.0.insert(shard.id(), shard);
    }

    pub fn remove(&mut self, id: u32) -> Option<Shard> {
        self.0.remove(&id)
    }

    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.0.contains_key(&id)
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<&Shard> {
        self.0.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Shard> {
        self.0.get_mut(&id)
    }

    #[must_use]
    pub fn num_shards_for_state(&self, state: ShardState) -> usize {
        self.0.values().filter(|s| s.state() == state).count()
    }

    #[must_use]
    pub fn shards_for_state(&self, state: ShardState) -> Vec<Shard> {
        self.0
            .values()
            .filter(|s| s.state() == state)
            .cloned()
            .collect()
    }

    /// True if both sets hold the same shard ids
    #[must_use]
    pub fn same_ids(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && self.0.keys().eq(other.0.keys())
    }

    pub fn to_proto(&self) -> Result<Vec<proto::Shard>> {
        self.0.values().map(Shard::to_proto).collect()
    }

    pub fn from_proto(shards: &[proto::Shard]) -> Result<Self> {
        let mut set = Self::new();
        for shard in shards {
            set.add(Shard::from_proto(shard)?);
        }
        Ok(set)
    }
}

impl FromIterator<Shard> for Shards {
    fn from_iter<I: IntoIterator<Item = Shard>>(iter: I) -> Self {
        let mut set = Self::new();
        for shard in iter {
            set.add(shard);
        }
        set
    }
}

impl Serialize for Shards {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.values())
    }
}

impl fmt::Display for Shards {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let states = [
            ShardState::Initializing,
            ShardState::Available,
            ShardState::Leaving,
        ];
        f.write_str("[")?;
        for (i, state) in states.into_iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            let ids: Vec<String> = self
                .0
                .values()
                .filter(|s| s.state() == state)
                .map(|s| s.id().to_string())
                .collect();
            write!(f, "{state}=[{}]", ids.join(" "))?;
        }
        f.write_str("]")
    }
}
