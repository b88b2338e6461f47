//! tessera protocol - placement wire messages
//!
//! Protobuf-compatible messages for persisting placements in the backing
//! store. The field tags are part of the stored format and must not change.

use std::collections::HashMap;

/// A single placement snapshot
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Placement {
    /// Instances keyed by instance id
    #[prost(map = "string, message", tag = "1")]
    pub instances: HashMap<String, Instance>,
    #[prost(uint32, tag = "2")]
    pub replica_factor: u32,
    /// Shard ids are `0..num_shards`
    #[prost(uint32, tag = "3")]
    pub num_shards: u32,
    #[prost(bool, tag = "4")]
    pub is_sharded: bool,
    /// Nanoseconds since the unix epoch at which the placement takes effect
    #[prost(int64, tag = "5")]
    pub cutover_time: i64,
    #[prost(bool, tag = "6")]
    pub is_mirrored: bool,
    #[prost(uint32, tag = "7")]
    pub max_shard_set_id: u32,
}

/// An instance owning a set of shards
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Instance {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub isolation_group: String,
    #[prost(string, tag = "3")]
    pub zone: String,
    #[prost(uint32, tag = "4")]
    pub weight: u32,
    #[prost(string, tag = "5")]
    pub endpoint: String,
    #[prost(message, repeated, tag = "6")]
    pub shards: Vec<Shard>,
    #[prost(uint32, tag = "7")]
    pub shard_set_id: u32,
    #[prost(string, tag = "8")]
    pub hostname: String,
    #[prost(uint32, tag = "9")]
    pub port: u32,
    #[prost(message, optional, tag = "10")]
    pub metadata: Option<InstanceMetadata>,
}

/// Auxiliary instance metadata
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InstanceMetadata {
    #[prost(uint32, tag = "1")]
    pub debug_port: u32,
}

/// A shard owned by an instance
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Shard {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(enumeration = "ShardState", tag = "2")]
    pub state: i32,
    /// Instance the shard is migrating from
    #[prost(string, tag = "3")]
    pub source_id: String,
    #[prost(int64, tag = "4")]
    pub cutover_nanos: i64,
    #[prost(int64, tag = "5")]
    pub cutoff_nanos: i64,
}

/// Shard state on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ShardState {
    Initializing = 0,
    Available = 1,
    Leaving = 2,
}

/// Staged placements, interpreted in order and then sorted by cutover
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PlacementSnapshots {
    #[prost(message, repeated, tag = "1")]
    pub snapshots: Vec<Placement>,
}
