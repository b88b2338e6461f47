//! Placement instances

use crate::shard::{ShardState, Shards};
use serde::Serialize;
use std::fmt;
use tessera_common::Result;
use tessera_proto as proto;

/// Auxiliary instance metadata
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct InstanceMetadata {
    /// Port serving debug endpoints
    pub debug_port: u32,
}

/// An addressable unit owning a set of shards
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Instance {
    /// Unique instance id
    pub id: String,
    /// Failure domain (rack, availability zone)
    pub isolation_group: String,
    pub zone: String,
    /// Relative capacity
    pub weight: u32,
    pub endpoint: String,
    pub hostname: String,
    pub port: u32,
    /// Instances sharing a nonzero shard set id host identical shards
    pub shard_set_id: u32,
    pub metadata: InstanceMetadata,
    pub shards: Shards,
}

impl Instance {
    /// Create an instance without shards
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Create an instance with the basic properties set and no shards
    #[must_use]
    pub fn new_empty(
        id: impl Into<String>,
        isolation_group: impl Into<String>,
        zone: impl Into<String>,
        endpoint: impl Into<String>,
        weight: u32,
    ) -> Self {
        Self {
            id: id.into(),
            isolation_group: isolation_group.into(),
            zone: zone.into(),
            endpoint: endpoint.into(),
            weight,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_isolation_group(mut self, group: impl Into<String>) -> Self {
        self.isolation_group = group.into();
        self
    }

    #[must_use]
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = zone.into();
        self
    }

    #[must_use]
    pub const fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    #[must_use]
    pub const fn with_port(mut self, port: u32) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub const fn with_shard_set_id(mut self, shard_set_id: u32) -> Self {
        self.shard_set_id = shard_set_id;
        self
    }

    #[must_use]
    pub const fn with_metadata(mut self, metadata: InstanceMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_shards(mut self, shards: Shards) -> Self {
        self.shards = shards;
        self
    }

    /// True if the instance has shards and all of them are leaving
    #[must_use]
    pub fn is_leaving(&self) -> bool {
        self.all_shards_in_state(ShardState::Leaving)
    }

    /// True if the instance has shards and all of them are initializing
    #[must_use]
    pub fn is_initializing(&self) -> bool {
        self.all_shards_in_state(ShardState::Initializing)
    }

    /// True if the instance has shards and all of them are available
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.all_shards_in_state(ShardState::Available)
    }

    fn all_shards_in_state(&self, state: ShardState) -> bool {
        !self.shards.is_empty() && self.shards.num_shards_for_state(state) == self.shards.len()
    }

    pub fn to_proto(&self) -> Result<proto::Instance> {
        Ok(proto::Instance {
            id: self.id.clone(),
            isolation_group: self.isolation_group.clone(),
            zone: self.zone.clone(),
            weight: self.weight,
            endpoint: self.endpoint.clone(),
            shards: self.shards.to_proto()?,
            shard_set_id: self.shard_set_id,
            hostname: self.hostname.clone(),
            port: self.port,
            metadata: Some(proto::InstanceMetadata {
                debug_port: self.metadata.debug_port,
            }),
        })
    }

    pub fn from_proto(instance: &proto::Instance) -> Result<Self> {
        Ok(Self {
            id: instance.id.clone(),
            isolation_group: instance.isolation_group.clone(),
            zone: instance.zone.clone(),
            weight: instance.weight,
            endpoint: instance.endpoint.clone(),
            hostname: instance.hostname.clone(),
            port: instance.port,
            shard_set_id: instance.shard_set_id,
            metadata: InstanceMetadata {
                debug_port: instance.metadata.as_ref().map_or(0, |m| m.debug_port),
            },
            shards: Shards::from_proto(&instance.shards)?,
        })
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Instance[ID={}, IsolationGroup={}, Zone={}, Weight={}, Endpoint={}, Hostname={}, Port={}, ShardSetID={}, Shards={}]",
            self.id,
            self.isolation_group,
            self.zone,
            self.weight,
            self.endpoint,
            self.hostname,
            self.port,
            self.shard_set_id,
            self.shards
        )
    }
}
