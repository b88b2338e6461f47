//! Configuration types for tessera
//!
//! This module defines the serializable configuration consumed by the
//! placement service, the staged placement watcher and the admin CLI.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default namespace under which placements are stored
pub const DEFAULT_PLACEMENT_NAMESPACE: &str = "_sd.placement";

/// Default namespace under which service metadata is stored
pub const DEFAULT_METADATA_NAMESPACE: &str = "_sd.metadata";

/// Root configuration for tessera
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service the placement belongs to
    pub service: ServiceConfig,
    /// Placement algorithm configuration
    pub placement: PlacementConfig,
    /// Key namespaces
    pub namespaces: NamespaceConfig,
    /// Staged placement watcher configuration
    pub watcher: WatcherConfig,
    /// Backing store configuration
    pub store: StoreConfig,
}

/// Identity of the service whose placement is managed
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,
    /// Environment (empty for none)
    pub environment: String,
    /// Zone the service runs in
    pub zone: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "tessera".to_string(),
            environment: String::new(),
            zone: "embedded".to_string(),
        }
    }
}

/// Whether transitional shard states survive in emitted placements
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStateMode {
    /// Keep Initializing/Leaving shards until they are marked available
    #[default]
    IncludeTransitionalShardStates,
    /// Mark every shard available immediately after each operation
    StableShardStateOnly,
}

/// Placement algorithm configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// A sharded replace may spread leftover shards beyond the candidates
    pub allow_partial_replace: bool,
    /// Added instances may live outside the placement's zone
    pub allow_all_zones: bool,
    /// Add every candidate instead of letting the selector pick a subset
    pub add_all_candidates: bool,
    /// Use a sharded algorithm
    pub is_sharded: bool,
    /// Use the mirrored algorithm (implies sharded)
    pub is_mirrored: bool,
    /// Keep historical placement snapshots in the store
    pub is_staged: bool,
    /// Whether transitional shard states survive in emitted placements
    pub shard_state_mode: ShardStateMode,
    /// Required zone for newly added instances
    pub valid_zone: Option<String>,
    /// Compute placements without persisting them
    pub dryrun: bool,
    /// Mark pending shard moves available before a mirrored add/remove/replace
    pub settle_before_mirrored_update: bool,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            allow_partial_replace: true,
            allow_all_zones: false,
            add_all_candidates: false,
            is_sharded: true,
            is_mirrored: false,
            is_staged: false,
            shard_state_mode: ShardStateMode::default(),
            valid_zone: None,
            dryrun: false,
            settle_before_mirrored_update: true,
        }
    }
}

/// Key namespaces for placement and metadata values
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Placement namespace
    pub placement: String,
    /// Metadata namespace
    pub metadata: String,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            placement: DEFAULT_PLACEMENT_NAMESPACE.to_string(),
            metadata: DEFAULT_METADATA_NAMESPACE.to_string(),
        }
    }
}

/// Staged placement watcher configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// How long the first watch waits for an initial value (milliseconds)
    pub init_watch_timeout_ms: u64,
}

impl WatcherConfig {
    /// Initial watch timeout as a duration
    #[must_use]
    pub const fn init_watch_timeout(&self) -> Duration {
        Duration::from_millis(self.init_watch_timeout_ms)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            init_watch_timeout_ms: 10_000,
        }
    }
}

/// Backing store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the redb database file
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/tessera/placement.redb"),
        }
    }
}
