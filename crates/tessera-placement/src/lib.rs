//! tessera placement - shard placement engine
//!
//! Decides which instances own which shards of a sharded service, and how
//! that assignment changes as instances join, leave or get replaced.
//!
//! # Layers
//!
//! - [`algo`]: pure placement algorithms (sharded, mirrored, non-sharded)
//! - [`selector`]: picks instances out of a candidate pool
//! - [`service`]: read, compute, validate and compare-and-set cycle
//! - [`storage`]: placements on a versioned [`tessera_kv::Store`]
//! - [`staged`] and [`watcher`]: time-staged placements for clients
//!
//! # Example
//! ```ignore
//! use tessera_placement::{Instance, Options, PlacementService, KvPlacementStorage};
//!
//! let storage = KvPlacementStorage::new(store, "_sd.placement/svc", Options::default());
//! let svc = PlacementService::new(storage, Options::default());
//! let p = svc.build_initial_placement(&candidates, 1024, 3)?;
//! ```

pub mod algo;
pub mod instance;
pub mod namespace;
pub mod operator;
pub mod options;
pub mod placement;
pub mod selector;
pub mod service;
pub mod shard;
pub mod staged;
pub mod storage;
pub mod validate;
pub mod watcher;

pub use algo::{Algorithm, MirroredAlgorithm, NonShardedAlgorithm, ShardedAlgorithm};
pub use instance::{Instance, InstanceMetadata};
pub use namespace::{NamespaceOptions, ServiceId, metadata_key, placement_key};
pub use operator::{InMemoryPlacement, PlacementOperator};
pub use options::{Options, ShardValidateFn, TimeNanosFn, ValidateFn, now_nanos};
pub use placement::{Placement, Placements};
pub use selector::{
    CustomGroupMirroredSelector, GroupIdFn, InstanceSelector, NonMirroredSelector,
    PortMirroredSelector, instance_selector, map_group_id_fn,
};
pub use service::{PlacementService, PlacementStore};
pub use shard::{DEFAULT_CUTOFF_NANOS, DEFAULT_CUTOVER_NANOS, Shard, ShardState, Shards};
pub use staged::{
    ActivePlacementGuard, ActiveStagedPlacement, ActiveStagedPlacementOptions, PlacementsFn,
    StagedPlacement,
};
pub use storage::{KvPlacementStorage, PlacementProto, PlacementWatch};
pub use validate::validate;
pub use watcher::{StagedPlacementWatcher, StagedPlacementWatcherOptions};
