//! Placement service
//!
//! Every mutation follows the same cycle: read the current placement with
//! its version, run the pre-update check, apply the algorithm, validate the
//! result and compare-and-set it at the version that was read. A writer
//! losing the race gets [`Error::VersionMismatch`] and retries at its own
//! discretion.

use crate::algo::Algorithm;
use crate::instance::Instance;
use crate::options::Options;
use crate::placement::Placement;
use crate::selector::{InstanceSelector, instance_selector};
use crate::shard::ShardState;
use crate::storage::KvPlacementStorage;
use crate::validate::validate;
use std::fmt;
use std::sync::Arc;
use tessera_common::{Error, Result};
use tessera_kv::Store;
use tracing::info;

/// Where a service reads and writes its placement
pub trait PlacementStore: Send + Sync {
    fn set(&self, p: &Placement) -> Result<Placement>;

    /// Write if the stored version still equals `version`
    fn check_and_set(&self, p: &Placement, version: u64) -> Result<Placement>;

    fn set_if_not_exist(&self, p: &Placement) -> Result<Placement>;

    fn placement(&self) -> Result<Placement>;
}

impl<S: Store> PlacementStore for KvPlacementStorage<S> {
    fn set(&self, p: &Placement) -> Result<Placement> {
        Self::set(self, p)
    }

    fn check_and_set(&self, p: &Placement, version: u64) -> Result<Placement> {
        Self::check_and_set(self, p, version)
    }

    fn set_if_not_exist(&self, p: &Placement) -> Result<Placement> {
        Self::set_if_not_exist(self, p)
    }

    fn placement(&self) -> Result<Placement> {
        Self::placement(self)
    }
}

/// Placement operations over a [`PlacementStore`]
pub struct PlacementService<T: PlacementStore> {
    store: T,
    opts: Options,
    algo: Algorithm,
    selector: Arc<dyn InstanceSelector>,
}

impl<T: PlacementStore> fmt::Debug for PlacementService<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlacementService")
            .field("algo", &self.algo.name())
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

impl<T: PlacementStore> PlacementService<T> {
    pub fn new(store: T, opts: Options) -> Self {
        let selector = instance_selector(&opts);
        Self {
            algo: Algorithm::new(&opts),
            store,
            opts,
            selector,
        }
    }

    #[must_use]
    pub const fn store(&self) -> &T {
        &self.store
    }

    #[must_use]
    pub const fn options(&self) -> &Options {
        &self.opts
    }

    /// Current placement with its version
    pub fn placement(&self) -> Result<Placement> {
        self.store.placement()
    }

    /// Place `num_shards` shards on the selected candidates. Fails if a
    /// placement already exists.
    pub fn build_initial_placement(
        &self,
        candidates: &[Instance],
        num_shards: u32,
        rf: usize,
    ) -> Result<Placement> {
        if rf == 0 {
            return Err(Error::invalid_argument(format!(
                "could not build initial placement, invalid replica factor {rf}"
            )));
        }

        let instances = self.selector.select_initial_instances(candidates, rf)?;
        let shards: Vec<u32> = (0..num_shards).collect();
        let p = self.algo.initial_placement(&instances, &shards, rf)?;
        validate(&p)?;
        let p = self.store.set_if_not_exist(&p)?;
        info!(
            "Built initial {} placement with {} instances, {} shards, rf {}",
            self.algo.name(),
            p.num_instances(),
            num_shards,
            rf
        );
        Ok(p)
    }

    pub fn add_replica(&self) -> Result<Placement> {
        self.update(|cur| self.algo.add_replica(cur))
    }

    /// Add the candidates the selector picks. Also returns the added
    /// instances as they appear in the new placement.
    pub fn add_instances(&self, candidates: &[Instance]) -> Result<(Placement, Vec<Instance>)> {
        let cur = self.current()?;
        let adding = self.selector.select_adding_instances(candidates, &cur)?;
        let p = self.algo.add_instances(&cur, &adding)?;
        validate(&p)?;
        let added = placed(&p, &adding)?;
        let p = self.store.check_and_set(&p, cur.version)?;
        info!(
            "Added instances [{}], placement at version {}",
            ids(&added),
            p.version
        );
        Ok((p, added))
    }

    pub fn remove_instances(&self, ids: &[String]) -> Result<Placement> {
        self.update(|cur| self.algo.remove_instances(cur, ids))
    }

    /// Replace `leaving_ids` with the candidates the selector picks. Also
    /// returns the added instances as they appear in the new placement.
    pub fn replace_instances(
        &self,
        leaving_ids: &[String],
        candidates: &[Instance],
    ) -> Result<(Placement, Vec<Instance>)> {
        let cur = self.current()?;
        let adding = self
            .selector
            .select_replace_instances(candidates, leaving_ids, &cur)?;
        let p = self.algo.replace_instances(&cur, leaving_ids, &adding)?;
        validate(&p)?;
        let added = placed(&p, &adding)?;
        let p = self.store.check_and_set(&p, cur.version)?;
        info!(
            "Replaced [{}] with [{}], placement at version {}",
            leaving_ids.join(","),
            ids(&added),
            p.version
        );
        Ok((p, added))
    }

    pub fn mark_shards_available(&self, instance_id: &str, shard_ids: &[u32]) -> Result<Placement> {
        self.update(|cur| self.algo.mark_shards_available(cur, instance_id, shard_ids))
    }

    /// Mark every initializing shard of one instance available
    pub fn mark_instance_available(&self, instance_id: &str) -> Result<Placement> {
        self.update(|cur| {
            let instance = cur
                .instance(instance_id)
                .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))?;
            let shard_ids: Vec<u32> = instance
                .shards
                .shards_for_state(ShardState::Initializing)
                .iter()
                .map(|s| s.id())
                .collect();
            self.algo.mark_shards_available(cur, instance_id, &shard_ids)
        })
    }

    /// Returns the current placement untouched when nothing was pending
    pub fn mark_all_shards_available(&self) -> Result<Placement> {
        let cur = self.current()?;
        let (p, updated) = self.algo.mark_all_shards_available(&cur)?;
        if !updated {
            return Ok(cur);
        }
        validate(&p)?;
        self.store.check_and_set(&p, cur.version)
    }

    /// Read the current placement and run the pre-update check on it
    fn current(&self) -> Result<Placement> {
        let cur = self.store.placement()?;
        (self.opts.validate_fn_before_update)(&cur)?;
        Ok(cur)
    }

    fn update(&self, op: impl FnOnce(&Placement) -> Result<Placement>) -> Result<Placement> {
        let cur = self.current()?;
        let p = op(&cur)?;
        validate(&p)?;
        self.store.check_and_set(&p, cur.version)
    }
}

/// The new placement's copy of every instance in `adding`
fn placed(p: &Placement, adding: &[Instance]) -> Result<Vec<Instance>> {
    adding
        .iter()
        .map(|instance| {
            p.instance(&instance.id).cloned().ok_or_else(|| {
                Error::internal(format!(
                    "unable to find added instance {} in new placement",
                    instance.id
                ))
            })
        })
        .collect()
}

fn ids(instances: &[Instance]) -> String {
    instances
        .iter()
        .map(|i| i.id.as_str())
        .collect::<Vec<_>>()
        .join(",")
}
