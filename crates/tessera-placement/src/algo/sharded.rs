//! Sharded placement algorithm
//!
//! Every operation copies the input placement into a [`PlacementHelper`],
//! moves shards there and emits a new placement. Shards moved in one
//! operation come out `Initializing` on the receiver with a `Leaving` twin
//! on the sender, until they are marked available.

use super::helper::{
    self, AddKind, ExistingKind, Optimize, PlacementHelper, add_instance_to_placement,
    load_on_instance, new_shards, try_cleanup_shard_state,
};
use crate::instance::Instance;
use crate::options::Options;
use crate::placement::Placement;
use crate::shard::Shard;
use tessera_common::{Error, Result};
use tracing::debug;

#[derive(Clone, Debug)]
pub struct ShardedAlgorithm {
    opts: Options,
}

impl ShardedAlgorithm {
    #[must_use]
    pub const fn new(opts: Options) -> Self {
        Self { opts }
    }

    pub fn is_compatible_with(&self, p: &Placement) -> Result<()> {
        if !p.is_sharded {
            return Err(Error::IncompatibleAlgorithm("sharded"));
        }
        Ok(())
    }

    pub fn initial_placement(
        &self,
        instances: &[Instance],
        shards: &[u32],
        rf: usize,
    ) -> Result<Placement> {
        debug!(
            "Building initial placement of {} shards over {} instances at rf {}",
            shards.len(),
            instances.len(),
            rf
        );
        let mut helper = PlacementHelper::for_initial(instances.to_vec(), shards.to_vec(), &self.opts);
        let candidates = helper.instance_ids();
        helper.place_shards(new_shards(shards), None, &candidates)?;

        let mut p = helper.generate_placement();
        for _ in 1..rf {
            p = self.add_replica(&p)?;
        }
        try_cleanup_shard_state(p, &self.opts)
    }

    pub fn add_replica(&self, p: &Placement) -> Result<Placement> {
        self.is_compatible_with(p)?;
        debug!("Adding replica {} to placement", p.replica_factor + 1);

        let mut helper = PlacementHelper::for_add_replica(p, &self.opts);
        let candidates = helper.instance_ids();
        helper.place_shards(new_shards(&p.shards), None, &candidates)?;
        helper.optimize(Optimize::Safe);
        try_cleanup_shard_state(helper.generate_placement(), &self.opts)
    }

    pub fn remove_instances(&self, p: &Placement, ids: &[String]) -> Result<Placement> {
        self.is_compatible_with(p)?;
        debug!("Removing instances {:?}", ids);

        let mut p = p.clone();
        for id in ids {
            let mut helper = PlacementHelper::for_remove_instance(&p, id, &self.opts)?;
            // Spread the shards of the leaving instance over the rest
            let shards = detached_shards(&helper, id);
            let candidates = helper.instance_ids();
            helper.place_shards(shards, Some(id), &candidates)?;
            helper.optimize(Optimize::Safe);

            let leaving = detached_instance(&helper, id)?;
            p = add_instance_to_placement(helper.generate_placement(), leaving, AddKind::WithShards)?;
        }
        try_cleanup_shard_state(p, &self.opts)
    }

    pub fn add_instances(&self, p: &Placement, instances: &[Instance]) -> Result<Placement> {
        self.is_compatible_with(p)?;

        let mut p = p.clone();
        for instance in instances {
            debug!("Adding instance {}", instance.id);
            let mut helper = PlacementHelper::for_add_instance(
                &p,
                instance,
                &self.opts,
                ExistingKind::WithLeavingShardsOnly,
            )?;
            helper.add_instance(&instance.id);
            p = helper.generate_placement();
        }
        try_cleanup_shard_state(p, &self.opts)
    }

    pub fn replace_instances(
        &self,
        p: &Placement,
        leaving_ids: &[String],
        adding: &[Instance],
    ) -> Result<Placement> {
        self.is_compatible_with(p)?;
        debug!(
            "Replacing instances {:?} with {} instances",
            leaving_ids,
            adding.len()
        );

        let mut helper =
            PlacementHelper::for_replace_instances(p, leaving_ids, adding, &self.opts)?;
        let adding_ids: Vec<String> = adding.iter().map(|i| i.id.clone()).collect();

        for id in leaving_ids {
            let shards = detached_shards(&helper, id);
            match helper.place_shards(shards, Some(id), &adding_ids) {
                // The rest of the cluster may still have room in other groups
                Ok(()) | Err(Error::NotEnoughIsolationGroups) => {}
                Err(e) => return Err(e),
            }
            let load = helper.detached(id).map_or(0, load_on_instance);
            if load != 0 && !self.opts.allow_partial_replace {
                return Err(Error::PartialReplacement {
                    instance: id.clone(),
                    unassigned: usize::try_from(load).unwrap_or_default(),
                });
            }
        }

        if self.opts.allow_partial_replace {
            for id in leaving_ids {
                let shards = detached_shards(&helper, id);
                let candidates = helper.instance_ids();
                helper.place_shards(shards, Some(id), &candidates)?;
            }
            helper.optimize(Optimize::Unsafe);
        }

        let mut p = helper.generate_placement();
        for id in leaving_ids {
            let leaving = detached_instance(&helper, id)?;
            p = add_instance_to_placement(p, leaving, AddKind::WithShards)?;
        }
        try_cleanup_shard_state(p, &self.opts)
    }

    pub fn mark_shards_available(
        &self,
        p: &Placement,
        instance_id: &str,
        shard_ids: &[u32],
    ) -> Result<Placement> {
        self.is_compatible_with(p)?;
        helper::mark_shards_available(p.clone(), instance_id, shard_ids, &self.opts)
    }

    pub fn mark_all_shards_available(&self, p: &Placement) -> Result<(Placement, bool)> {
        self.is_compatible_with(p)?;
        helper::mark_all_shards_available(p, &self.opts)
    }
}

fn detached_shards(helper: &PlacementHelper, id: &str) -> Vec<Shard> {
    helper
        .detached(id)
        .map(|i| i.shards.iter().cloned().collect())
        .unwrap_or_default()
}

fn detached_instance(helper: &PlacementHelper, id: &str) -> Result<Instance> {
    helper
        .detached(id)
        .cloned()
        .ok_or_else(|| Error::InstanceNotFound(id.to_string()))
}
