//! Placement algorithms
//!
//! Three algorithm families share one operation surface:
//! - [`NonShardedAlgorithm`]: membership only, no shards
//! - [`ShardedAlgorithm`]: shards spread over instances, one replica per
//!   isolation group
//! - [`MirroredAlgorithm`]: shard sets of `rf` instances holding identical
//!   shards
//!
//! [`Algorithm`] picks the family from [`Options`] and dispatches to it.

mod heap;
mod helper;
mod mirrored;
mod non_sharded;
mod sharded;

pub use helper::{PlacementHelper, mark_all_shards_available, mark_shards_available};
pub use mirrored::MirroredAlgorithm;
pub use non_sharded::NonShardedAlgorithm;
pub use sharded::ShardedAlgorithm;

use crate::instance::Instance;
use crate::options::Options;
use crate::placement::Placement;
use tessera_common::Result;

/// A placement algorithm chosen from the options
#[derive(Clone, Debug)]
pub enum Algorithm {
    NonSharded(NonShardedAlgorithm),
    Sharded(ShardedAlgorithm),
    Mirrored(MirroredAlgorithm),
}

impl Algorithm {
    /// Mirrored wins over sharded, sharded over non-sharded
    #[must_use]
    pub fn new(opts: &Options) -> Self {
        if opts.is_mirrored {
            Self::Mirrored(MirroredAlgorithm::new(opts.clone()))
        } else if opts.is_sharded {
            Self::Sharded(ShardedAlgorithm::new(opts.clone()))
        } else {
            Self::NonSharded(NonShardedAlgorithm::new(opts.clone()))
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NonSharded(_) => "non-sharded",
            Self::Sharded(_) => "sharded",
            Self::Mirrored(_) => "mirrored",
        }
    }

    /// Check that the placement flags match the algorithm
    pub fn is_compatible_with(&self, p: &Placement) -> Result<()> {
        match self {
            Self::NonSharded(a) => a.is_compatible_with(p),
            Self::Sharded(a) => a.is_compatible_with(p),
            Self::Mirrored(a) => a.is_compatible_with(p),
        }
    }

    pub fn initial_placement(
        &self,
        instances: &[Instance],
        shards: &[u32],
        rf: usize,
    ) -> Result<Placement> {
        match self {
            Self::NonSharded(a) => a.initial_placement(instances, shards, rf),
            Self::Sharded(a) => a.initial_placement(instances, shards, rf),
            Self::Mirrored(a) => a.initial_placement(instances, shards, rf),
        }
    }

    pub fn add_replica(&self, p: &Placement) -> Result<Placement> {
        match self {
            Self::NonSharded(a) => a.add_replica(p),
            Self::Sharded(a) => a.add_replica(p),
            Self::Mirrored(a) => a.add_replica(p),
        }
    }

    pub fn remove_instances(&self, p: &Placement, ids: &[String]) -> Result<Placement> {
        match self {
            Self::NonSharded(a) => a.remove_instances(p, ids),
            Self::Sharded(a) => a.remove_instances(p, ids),
            Self::Mirrored(a) => a.remove_instances(p, ids),
        }
    }

    pub fn add_instances(&self, p: &Placement, instances: &[Instance]) -> Result<Placement> {
        match self {
            Self::NonSharded(a) => a.add_instances(p, instances),
            Self::Sharded(a) => a.add_instances(p, instances),
            Self::Mirrored(a) => a.add_instances(p, instances),
        }
    }

    pub fn replace_instances(
        &self,
        p: &Placement,
        leaving_ids: &[String],
        adding: &[Instance],
    ) -> Result<Placement> {
        match self {
            Self::NonSharded(a) => a.replace_instances(p, leaving_ids, adding),
            Self::Sharded(a) => a.replace_instances(p, leaving_ids, adding),
            Self::Mirrored(a) => a.replace_instances(p, leaving_ids, adding),
        }
    }

    pub fn mark_shards_available(
        &self,
        p: &Placement,
        instance_id: &str,
        shard_ids: &[u32],
    ) -> Result<Placement> {
        match self {
            Self::NonSharded(a) => a.mark_shards_available(p, instance_id, shard_ids),
            Self::Sharded(a) => a.mark_shards_available(p, instance_id, shard_ids),
            Self::Mirrored(a) => a.mark_shards_available(p, instance_id, shard_ids),
        }
    }

    /// Also reports whether any shard changed state
    pub fn mark_all_shards_available(&self, p: &Placement) -> Result<(Placement, bool)> {
        match self {
            Self::NonSharded(a) => a.mark_all_shards_available(p),
            Self::Sharded(a) => a.mark_all_shards_available(p),
            Self::Mirrored(a) => a.mark_all_shards_available(p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardState;
    use crate::validate::validate;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;
    use tessera_common::Error;

    fn instance(id: &str, group: &str, weight: u32) -> Instance {
        Instance::new_empty(id, group, "z1", format!("{id}:9000"), weight)
    }

    fn assert_settled(algo: &Algorithm, p: &Placement) -> Placement {
        let (settled, _) = algo.mark_all_shards_available(p).unwrap();
        validate(&settled).unwrap();
        for instance in settled.instances() {
            assert!(!instance.shards.is_empty(), "{instance}");
            assert_eq!(
                instance.shards.num_shards_for_state(ShardState::Available),
                instance.shards.len(),
                "{instance}"
            );
        }
        settled
    }

    fn groups(p: &Placement) -> BTreeSet<String> {
        p.instances().map(|i| i.isolation_group.clone()).collect()
    }

    #[test]
    fn test_algorithm_selection() {
        assert_eq!(Algorithm::new(&Options::default()).name(), "sharded");
        assert_eq!(
            Algorithm::new(&Options::default().with_is_sharded(false)).name(),
            "non-sharded"
        );
        assert_eq!(
            Algorithm::new(&Options::default().with_is_mirrored(true)).name(),
            "mirrored"
        );
    }

    #[test]
    fn test_incompatible_placement() {
        let algo = Algorithm::new(&Options::default());
        let p = Placement::new();
        assert!(matches!(
            algo.is_compatible_with(&p),
            Err(Error::IncompatibleAlgorithm("sharded"))
        ));
    }

    #[test]
    fn test_random_operations_keep_placements_valid() {
        let mut rng = StdRng::seed_from_u64(42);
        for round in 0..40 {
            let rf: usize = rng.gen_range(1..=3);
            let num_groups = rng.gen_range(rf..=rf + 2);
            let mut next_id = 0;
            let mut instances = Vec::new();
            for g in 0..num_groups {
                for _ in 0..rng.gen_range(1..=3) {
                    next_id += 1;
                    instances.push(instance(
                        &format!("i{next_id}"),
                        &format!("g{g}"),
                        rng.gen_range(1..=3),
                    ));
                }
            }

            // Enough shards for every instance to get some at rf 1
            let total_weight: u32 = instances.iter().map(|i| i.weight).sum();
            let num_shards = rng.gen_range(total_weight..=total_weight + 24);

            let algo = Algorithm::new(&Options::default());
            let shards: Vec<u32> = (0..num_shards).collect();
            let p = algo.initial_placement(&instances, &shards, rf).unwrap();
            validate(&p).unwrap();
            let mut p = assert_settled(&algo, &p);

            // Add into an existing or a new group
            next_id += 1;
            let group = format!("g{}", rng.gen_range(0..=num_groups));
            let added = algo
                .add_instances(&p, &[instance(&format!("i{next_id}"), &group, rng.gen_range(1..=3))])
                .unwrap();
            validate(&added).unwrap();
            p = assert_settled(&algo, &added);

            // Remove one instance as long as enough groups remain
            let ids: Vec<String> = p.instances().map(|i| i.id.clone()).collect();
            if let Some(victim) = ids.choose(&mut rng) {
                let mut rest = p.clone();
                let removed_group = rest.instances.remove(victim).map(|i| i.isolation_group);
                let still_has_group = removed_group
                    .as_ref()
                    .is_some_and(|g| rest.instances().any(|i| &i.isolation_group == g));
                if still_has_group || groups(&rest).len() >= rf {
                    let removed = algo
                        .remove_instances(&p, std::slice::from_ref(victim))
                        .unwrap_or_else(|e| panic!("round {round}: {e}"));
                    validate(&removed).unwrap();
                    p = assert_settled(&algo, &removed);
                }
            }

            // Replace one instance with a fresh one in the same group
            let ids: Vec<String> = p.instances().map(|i| i.id.clone()).collect();
            if let Some(victim) = ids.choose(&mut rng) {
                let group = p.instance(victim).map(|i| i.isolation_group.clone()).unwrap();
                next_id += 1;
                let replaced = algo
                    .replace_instances(
                        &p,
                        std::slice::from_ref(victim),
                        &[instance(&format!("i{next_id}"), &group, 1)],
                    )
                    .unwrap_or_else(|e| panic!("round {round}: {e}"));
                validate(&replaced).unwrap();
                p = assert_settled(&algo, &replaced);
            }

            assert_eq!(p.replica_factor, rf);
            assert_eq!(p.num_shards(), shards.len());
        }
    }

    #[test]
    fn test_random_mirrored_operations_keep_placements_valid() {
        let mut rng = StdRng::seed_from_u64(7);
        let opts = Options::default().with_is_mirrored(true);
        let algo = Algorithm::new(&opts);
        for _ in 0..20 {
            let rf: usize = rng.gen_range(1..=3);
            let num_sets: u32 = rng.gen_range(1..=4);
            let num_shards = rng.gen_range(2 * num_sets..=24);
            let mut instances = Vec::new();
            for ssid in 1..=num_sets {
                let weight = rng.gen_range(1..=2);
                for g in 0..rf {
                    instances.push(
                        instance(&format!("s{ssid}-{g}"), &format!("g{g}"), weight)
                            .with_shard_set_id(ssid),
                    );
                }
            }

            let shards: Vec<u32> = (0..num_shards).collect();
            let p = algo.initial_placement(&instances, &shards, rf).unwrap();
            validate(&p).unwrap();
            let p = assert_settled(&algo, &p);

            let new_set = num_sets + 1;
            let adding: Vec<Instance> = (0..rf)
                .map(|g| {
                    instance(&format!("s{new_set}-{g}"), &format!("g{g}"), 1)
                        .with_shard_set_id(new_set)
                })
                .collect();
            let p = algo.add_instances(&p, &adding).unwrap();
            validate(&p).unwrap();
            let p = assert_settled(&algo, &p);

            let removing: Vec<String> = (0..rf).map(|g| format!("s1-{g}")).collect();
            let p = algo.remove_instances(&p, &removing).unwrap();
            validate(&p).unwrap();
            let p = assert_settled(&algo, &p);
            assert!(p.instance("s1-0").is_none());
        }
    }
}
