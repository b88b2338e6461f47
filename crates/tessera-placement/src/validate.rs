//! Structural validation of placements

use crate::instance::Instance;
use crate::placement::Placement;
use crate::shard::ShardState;
use std::collections::{BTreeMap, HashMap, HashSet};
use tessera_common::{Error, Result};

/// Check the structural invariants of a placement:
/// - mirrored placements are sharded
/// - shard ids are unique and every shard on an instance is expected
/// - each shard has exactly `rf` available or initializing copies
/// - every leaving shard pairs with one initializing shard sourced from it
/// - instances sharing a shard set id own the same shards
/// - no two live copies of a shard share an isolation group
pub fn validate(p: &Placement) -> Result<()> {
    if p.is_mirrored && !p.is_sharded {
        return Err(Error::invalid_placement(
            "mirrored placement must be sharded",
        ));
    }

    let mut shard_counts: BTreeMap<u32, usize> = p.shards.iter().map(|id| (*id, 0)).collect();
    if shard_counts.len() != p.shards.len() {
        return Err(Error::invalid_placement(
            "there are duplicated shards in one replica",
        ));
    }

    let expected_total = p.shards.len() * p.replica_factor;
    let mut total_capacity = 0;
    let mut total_leaving = 0;
    let mut total_init = 0;
    let mut total_init_with_source = 0;
    let mut by_shard_set_id: HashMap<u32, &Instance> = HashMap::new();
    let mut groups_by_shard: HashMap<u32, HashSet<&str>> = HashMap::new();

    for instance in p.instances() {
        if instance.endpoint.is_empty() {
            return Err(Error::invalid_placement(format!(
                "instance {} does not contain valid endpoint",
                instance.id
            )));
        }
        if instance.shards.is_empty() && p.is_sharded {
            return Err(Error::invalid_placement(format!(
                "instance {} contains no shard in a sharded placement",
                instance.id
            )));
        }
        if !instance.shards.is_empty() && !p.is_sharded {
            return Err(Error::invalid_placement(format!(
                "instance {} contains shards in a non-sharded placement",
                instance.id
            )));
        }
        if instance.shard_set_id > p.max_shard_set_id {
            return Err(Error::invalid_placement(format!(
                "instance {} shard set id {} is larger than max shard set id {} in the placement",
                instance.id, instance.shard_set_id, p.max_shard_set_id
            )));
        }

        for shard in instance.shards.iter() {
            let Some(count) = shard_counts.get_mut(&shard.id()) else {
                return Err(Error::invalid_placement(format!(
                    "there are unexpected shard ids on instance {}",
                    instance.id
                )));
            };
            match shard.state() {
                ShardState::Available | ShardState::Initializing => {
                    *count += 1;
                    total_capacity += 1;
                    if shard.state() == ShardState::Initializing {
                        total_init += 1;
                        if !shard.source_id().is_empty() {
                            total_init_with_source += 1;
                        }
                    }
                    if !groups_by_shard
                        .entry(shard.id())
                        .or_default()
                        .insert(instance.isolation_group.as_str())
                    {
                        return Err(Error::invalid_placement(format!(
                            "shard {} has more than one copy in isolation group {}",
                            shard.id(),
                            instance.isolation_group
                        )));
                    }
                }
                ShardState::Leaving => total_leaving += 1,
                ShardState::Unknown => {
                    return Err(Error::invalid_placement(format!(
                        "invalid shard state {} for shard {}",
                        shard.state(),
                        shard.id()
                    )));
                }
            }
        }

        if instance.shard_set_id == 0 {
            continue;
        }
        match by_shard_set_id.get(&instance.shard_set_id) {
            None => {
                by_shard_set_id.insert(instance.shard_set_id, instance);
            }
            Some(existing) => {
                if existing.shards.len() != instance.shards.len() {
                    return Err(Error::invalid_placement(format!(
                        "instance {} and {} have the same shard set id {} but different number of shards",
                        existing.id, instance.id, instance.shard_set_id
                    )));
                }
                if !existing.shards.same_ids(&instance.shards) {
                    return Err(Error::invalid_placement(format!(
                        "instance {} and {} have the same shard set id {} but different shards",
                        existing.id, instance.id, instance.shard_set_id
                    )));
                }
            }
        }
    }

    if !p.is_sharded {
        return Ok(());
    }

    // Initializing may exceed leaving, e.g. in an initial placement
    if total_leaving > total_init {
        return Err(Error::invalid_placement(format!(
            "{total_leaving} shards in Leaving state, more than {total_init} in Initializing state"
        )));
    }
    if total_leaving != total_init_with_source {
        return Err(Error::invalid_placement(format!(
            "{total_leaving} shards in Leaving state, not equal {total_init_with_source} in Initializing state with source id"
        )));
    }
    if expected_total != total_capacity {
        return Err(Error::invalid_placement(format!(
            "the total available shards in the placement is {total_capacity}, expecting {expected_total}"
        )));
    }
    for (shard, count) in &shard_counts {
        if *count != p.replica_factor {
            return Err(Error::invalid_placement(format!(
                "invalid shard count for shard {shard}: expected {}, actual {count}",
                p.replica_factor
            )));
        }
    }

    validate_handoffs(p)
}

/// Every leaving shard must be matched by exactly one initializing copy
/// whose source is the leaving holder.
fn validate_handoffs(p: &Placement) -> Result<()> {
    let mut incoming: HashMap<(u32, &str), usize> = HashMap::new();
    for instance in p.instances() {
        for shard in instance.shards.iter() {
            if shard.state() == ShardState::Initializing && !shard.source_id().is_empty() {
                *incoming.entry((shard.id(), shard.source_id())).or_default() += 1;
            }
        }
    }
    for instance in p.instances() {
        for shard in instance.shards.iter() {
            if shard.state() != ShardState::Leaving {
                continue;
            }
            let n = incoming
                .get(&(shard.id(), instance.id.as_str()))
                .copied()
                .unwrap_or(0);
            if n != 1 {
                return Err(Error::invalid_placement(format!(
                    "leaving shard {} on instance {} has {n} initializing shards sourced from it",
                    shard.id(),
                    instance.id
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{Shard, Shards};

    fn shards(list: &[(u32, ShardState, &str)]) -> Shards {
        list.iter()
            .map(|(id, state, source)| Shard::new(*id).with_state(*state).with_source_id(*source))
            .collect()
    }

    fn instance(id: &str, group: &str, list: &[(u32, ShardState, &str)]) -> Instance {
        Instance::new_empty(id, group, "z1", format!("{id}:9000"), 1).with_shards(shards(list))
    }

    fn placement(instances: Vec<Instance>, num_shards: u32, rf: usize) -> Placement {
        Placement::new()
            .with_instances(instances)
            .with_shards((0..num_shards).collect())
            .with_replica_factor(rf)
            .with_is_sharded(true)
    }

    use ShardState::{Available as A, Initializing as I, Leaving as L};

    #[test]
    fn test_valid_placement() {
        let p = placement(
            vec![
                instance("i1", "r1", &[(0, A, ""), (1, A, "")]),
                instance("i2", "r2", &[(0, A, ""), (1, A, "")]),
            ],
            2,
            2,
        );
        validate(&p).unwrap();
    }

    #[test]
    fn test_valid_handoff() {
        let p = placement(
            vec![
                instance("i1", "r1", &[(0, L, ""), (1, A, "")]),
                instance("i2", "r2", &[(0, A, ""), (1, A, "")]),
                instance("i3", "r3", &[(0, I, "i1")]),
            ],
            2,
            2,
        );
        validate(&p).unwrap();
    }

    #[test]
    fn test_mirrored_must_be_sharded() {
        let p = Placement::new().with_is_mirrored(true);
        assert!(validate(&p).is_err());
    }

    #[test]
    fn test_duplicated_and_unexpected_shards() {
        let p = placement(vec![], 2, 1).with_shards(vec![0, 0]);
        assert!(validate(&p).is_err());

        let p = placement(vec![instance("i1", "r1", &[(0, A, ""), (5, A, "")])], 1, 1);
        let err = validate(&p).unwrap_err().to_string();
        assert!(err.contains("unexpected shard ids"), "{err}");
    }

    #[test]
    fn test_missing_endpoint() {
        let mut i = instance("i1", "r1", &[(0, A, "")]);
        i.endpoint.clear();
        assert!(validate(&placement(vec![i], 1, 1)).is_err());
    }

    #[test]
    fn test_shard_count_mismatch() {
        let p = placement(
            vec![
                instance("i1", "r1", &[(0, A, ""), (1, A, "")]),
                instance("i2", "r2", &[(0, A, "")]),
            ],
            2,
            2,
        );
        assert!(validate(&p).is_err());
    }

    #[test]
    fn test_leaving_without_initializing() {
        let p = placement(
            vec![
                instance("i1", "r1", &[(0, L, "")]),
                instance("i2", "r2", &[(0, A, "")]),
            ],
            1,
            1,
        );
        assert!(validate(&p).is_err());
    }

    #[test]
    fn test_handoff_source_must_match_leaving_holder() {
        let p = placement(
            vec![
                instance("i1", "r1", &[(0, L, "")]),
                instance("i2", "r2", &[(0, I, "i9")]),
            ],
            1,
            1,
        );
        let err = validate(&p).unwrap_err().to_string();
        assert!(err.contains("sourced from it"), "{err}");
    }

    #[test]
    fn test_same_group_copies_rejected() {
        let p = placement(
            vec![
                instance("i1", "r1", &[(0, A, "")]),
                instance("i2", "r1", &[(0, A, "")]),
            ],
            1,
            2,
        );
        assert!(validate(&p).is_err());
    }

    #[test]
    fn test_shard_set_mismatch() {
        let p = placement(
            vec![
                instance("i1", "r1", &[(0, A, "")]).with_shard_set_id(1),
                instance("i2", "r2", &[(1, A, "")]).with_shard_set_id(1),
            ],
            2,
            1,
        )
        .with_max_shard_set_id(1);
        let err = validate(&p).unwrap_err().to_string();
        assert!(err.contains("different shards"), "{err}");
    }

    #[test]
    fn test_shard_set_id_above_max() {
        let p = placement(
            vec![instance("i1", "r1", &[(0, A, "")]).with_shard_set_id(3)],
            1,
            1,
        )
        .with_max_shard_set_id(2);
        assert!(validate(&p).is_err());
    }

    #[test]
    fn test_non_sharded_placement() {
        let p = Placement::new()
            .with_instances([Instance::new_empty("i1", "r1", "z1", "i1:1", 1)])
            .with_replica_factor(1);
        validate(&p).unwrap();

        let p = p.with_instances([instance("i1", "r1", &[(0, A, "")])]);
        assert!(validate(&p).is_err());
    }
}
