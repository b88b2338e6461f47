//! Instance selectors
//!
//! A selector decides which of the offered candidate instances an initial
//! placement, an add or a replace should pull in. The algorithms then place
//! shards on whatever the selector returns.
//!
//! - [`NonMirroredSelector`]: weight and isolation-group aware picking for
//!   sharded and non-sharded placements
//! - [`PortMirroredSelector`]: pairs hosts of equal weight across isolation
//!   groups and mirrors their instances port by port
//! - [`CustomGroupMirroredSelector`]: mirrors instances sharing a
//!   caller-supplied group id

mod custom_group;
mod mirrored;
mod non_mirrored;

pub use custom_group::{CustomGroupMirroredSelector, GroupIdFn, map_group_id_fn};
pub use mirrored::PortMirroredSelector;
pub use non_mirrored::NonMirroredSelector;

use crate::instance::Instance;
use crate::options::Options;
use crate::placement::Placement;
use std::collections::HashSet;
use std::sync::Arc;
use tessera_common::{Error, Result};

/// Chooses valid instances for a placement change
pub trait InstanceSelector: Send + Sync {
    /// Select instances for an initial placement
    fn select_initial_instances(&self, candidates: &[Instance], rf: usize)
    -> Result<Vec<Instance>>;

    /// Select instances to add to `p`
    fn select_adding_instances(&self, candidates: &[Instance], p: &Placement)
    -> Result<Vec<Instance>>;

    /// Select instances to take over from `leaving_ids` in `p`
    fn select_replace_instances(
        &self,
        candidates: &[Instance],
        leaving_ids: &[String],
        p: &Placement,
    ) -> Result<Vec<Instance>>;
}

/// The selector configured on the options, else the default for the
/// placement kind
#[must_use]
pub fn instance_selector(opts: &Options) -> Arc<dyn InstanceSelector> {
    if let Some(selector) = &opts.instance_selector {
        return Arc::clone(selector);
    }
    if opts.is_mirrored {
        Arc::new(PortMirroredSelector::new(opts.clone()))
    } else {
        Arc::new(NonMirroredSelector::new(opts.clone()))
    }
}

/// Drop candidates that are already live in the placement, then the ones
/// outside the valid zone.
///
/// A candidate already in the placement survives only while it is leaving
/// there, so that it can be added back.
pub(crate) fn valid_candidates(
    p: &Placement,
    candidates: &[Instance],
    opts: &Options,
) -> Result<Vec<Instance>> {
    let instances: Vec<Instance> = candidates
        .iter()
        .filter(|candidate| p.instance(&candidate.id).is_none_or(Instance::is_leaving))
        .cloned()
        .collect();
    let instances = filter_zones(p, instances, opts);
    if instances.is_empty() {
        return Err(Error::no_valid_instance("no valid instance in the candidate list"));
    }
    Ok(instances)
}

fn filter_zones(p: &Placement, candidates: Vec<Instance>, opts: &Options) -> Vec<Instance> {
    if candidates.is_empty() || opts.allow_all_zones {
        return candidates;
    }

    let valid_zone = opts
        .valid_zone
        .clone()
        .or_else(|| p.instances().next().map(|i| i.zone.clone()))
        .or_else(|| candidates.first().map(|i| i.zone.clone()))
        .unwrap_or_default();
    candidates
        .into_iter()
        .filter(|candidate| candidate.zone == valid_zone)
        .collect()
}

/// Look up every leaving id in the placement
pub(crate) fn leaving_instances(p: &Placement, leaving_ids: &[String]) -> Result<Vec<Instance>> {
    leaving_ids
        .iter()
        .map(|id| {
            p.instance(id)
                .cloned()
                .ok_or_else(|| Error::InstanceNotFound(id.clone()))
        })
        .collect()
}

/// A leaving instance matched with the instance taking over its shard set
#[derive(Clone, Debug)]
pub(crate) struct ReplacementGroup {
    pub leaving: Instance,
    pub replacement: Instance,
}

/// Give every replacement the shard set id of the instance it replaces,
/// ordered like `leaving_ids`
pub(crate) fn assign_shard_set_ids_to_replacements(
    leaving_ids: &[String],
    groups: Vec<ReplacementGroup>,
) -> Result<Vec<Instance>> {
    if groups.len() != leaving_ids.len() {
        return Err(Error::no_valid_instance(format!(
            "failed to find {} replacement instances to replace {} leaving instances",
            groups.len(),
            leaving_ids.len()
        )));
    }

    let mut slots: Vec<Option<Instance>> = vec![None; leaving_ids.len()];
    for group in groups {
        let idx = leaving_ids
            .iter()
            .position(|id| *id == group.leaving.id)
            .ok_or_else(|| {
                Error::internal(format!(
                    "could not find instance id {} in leaving instances",
                    group.leaving.id
                ))
            })?;
        slots[idx] = Some(group.replacement.with_shard_set_id(group.leaving.shard_set_id));
    }
    slots
        .into_iter()
        .zip(leaving_ids)
        .map(|(slot, id)| {
            slot.ok_or_else(|| Error::no_valid_instance(format!("no replacement for {id}")))
        })
        .collect()
}

/// Flatten mirrored groups, handing out fresh shard set ids above the
/// placement's high-water mark to every group not already sharing one
pub(crate) fn assign_shard_sets_to_grouped_instances(
    groups: Vec<Vec<Instance>>,
    p: &Placement,
) -> Vec<Instance> {
    let mut next_shard_set_id = p.max_shard_set_id + 1;
    let mut instances = Vec::with_capacity(p.replica_factor * groups.len());
    for group in groups {
        if should_use_new_shard_set_id(&group, p) {
            let ssid = next_shard_set_id;
            next_shard_set_id += 1;
            instances.extend(group.into_iter().map(|i| i.with_shard_set_id(ssid)));
        } else {
            instances.extend(group);
        }
    }
    instances
}

fn should_use_new_shard_set_id(group: &[Instance], p: &Placement) -> bool {
    let mut seen = HashSet::new();
    for instance in group {
        match p.instance(&instance.id) {
            Some(existing) => {
                seen.insert(existing.shard_set_id);
            }
            None => return true,
        }
    }
    seen.len() > 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{Shard, ShardState, Shards};

    fn instance(id: &str, zone: &str) -> Instance {
        Instance::new_empty(id, "r1", zone, format!("{id}:1"), 1)
    }

    fn with_state(instance: Instance, state: ShardState) -> Instance {
        instance.with_shards(std::iter::once(Shard::new(0).with_state(state)).collect::<Shards>())
    }

    #[test]
    fn test_valid_candidates_keep_leaving_instances() {
        let p = Placement::new().with_instances([
            with_state(instance("i1", "z1"), ShardState::Available),
            with_state(instance("i2", "z1"), ShardState::Leaving),
        ]);
        let got = valid_candidates(
            &p,
            &[instance("i1", "z1"), instance("i2", "z1"), instance("i3", "z1")],
            &Options::default(),
        )
        .unwrap();
        let ids: Vec<&str> = got.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["i2", "i3"]);
    }

    #[test]
    fn test_zone_filtering() {
        let p = Placement::new().with_instances([with_state(instance("i1", "z1"), ShardState::Available)]);
        let candidates = [instance("i2", "z1"), instance("i3", "z2")];

        let got = valid_candidates(&p, &candidates, &Options::default()).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, "i2");

        let got = valid_candidates(&p, &candidates, &Options::default().with_valid_zone("z2")).unwrap();
        assert_eq!(got[0].id, "i3");

        let got =
            valid_candidates(&p, &candidates, &Options::default().with_allow_all_zones(true)).unwrap();
        assert_eq!(got.len(), 2);

        assert!(matches!(
            valid_candidates(&p, &candidates, &Options::default().with_valid_zone("z3")),
            Err(Error::NoValidInstance(_))
        ));
    }

    #[test]
    fn test_new_shard_set_ids_above_max() {
        let p = Placement::new()
            .with_instances([instance("a", "z1").with_shard_set_id(3), instance("b", "z1").with_shard_set_id(3)])
            .with_replica_factor(2)
            .with_max_shard_set_id(5);
        let groups = vec![
            vec![instance("a", "z1"), instance("b", "z1")],
            vec![instance("c", "z1"), instance("d", "z1")],
        ];
        let got = assign_shard_sets_to_grouped_instances(groups, &p);
        let ssids: Vec<u32> = got.iter().map(|i| i.shard_set_id).collect();
        // a and b already share set 3 so keep their candidate value
        assert_eq!(ssids, vec![0, 0, 6, 6]);
    }

    #[test]
    fn test_replacements_follow_leaving_order() {
        let groups = vec![
            ReplacementGroup {
                leaving: instance("l2", "z1").with_shard_set_id(2),
                replacement: instance("n2", "z1"),
            },
            ReplacementGroup {
                leaving: instance("l1", "z1").with_shard_set_id(1),
                replacement: instance("n1", "z1"),
            },
        ];
        let got =
            assign_shard_set_ids_to_replacements(&["l1".to_string(), "l2".to_string()], groups).unwrap();
        assert_eq!(got[0].id, "n1");
        assert_eq!(got[0].shard_set_id, 1);
        assert_eq!(got[1].id, "n2");
        assert_eq!(got[1].shard_set_id, 2);

        assert!(assign_shard_set_ids_to_replacements(&["l1".to_string()], Vec::new()).is_err());
    }

    #[test]
    fn test_default_selector_follows_options() {
        let p = Placement::new().with_replica_factor(1);
        let candidates = [instance("i1", "z1")];
        let selected = instance_selector(&Options::default())
            .select_adding_instances(&candidates, &p)
            .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].shard_set_id, 0);
    }
}
