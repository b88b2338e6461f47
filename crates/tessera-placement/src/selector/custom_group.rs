//! Mirrored selector driven by caller-supplied group ids
//!
//! Instances reporting the same group id become one shard set and receive
//! the same mirrored traffic.

use super::{
    InstanceSelector, ReplacementGroup, assign_shard_set_ids_to_replacements,
    assign_shard_sets_to_grouped_instances, leaving_instances, valid_candidates,
};
use crate::instance::Instance;
use crate::options::Options;
use crate::placement::Placement;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tessera_common::{Error, Result};
use tracing::warn;

/// Maps an instance to its mirror group
pub type GroupIdFn = Arc<dyn Fn(&Instance) -> Result<String> + Send + Sync>;

/// Look the group up by instance id
#[must_use]
pub fn map_group_id_fn(instance_to_group: HashMap<String, String>) -> GroupIdFn {
    Arc::new(move |instance: &Instance| {
        instance_to_group.get(&instance.id).cloned().ok_or_else(|| {
            Error::invalid_argument(format!(
                "instance {} doesn't have a corresponding group in ID to group map",
                instance.id
            ))
        })
    })
}

/// Assigns shard sets by group id
#[derive(Clone)]
pub struct CustomGroupMirroredSelector {
    group_id_fn: GroupIdFn,
    opts: Options,
}

impl fmt::Debug for CustomGroupMirroredSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomGroupMirroredSelector")
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

impl CustomGroupMirroredSelector {
    #[must_use]
    pub fn new(group_id_fn: GroupIdFn, opts: Options) -> Self {
        Self { group_id_fn, opts }
    }

    fn group_id(&self, instance: &Instance) -> Result<String> {
        (self.group_id_fn)(instance).map_err(|e| {
            Error::invalid_argument(format!("finding group for {}: {e}", instance.id))
        })
    }

    fn group_by_id(&self, candidates: Vec<Instance>) -> Result<BTreeMap<String, Vec<Instance>>> {
        let mut groups: BTreeMap<String, Vec<Instance>> = BTreeMap::new();
        for candidate in candidates {
            groups
                .entry(self.group_id(&candidate)?)
                .or_default()
                .push(candidate);
        }
        Ok(groups)
    }

    /// Groups capped at `rf` members
    fn group_with_rf(&self, candidates: Vec<Instance>, rf: usize) -> Result<Vec<Vec<Instance>>> {
        let mut groups = Vec::new();
        for (group_id, mut group) in self.group_by_id(candidates)? {
            if group.len() > rf {
                let dropped: Vec<String> = group.split_off(rf).into_iter().map(|i| i.id).collect();
                warn!(
                    "found more hosts than rf in group {group_id}, dropping {}",
                    dropped.join(",")
                );
            }
            groups.push(group);
        }
        Ok(groups)
    }

    fn select(
        &self,
        candidates: &[Instance],
        p: &Placement,
        add_all: bool,
    ) -> Result<Vec<Instance>> {
        let candidates = valid_candidates(p, candidates, &self.opts)?;
        let mut groups = self.group_with_rf(candidates, p.replica_factor)?;
        if !add_all {
            groups.truncate(1);
        }
        Ok(assign_shard_sets_to_grouped_instances(groups, p))
    }
}

impl InstanceSelector for CustomGroupMirroredSelector {
    fn select_initial_instances(
        &self,
        candidates: &[Instance],
        rf: usize,
    ) -> Result<Vec<Instance>> {
        self.select(candidates, &Placement::new().with_replica_factor(rf), true)
    }

    fn select_adding_instances(
        &self,
        candidates: &[Instance],
        p: &Placement,
    ) -> Result<Vec<Instance>> {
        self.select(candidates, p, self.opts.add_all_candidates)
    }

    /// One replacement per leaving instance, taken from the leaving
    /// instance's own group
    fn select_replace_instances(
        &self,
        candidates: &[Instance],
        leaving_ids: &[String],
        p: &Placement,
    ) -> Result<Vec<Instance>> {
        let candidates = valid_candidates(p, candidates, &self.opts)?;
        let mut by_group = self.group_by_id(candidates)?;
        let leaving = leaving_instances(p, leaving_ids)?;

        let mut replacements = Vec::with_capacity(leaving.len());
        for instance in leaving {
            let group_id = self.group_id(&instance)?;
            let replacement = by_group
                .get_mut(&group_id)
                .and_then(Vec::pop)
                .ok_or_else(|| {
                    Error::no_valid_instance(format!(
                        "leaving instance {} has no valid replacements in the same group ({group_id})",
                        instance.id
                    ))
                })?;
            replacements.push(ReplacementGroup {
                leaving: instance,
                replacement,
            });
        }
        assign_shard_set_ids_to_replacements(leaving_ids, replacements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::MirroredAlgorithm;

    fn instance(id: &str, group: &str) -> Instance {
        Instance::new_empty(id, group, "z1", format!("{id}:1"), 1)
    }

    fn selector(opts: Options) -> CustomGroupMirroredSelector {
        let groups = [
            ("a1", "A"),
            ("a2", "A"),
            ("a3", "A"),
            ("b1", "B"),
            ("b2", "B"),
            ("c1", "C"),
            ("c2", "C"),
        ]
        .iter()
        .map(|(id, group)| (id.to_string(), group.to_string()))
        .collect();
        CustomGroupMirroredSelector::new(map_group_id_fn(groups), opts)
    }

    fn candidates() -> Vec<Instance> {
        vec![
            instance("a1", "r1"),
            instance("a2", "r2"),
            instance("b1", "r1"),
            instance("b2", "r2"),
        ]
    }

    #[test]
    fn test_initial_groups_by_id() {
        let selected = selector(Options::default().with_is_mirrored(true))
            .select_initial_instances(&candidates(), 2)
            .unwrap();
        let ssid = |id: &str| selected.iter().find(|i| i.id == id).unwrap().shard_set_id;
        assert_eq!(ssid("a1"), 1);
        assert_eq!(ssid("a2"), 1);
        assert_eq!(ssid("b1"), 2);
        assert_eq!(ssid("b2"), 2);
    }

    #[test]
    fn test_extra_group_members_are_dropped() {
        let mut candidates = candidates();
        candidates.push(instance("a3", "r3"));
        let selected = selector(Options::default().with_is_mirrored(true))
            .select_initial_instances(&candidates, 2)
            .unwrap();
        assert_eq!(selected.len(), 4);
        assert!(selected.iter().all(|i| i.id != "a3"));
    }

    #[test]
    fn test_unknown_instance_fails() {
        let mut candidates = candidates();
        candidates.push(instance("x1", "r1"));
        assert!(matches!(
            selector(Options::default().with_is_mirrored(true)).select_initial_instances(&candidates, 2),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_adding_and_replacing() {
        let opts = Options::default().with_is_mirrored(true);
        let selector = selector(opts.clone());
        let initial = selector.select_initial_instances(&candidates(), 2).unwrap();
        let shards: Vec<u32> = (0..4).collect();
        let p = MirroredAlgorithm::new(opts)
            .initial_placement(&initial, &shards, 2)
            .unwrap();

        let adding = selector
            .select_adding_instances(&[instance("c1", "r1"), instance("c2", "r2")], &p)
            .unwrap();
        assert_eq!(adding.len(), 2);
        assert!(adding.iter().all(|i| i.shard_set_id == 3));

        let replaced = selector
            .select_replace_instances(&[instance("a3", "r1")], &["a1".to_string()], &p)
            .unwrap();
        assert_eq!(replaced[0].id, "a3");
        assert_eq!(replaced[0].shard_set_id, 1);

        assert!(matches!(
            selector.select_replace_instances(&[instance("c1", "r1")], &["a1".to_string()], &p),
            Err(Error::NoValidInstance(_))
        ));
    }
}
