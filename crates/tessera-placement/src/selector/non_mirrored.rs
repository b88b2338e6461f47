//! Selector for placements without shard sets

use super::{InstanceSelector, leaving_instances, valid_candidates};
use crate::algo::PlacementHelper;
use crate::instance::Instance;
use crate::options::Options;
use crate::placement::Placement;
use std::collections::BTreeMap;
use tessera_common::{Error, Result};

/// Picks instances by isolation group, existing shard placement and weight
#[derive(Clone, Debug)]
pub struct NonMirroredSelector {
    opts: Options,
}

impl NonMirroredSelector {
    #[must_use]
    pub const fn new(opts: Options) -> Self {
        Self { opts }
    }

    /// Enough candidates to cover the weight of the leaving instances,
    /// preferring groups whose shards would not collide with other replicas
    fn select_replace(
        &self,
        candidates: Vec<Instance>,
        leaving: &[Instance],
        p: &Placement,
    ) -> Result<Vec<Instance>> {
        let helper = PlacementHelper::new(p, &self.opts);
        let mut ranked = Vec::with_capacity(candidates.len());
        for (group, instances) in group_by_isolation_group(candidates) {
            let conflicts = leaving
                .iter()
                .flat_map(|l| l.shards.iter().map(move |s| (l, s.id())))
                .filter(|(l, shard)| {
                    !helper.can_move_shard(*shard, Some(l.isolation_group.as_str()), &group)
                })
                .count();
            ranked.extend(instances.into_iter().map(|i| (conflicts, i)));
        }

        let groups = group_by_conflicts(ranked, self.opts.allow_partial_replace);
        if groups.is_empty() {
            return Err(Error::no_valid_instance(
                "no valid instance in the candidate list",
            ));
        }

        let leaving_weight: u64 = leaving.iter().map(|i| u64::from(i.weight)).sum();
        let (selected, left) = fill_weight(groups, leaving_weight);
        if left > 0 && !self.opts.allow_partial_replace {
            return Err(Error::no_valid_instance(format!(
                "could not find enough instances to replace {}, {left} weight could not be replaced",
                ids(leaving)
            )));
        }
        Ok(selected)
    }

    fn check_replace_weight(&self, candidates: &[Instance], leaving: &[Instance]) -> Result<()> {
        let leaving_weight: u64 = leaving.iter().map(|i| u64::from(i.weight)).sum();
        let candidate_weight: u64 = candidates.iter().map(|i| u64::from(i.weight)).sum();
        if leaving_weight > candidate_weight && !self.opts.allow_partial_replace {
            return Err(Error::no_valid_instance(format!(
                "could not find enough instances to replace {}, {leaving_weight} weight could not be replaced",
                ids(leaving)
            )));
        }
        Ok(())
    }
}

impl InstanceSelector for NonMirroredSelector {
    fn select_initial_instances(
        &self,
        candidates: &[Instance],
        _rf: usize,
    ) -> Result<Vec<Instance>> {
        valid_candidates(&Placement::new(), candidates, &self.opts)
    }

    fn select_adding_instances(
        &self,
        candidates: &[Instance],
        p: &Placement,
    ) -> Result<Vec<Instance>> {
        let candidates = valid_candidates(p, candidates, &self.opts)?;
        if self.opts.add_all_candidates {
            return Ok(candidates);
        }
        Ok(vec![select_single_candidate(candidates, p)?])
    }

    fn select_replace_instances(
        &self,
        candidates: &[Instance],
        leaving_ids: &[String],
        p: &Placement,
    ) -> Result<Vec<Instance>> {
        let candidates = valid_candidates(p, candidates, &self.opts)?;
        let leaving = leaving_instances(p, leaving_ids)?;
        if self.opts.add_all_candidates {
            self.check_replace_weight(&candidates, &leaving)?;
            return Ok(candidates);
        }
        self.select_replace(candidates, &leaving, p)
    }
}

fn ids(instances: &[Instance]) -> String {
    instances
        .iter()
        .map(|i| i.id.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn group_by_isolation_group(
    instances: impl IntoIterator<Item = Instance>,
) -> BTreeMap<String, Vec<Instance>> {
    let mut groups: BTreeMap<String, Vec<Instance>> = BTreeMap::new();
    for instance in instances {
        groups
            .entry(instance.isolation_group.clone())
            .or_default()
            .push(instance);
    }
    groups
}

/// Bucket candidates by ascending conflict count. Conflicting candidates
/// are only kept when partial replacement is allowed.
fn group_by_conflicts(mut ranked: Vec<(usize, Instance)>, allow_conflict: bool) -> Vec<Vec<Instance>> {
    ranked.sort_by_key(|(conflicts, _)| *conflicts);
    let mut groups: Vec<Vec<Instance>> = Vec::new();
    let mut last_seen = None;
    for (conflicts, instance) in ranked {
        if !allow_conflict && conflicts > 0 {
            break;
        }
        if last_seen != Some(conflicts) {
            last_seen = Some(conflicts);
            groups.push(Vec::new());
        }
        if let Some(group) = groups.last_mut() {
            group.push(instance);
        }
    }
    groups
}

/// Take instances group by group until the target weight is covered.
/// Returns the selection and the weight still missing.
fn fill_weight(groups: Vec<Vec<Instance>>, target: u64) -> (Vec<Instance>, u64) {
    let mut selected = Vec::new();
    let mut left = target;
    for mut group in groups {
        if left == 0 {
            break;
        }
        group.sort_by(|a, b| a.id.cmp(&b.id));
        let (picked, remaining) = knapsack(group, left);
        selected.extend(picked);
        left = remaining;
    }
    (selected, left)
}

/// Smallest weight at or above `target` reachable by a subset of
/// `instances`, preferring fewer instances among equal weights.
///
/// Returns the subset and the weight still missing, which is only nonzero
/// when the whole group falls short.
fn knapsack(instances: Vec<Instance>, target: u64) -> (Vec<Instance>, u64) {
    let total: u64 = instances.iter().map(|i| u64::from(i.weight)).sum();
    if total <= target {
        return (instances, target - total);
    }

    let (Ok(total), Ok(target)) = (usize::try_from(total), usize::try_from(target)) else {
        return (instances, 0);
    };
    let mut best = vec![0usize; total + 1];
    let mut combination: Vec<Vec<usize>> = vec![Vec::new(); total + 1];
    for (idx, instance) in instances.iter().enumerate() {
        let weight = instance.weight as usize;
        for j in (1..=total).rev() {
            if j < weight {
                continue;
            }
            let candidate = best[j - weight] + weight;
            let fewer = combination[j - weight].len() + 1 < combination[j].len();
            if candidate > best[j] || (candidate == best[j] && fewer) {
                best[j] = candidate;
                let mut picked = combination[j - weight].clone();
                picked.push(idx);
                combination[j] = picked;
            }
        }
    }

    let Some(reached) = (target..=total).find(|&w| best[w] >= target) else {
        return (instances, 0);
    };
    let picked = std::mem::take(&mut combination[reached]);
    let mut instances: Vec<Option<Instance>> = instances.into_iter().map(Some).collect();
    let selected = picked
        .into_iter()
        .filter_map(|idx| instances[idx].take())
        .collect();
    (selected, 0)
}

/// One candidate, preferring an isolation group the placement does not
/// use yet, then the lightest existing group
fn select_single_candidate(candidates: Vec<Instance>, p: &Placement) -> Result<Instance> {
    let mut candidate_groups = group_by_isolation_group(candidates);
    let existing_groups = group_by_isolation_group(p.instances().cloned());

    let fresh = candidate_groups
        .keys()
        .find(|group| !existing_groups.contains_key(*group))
        .cloned();
    if let Some(instance) = fresh.and_then(|g| candidate_groups.remove(&g)).and_then(|g| g.into_iter().next()) {
        return Ok(instance);
    }

    let mut by_weight: Vec<(u64, &String)> = existing_groups
        .iter()
        .map(|(group, instances)| (instances.iter().map(|i| u64::from(i.weight)).sum(), group))
        .collect();
    by_weight.sort_by_key(|(weight, _)| *weight);
    by_weight
        .into_iter()
        .find_map(|(_, group)| candidate_groups.get_mut(group).and_then(|g| g.drain(..).next()))
        .ok_or_else(|| Error::no_valid_instance("no valid instance in the candidate list"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::ShardedAlgorithm;

    fn instance(id: &str, group: &str, weight: u32) -> Instance {
        Instance::new_empty(id, group, "z1", format!("{id}:9000"), weight)
    }

    fn placement() -> Placement {
        let shards: Vec<u32> = (0..6).collect();
        ShardedAlgorithm::new(Options::default())
            .initial_placement(&[instance("i1", "r1", 3), instance("i2", "r2", 3)], &shards, 2)
            .unwrap()
    }

    #[test]
    fn test_add_prefers_new_isolation_group() {
        let selector = NonMirroredSelector::new(Options::default());
        let got = selector
            .select_adding_instances(&[instance("a", "r1", 1), instance("b", "r3", 1)], &placement())
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, "b");
    }

    #[test]
    fn test_add_prefers_lightest_group() {
        let p = placement();
        let mut heavier = p.clone();
        heavier.instances.insert("i3".to_string(), instance("i3", "r1", 5));

        let selector = NonMirroredSelector::new(Options::default());
        let candidates = [instance("a", "r1", 1), instance("b", "r2", 1)];
        let got = selector.select_adding_instances(&candidates, &heavier).unwrap();
        assert_eq!(got[0].id, "b");
    }

    #[test]
    fn test_add_all_candidates() {
        let selector = NonMirroredSelector::new(Options::default().with_add_all_candidates(true));
        let candidates = [instance("a", "r1", 1), instance("b", "r3", 1), instance("i1", "r1", 1)];
        let got = selector.select_adding_instances(&candidates, &placement()).unwrap();
        let ids: Vec<&str> = got.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_replace_prefers_fewest_instances_without_conflict() {
        let selector = NonMirroredSelector::new(Options::default());
        let candidates = [
            instance("c1", "r1", 1),
            instance("c2", "r1", 2),
            instance("c3", "r1", 3),
            instance("d1", "r2", 3),
        ];
        let got = selector
            .select_replace_instances(&candidates, &["i1".to_string()], &placement())
            .unwrap();
        let ids: Vec<&str> = got.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["c3"]);
    }

    #[test]
    fn test_replace_without_partial_rejects_conflicts() {
        let selector =
            NonMirroredSelector::new(Options::default().with_allow_partial_replace(false));
        assert!(matches!(
            selector.select_replace_instances(
                &[instance("d1", "r2", 3)],
                &["i1".to_string()],
                &placement()
            ),
            Err(Error::NoValidInstance(_))
        ));

        assert!(matches!(
            selector.select_replace_instances(
                &[instance("c1", "r1", 1)],
                &["i1".to_string()],
                &placement()
            ),
            Err(Error::NoValidInstance(_))
        ));

        let selector = NonMirroredSelector::new(Options::default());
        let got = selector
            .select_replace_instances(&[instance("c1", "r1", 1)], &["i1".to_string()], &placement())
            .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn test_replace_unknown_instance() {
        let selector = NonMirroredSelector::new(Options::default());
        assert!(matches!(
            selector.select_replace_instances(&[instance("c1", "r1", 1)], &["nope".to_string()], &placement()),
            Err(Error::InstanceNotFound(_))
        ));
    }

    #[test]
    fn test_knapsack() {
        let group = vec![instance("a", "r", 2), instance("b", "r", 2), instance("c", "r", 4)];
        let (picked, left) = knapsack(group.clone(), 4);
        assert_eq!(left, 0);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, "c");

        let (picked, left) = knapsack(group.clone(), 3);
        assert_eq!(left, 0);
        assert_eq!(picked.iter().map(|i| i.weight).sum::<u32>(), 4);

        let (picked, left) = knapsack(group, 10);
        assert_eq!(left, 2);
        assert_eq!(picked.len(), 3);
    }
}
