//! Mirrored placement algorithm
//!
//! Instances sharing a shard set id mirror each other. Operations collapse
//! every shard set into one synthetic instance, run the sharded algorithm
//! at rf 1 over that mirror view and expand the result back onto the real
//! siblings. Source ids in the mirror view name shard sets; on expansion
//! they point at the sibling with the same position in the source set.

use super::helper::{ExistingKind, PlacementHelper};
use super::sharded::ShardedAlgorithm;
use crate::instance::Instance;
use crate::options::Options;
use crate::placement::Placement;
use crate::shard::{Shard, ShardState, Shards};
use std::collections::{BTreeMap, BTreeSet};
use tessera_common::{Error, Result};
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct MirroredAlgorithm {
    opts: Options,
    sharded: ShardedAlgorithm,
}

impl MirroredAlgorithm {
    /// Replacements in a mirrored placement are always full
    #[must_use]
    pub fn new(opts: Options) -> Self {
        let sharded = ShardedAlgorithm::new(opts.clone().with_allow_partial_replace(false));
        Self { opts, sharded }
    }

    pub fn is_compatible_with(&self, p: &Placement) -> Result<()> {
        if !p.is_mirrored || !p.is_sharded {
            return Err(Error::IncompatibleAlgorithm("mirrored"));
        }
        Ok(())
    }

    pub fn initial_placement(
        &self,
        instances: &[Instance],
        shards: &[u32],
        rf: usize,
    ) -> Result<Placement> {
        let mirror_instances = group_instances_by_shard_set_id(instances, rf)?;
        let mirror = self.sharded.initial_placement(&mirror_instances, shards, 1)?;
        placement_from_mirror(&mirror, instances, rf)
    }

    pub fn add_replica(&self, _p: &Placement) -> Result<Placement> {
        Err(Error::unsupported(
            "adding a replica to a mirrored placement",
        ))
    }

    pub fn remove_instances(&self, p: &Placement, ids: &[String]) -> Result<Placement> {
        self.is_compatible_with(p)?;

        // Removing exactly the instances still initializing cancels the add
        if all_initializing(p, ids, self.opts.now()) {
            debug!("Returning initializing shards of {:?} to their sources", ids);
            return self.return_initializing_shards(p.clone(), ids);
        }

        let p = self.settle(p)?;
        let removing = ids
            .iter()
            .map(|id| {
                p.instance(id)
                    .cloned()
                    .ok_or_else(|| Error::InstanceNotFound(id.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut mirror = mirror_from_placement(&p)?;
        for instance in group_instances_by_shard_set_id(&removing, p.replica_factor)? {
            mirror = self.sharded.remove_instances(&mirror, &[instance.id])?;
        }
        let instances: Vec<Instance> = p.instances().cloned().collect();
        placement_from_mirror(&mirror, &instances, p.replica_factor)
    }

    pub fn add_instances(&self, p: &Placement, adding: &[Instance]) -> Result<Placement> {
        self.is_compatible_with(p)?;

        // Adding back exactly the instances still leaving reclaims their shards
        if all_leaving(p, adding, self.opts.now()) {
            debug!("Reclaiming leaving shards for {} instances", adding.len());
            return self.reclaim_leaving_shards(p.clone(), adding);
        }

        let p = self.settle(p)?;
        let adding = valid_adding_instances(&p, adding)?;

        let mut mirror = mirror_from_placement(&p)?;
        for instance in group_instances_by_shard_set_id(&adding, p.replica_factor)? {
            mirror = self
                .sharded
                .add_instances(&mirror, std::slice::from_ref(&instance))?;
        }
        let mut instances: Vec<Instance> = p.instances().cloned().collect();
        instances.extend(adding);
        placement_from_mirror(&mirror, &instances, p.replica_factor)
    }

    pub fn replace_instances(
        &self,
        p: &Placement,
        leaving_ids: &[String],
        adding: &[Instance],
    ) -> Result<Placement> {
        self.is_compatible_with(p)?;
        if leaving_ids.len() != adding.len() {
            return Err(Error::invalid_argument(format!(
                "could not replace {} instances with {} instances for mirrored replace",
                leaving_ids.len(),
                adding.len()
            )));
        }

        let now = self.opts.now();
        if all_leaving(p, adding, now) && all_initializing(p, leaving_ids, now) {
            let p = self.reclaim_leaving_shards(p.clone(), adding)?;
            return self.return_initializing_shards(p, leaving_ids);
        }

        let mut p = self.settle(p)?;
        let adding = valid_adding_instances(&p, adding)?;
        for (id, instance) in leaving_ids.iter().zip(&adding) {
            p = self.sharded.replace_instances(
                &p,
                std::slice::from_ref(id),
                std::slice::from_ref(instance),
            )?;
        }
        Ok(p)
    }

    pub fn mark_shards_available(
        &self,
        p: &Placement,
        instance_id: &str,
        shard_ids: &[u32],
    ) -> Result<Placement> {
        self.is_compatible_with(p)?;
        self.sharded.mark_shards_available(p, instance_id, shard_ids)
    }

    pub fn mark_all_shards_available(&self, p: &Placement) -> Result<(Placement, bool)> {
        self.is_compatible_with(p)?;
        self.sharded.mark_all_shards_available(p)
    }

    /// Finish pending handoffs before reshaping the mirror view
    fn settle(&self, p: &Placement) -> Result<Placement> {
        if !self.opts.settle_before_mirrored_update {
            return Ok(p.clone());
        }
        let (p, updated) = self.mark_all_shards_available(p)?;
        if updated {
            info!("Marked pending shards available before updating mirrored placement");
        }
        Ok(p)
    }

    /// Hand initializing shards back to their sources until no more move
    fn return_initializing_shards(&self, mut p: Placement, ids: &[String]) -> Result<Placement> {
        loop {
            let mut progress = false;
            for id in ids {
                if p.instance(id).is_none() {
                    continue;
                }
                let mut helper = PlacementHelper::for_remove_instance(&p, id, &self.opts)?;
                let before = num_detached_in_state(&helper, id, ShardState::Initializing);
                helper.return_initializing_shards(id);
                if num_detached_in_state(&helper, id, ShardState::Initializing) < before {
                    progress = true;
                }

                let remaining = helper.detached(id).cloned();
                p = helper.generate_placement();
                if let Some(instance) = remaining
                    && !instance.shards.is_empty()
                {
                    p.instances.insert(instance.id.clone(), instance);
                }
            }
            if !progress {
                break;
            }
        }

        for id in ids {
            if let Some(instance) = p.instance(id) {
                let n = instance.shards.num_shards_for_state(ShardState::Initializing);
                if n != 0 {
                    return Err(Error::invalid_instance_state(
                        id,
                        format!("there are {n} initializing shards could not be returned"),
                    ));
                }
            }
        }
        Ok(p)
    }

    /// Pull leaving shards back onto the adding instances until no more move
    fn reclaim_leaving_shards(&self, mut p: Placement, adding: &[Instance]) -> Result<Placement> {
        loop {
            let mut progress = false;
            for instance in adding {
                let mut helper = PlacementHelper::for_add_instance(
                    &p,
                    instance,
                    &self.opts,
                    ExistingKind::WithAvailableOrLeavingShardsOnly,
                )?;
                let before = num_in_state(&helper, &instance.id, ShardState::Leaving);
                helper.reclaim_leaving_shards(&instance.id);
                if num_in_state(&helper, &instance.id, ShardState::Leaving) < before {
                    progress = true;
                }
                p = helper.generate_placement();
            }
            if !progress {
                break;
            }
        }

        for instance in adding {
            let existing = p
                .instance(&instance.id)
                .ok_or_else(|| Error::InstanceNotFound(instance.id.clone()))?;
            let n = existing.shards.num_shards_for_state(ShardState::Leaving);
            if n != 0 {
                return Err(Error::invalid_instance_state(
                    &instance.id,
                    format!("there are {n} leaving shards could not be reclaimed"),
                ));
            }
        }
        Ok(p)
    }
}

fn num_in_state(helper: &PlacementHelper, id: &str, state: ShardState) -> usize {
    helper
        .instance(id)
        .map_or(0, |i| i.shards.num_shards_for_state(state))
}

fn num_detached_in_state(helper: &PlacementHelper, id: &str, state: ShardState) -> usize {
    helper
        .detached(id)
        .map_or(0, |i| i.shards.num_shards_for_state(state))
}

/// The given ids are exactly the instances whose shards are all
/// initializing and not cut over yet.
fn all_initializing(p: &Placement, ids: &[String], now_nanos: i64) -> bool {
    all_instances_in_state(ids.iter().map(String::as_str), p, |s| {
        s.state() == ShardState::Initializing && s.cutover_nanos() > now_nanos
    })
}

/// The given instances are exactly the instances whose shards are all
/// leaving and not cut off yet.
fn all_leaving(p: &Placement, instances: &[Instance], now_nanos: i64) -> bool {
    all_instances_in_state(instances.iter().map(|i| i.id.as_str()), p, |s| {
        s.state() == ShardState::Leaving && s.cutoff_nanos() > now_nanos
    })
}

fn all_instances_in_state<'a>(
    ids: impl Iterator<Item = &'a str>,
    p: &Placement,
    check: impl Fn(&Shard) -> bool,
) -> bool {
    let mut ids: BTreeSet<&str> = ids.collect();
    for instance in p.instances() {
        if !instance.shards.iter().all(&check) {
            continue;
        }
        if !ids.remove(instance.id.as_str()) {
            return false;
        }
    }
    ids.is_empty()
}

/// Adding instances must be new. Leaving instances were dropped by the
/// settle step and come back empty.
fn valid_adding_instances(p: &Placement, adding: &[Instance]) -> Result<Vec<Instance>> {
    adding
        .iter()
        .map(|instance| {
            if p.instance(&instance.id).is_some() {
                return Err(Error::InstanceAlreadyExists(instance.id.clone()));
            }
            let mut instance = instance.clone();
            if instance.is_leaving() {
                instance.shards = Shards::new();
            }
            Ok(instance)
        })
        .collect()
}

/// Shards match apart from their source ids
fn same_shards(a: &Shards, b: &Shards) -> bool {
    a.len() == b.len()
        && a.iter().zip(b.iter()).all(|(x, y)| {
            x.id() == y.id()
                && x.state() == y.state()
                && x.cutover_nanos() == y.cutover_nanos()
                && x.cutoff_nanos() == y.cutoff_nanos()
        })
}

struct ShardSet {
    weight: u32,
    count: usize,
    groups: BTreeSet<String>,
    shards: Shards,
}

/// Collapse each shard set into one mirror instance whose id and isolation
/// group are the shard set id.
pub(crate) fn group_instances_by_shard_set_id(
    instances: &[Instance],
    rf: usize,
) -> Result<Vec<Instance>> {
    let mut sets: BTreeMap<u32, ShardSet> = BTreeMap::new();
    for instance in instances {
        let ssid = instance.shard_set_id;
        let set = sets.entry(ssid).or_insert_with(|| ShardSet {
            weight: instance.weight,
            count: 0,
            groups: BTreeSet::new(),
            shards: instance.shards.clone(),
        });
        if set.groups.contains(&instance.isolation_group) {
            return Err(Error::invalid_placement(format!(
                "found duplicated isolation group {} for shard set id {ssid}",
                instance.isolation_group
            )));
        }
        if set.weight != instance.weight {
            return Err(Error::invalid_placement(format!(
                "found different weights: {} and {}, for shard set id {ssid}",
                set.weight, instance.weight
            )));
        }
        if !same_shards(&set.shards, &instance.shards) {
            return Err(Error::invalid_placement(format!(
                "found different shards: {} and {}, for shard set id {ssid}",
                set.shards, instance.shards
            )));
        }
        set.groups.insert(instance.isolation_group.clone());
        set.count += 1;
    }

    let mut mirrors = Vec::with_capacity(sets.len());
    for (ssid, set) in sets {
        if set.count != rf {
            return Err(Error::invalid_placement(format!(
                "found {} count of shard set id {ssid}, expecting {rf}",
                set.count
            )));
        }
        let id = ssid.to_string();
        mirrors.push(
            Instance::new(id.clone())
                .with_isolation_group(id)
                .with_weight(set.weight)
                .with_shard_set_id(ssid)
                .with_shards(set.shards),
        );
    }
    Ok(mirrors)
}

/// The rf 1 view of a mirrored placement. Source ids are rewritten from
/// instance ids to shard set ids.
pub(crate) fn mirror_from_placement(p: &Placement) -> Result<Placement> {
    let instances: Vec<Instance> = p.instances().cloned().collect();
    let mut mirrors = group_instances_by_shard_set_id(&instances, p.replica_factor)?;
    for mirror in &mut mirrors {
        for shard in mirror.shards.iter_mut() {
            if shard.source_id().is_empty() {
                continue;
            }
            let source = p
                .instance(shard.source_id())
                .ok_or_else(|| Error::InstanceNotFound(shard.source_id().to_string()))?;
            shard.set_source_id(source.shard_set_id.to_string());
        }
    }

    Ok(Placement::new()
        .with_instances(mirrors)
        .with_replica_factor(1)
        .with_shards(p.shards.clone())
        .with_cutover_nanos(p.cutover_nanos)
        .with_is_sharded(true)
        .with_is_mirrored(true)
        .with_max_shard_set_id(p.max_shard_set_id))
}

/// Copy the shards of every mirror instance onto the real instances of its
/// shard set.
pub(crate) fn placement_from_mirror(
    mirror: &Placement,
    instances: &[Instance],
    rf: usize,
) -> Result<Placement> {
    let mut by_shard_set: BTreeMap<u32, Vec<&Instance>> = BTreeMap::new();
    for instance in instances {
        by_shard_set
            .entry(instance.shard_set_id)
            .or_default()
            .push(instance);
    }
    for siblings in by_shard_set.values_mut() {
        siblings.sort_by(|a, b| {
            (a.isolation_group.as_str(), a.id.as_str())
                .cmp(&(b.isolation_group.as_str(), b.id.as_str()))
        });
    }

    let mut expanded = Vec::with_capacity(instances.len());
    for mirror_instance in mirror.instances() {
        let ssid = mirror_instance.shard_set_id;
        let siblings = by_shard_set.get(&ssid).ok_or_else(|| {
            Error::invalid_placement(format!("could not find shard set id {ssid} in placement"))
        })?;

        for (i, sibling) in siblings.iter().enumerate() {
            let mut shards = Shards::new();
            for s in mirror_instance.shards.iter() {
                let mut shard = Shard::new(s.id())
                    .with_state(s.state())
                    .with_cutover_nanos(s.cutover_nanos())
                    .with_cutoff_nanos(s.cutoff_nanos());
                if !s.source_id().is_empty() {
                    let source_ssid: u32 = s.source_id().parse().map_err(|_| {
                        Error::invalid_placement(format!(
                            "could not convert source id {} to shard set id",
                            s.source_id()
                        ))
                    })?;
                    let source = by_shard_set
                        .get(&source_ssid)
                        .and_then(|set| set.get(i))
                        .ok_or_else(|| {
                            Error::invalid_placement(format!(
                                "could not find source id {} in placement",
                                s.source_id()
                            ))
                        })?;
                    shard.set_source_id(source.id.as_str());
                }
                shards.add(shard);
            }
            expanded.push((*sibling).clone().with_shards(shards));
        }
    }

    Ok(Placement::new()
        .with_instances(expanded)
        .with_replica_factor(rf)
        .with_shards(mirror.shards.clone())
        .with_cutover_nanos(mirror.cutover_nanos)
        .with_is_mirrored(true)
        .with_is_sharded(true)
        .with_max_shard_set_id(mirror.max_shard_set_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::validate;

    fn instance(id: &str, group: &str, ssid: u32) -> Instance {
        Instance::new_empty(id, group, "z1", format!("{id}:9000"), 1).with_shard_set_id(ssid)
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    /// Instances `<set><group>` such as `a1`, `a2` for shard set 1
    fn shard_set(name: char, ssid: u32, rf: usize) -> Vec<Instance> {
        (1..=rf)
            .map(|g| instance(&format!("{name}{g}"), &format!("r{g}"), ssid))
            .collect()
    }

    fn opts() -> Options {
        Options::default().with_is_mirrored(true)
    }

    fn assert_mirrored(p: &Placement) {
        validate(p).unwrap();
        let mut by_set: BTreeMap<u32, Vec<&Instance>> = BTreeMap::new();
        for instance in p.instances() {
            by_set.entry(instance.shard_set_id).or_default().push(instance);
        }
        for siblings in by_set.values() {
            assert_eq!(siblings.len(), p.replica_factor);
            let groups: BTreeSet<&str> =
                siblings.iter().map(|i| i.isolation_group.as_str()).collect();
            assert_eq!(groups.len(), siblings.len());
            for sibling in siblings {
                assert!(sibling.shards.same_ids(&siblings[0].shards));
                assert_eq!(sibling.weight, siblings[0].weight);
            }
        }
    }

    fn nine_instances() -> Vec<Instance> {
        let mut instances = shard_set('a', 1, 3);
        instances.extend(shard_set('b', 2, 3));
        instances.extend(shard_set('c', 3, 3));
        instances
    }

    #[test]
    fn test_initial_mirrored_placement() {
        let algo = MirroredAlgorithm::new(opts());
        let p = algo
            .initial_placement(&nine_instances(), &(0..6).collect::<Vec<_>>(), 3)
            .unwrap();
        assert_mirrored(&p);
        assert!(p.is_mirrored);
        assert_eq!(p.num_instances(), 9);
        assert_eq!(p.max_shard_set_id, 3);
        for id in ["a1", "b1", "c1"] {
            assert_eq!(p.instance(id).unwrap().shards.len(), 2);
        }
    }

    #[test]
    fn test_group_validation() {
        let mut instances = shard_set('a', 1, 2);
        assert!(group_instances_by_shard_set_id(&instances, 3).is_err());

        instances[1].isolation_group = "r1".into();
        let err = group_instances_by_shard_set_id(&instances, 2).unwrap_err();
        assert!(err.to_string().contains("duplicated isolation group"));

        let mut instances = shard_set('a', 1, 2);
        instances[1].weight = 2;
        let err = group_instances_by_shard_set_id(&instances, 2).unwrap_err();
        assert!(err.to_string().contains("different weights"));

        let mirrors = group_instances_by_shard_set_id(&shard_set('a', 7, 2), 2).unwrap();
        assert_eq!(mirrors.len(), 1);
        assert_eq!(mirrors[0].id, "7");
        assert_eq!(mirrors[0].isolation_group, "7");
    }

    #[test]
    fn test_add_and_remove_shard_set() {
        let algo = MirroredAlgorithm::new(opts());
        let mut instances = shard_set('a', 1, 2);
        instances.extend(shard_set('b', 2, 2));
        let p = algo.initial_placement(&instances, &(0..8).collect::<Vec<_>>(), 2).unwrap();
        let (p, _) = algo.mark_all_shards_available(&p).unwrap();

        let p = algo.add_instances(&p, &shard_set('c', 3, 2)).unwrap();
        assert_mirrored(&p);
        // The new set mirrors sources sibling by sibling
        for shard in p.instance("c1").unwrap().shards.iter() {
            assert_eq!(shard.state(), ShardState::Initializing);
            assert!(["a1", "b1"].contains(&shard.source_id()));
        }
        let (p, _) = algo.mark_all_shards_available(&p).unwrap();
        assert_mirrored(&p);

        let p = algo.remove_instances(&p, &ids(&["c1", "c2"])).unwrap();
        assert_mirrored(&p);
        assert!(p.instance("c2").unwrap().is_leaving());
        let (p, _) = algo.mark_all_shards_available(&p).unwrap();
        assert_mirrored(&p);
        assert!(p.instance("c1").is_none());
    }

    #[test]
    fn test_re_adding_leaving_instances_reclaims_shards() {
        let algo = MirroredAlgorithm::new(opts());
        let mut instances = shard_set('a', 1, 2);
        instances.extend(shard_set('b', 2, 2));
        instances.extend(shard_set('c', 3, 2));
        let p = algo.initial_placement(&instances, &(0..6).collect::<Vec<_>>(), 2).unwrap();
        let (p, _) = algo.mark_all_shards_available(&p).unwrap();

        let removed = algo.remove_instances(&p, &ids(&["c1", "c2"])).unwrap();
        let p2 = algo.add_instances(&removed, &shard_set('c', 3, 2)).unwrap();
        assert_mirrored(&p2);
        assert_eq!(
            p2.instance("c1").unwrap().shards,
            p.instance("c1").unwrap().shards
        );
        assert_eq!(p2.instance("a1").unwrap().shards, p.instance("a1").unwrap().shards);
    }

    #[test]
    fn test_removing_initializing_instances_returns_shards() {
        let opts = opts()
            .with_now_fn(|| 100)
            .with_shard_cutover_nanos_fn(|| 1_000);
        let algo = MirroredAlgorithm::new(opts);
        let mut instances = shard_set('a', 1, 2);
        instances.extend(shard_set('b', 2, 2));
        let p = algo.initial_placement(&instances, &(0..4).collect::<Vec<_>>(), 2).unwrap();
        let (p, _) = algo.mark_all_shards_available(&p).unwrap();

        let added = algo.add_instances(&p, &shard_set('c', 3, 2)).unwrap();
        let p2 = algo.remove_instances(&added, &ids(&["c1", "c2"])).unwrap();
        assert_mirrored(&p2);
        assert!(p2.instance("c1").is_none());
        for id in ["a1", "a2", "b1", "b2"] {
            assert_eq!(p2.instance(id).unwrap().shards, p.instance(id).unwrap().shards);
        }
    }

    #[test]
    fn test_replace_shard_set_member() {
        let algo = MirroredAlgorithm::new(opts());
        let mut instances = shard_set('a', 1, 2);
        instances.extend(shard_set('b', 2, 2));
        let p = algo.initial_placement(&instances, &(0..4).collect::<Vec<_>>(), 2).unwrap();
        let (p, _) = algo.mark_all_shards_available(&p).unwrap();

        assert!(
            algo.replace_instances(&p, &ids(&["a1"]), &[])
                .is_err()
        );

        let p = algo
            .replace_instances(&p, &ids(&["a1"]), &[instance("d1", "r1", 1)])
            .unwrap();
        validate(&p).unwrap();
        let (p, _) = algo.mark_all_shards_available(&p).unwrap();
        assert_mirrored(&p);
        assert!(p.instance("a1").is_none());
    }

    #[test]
    fn test_unsupported_and_incompatible() {
        let algo = MirroredAlgorithm::new(opts());
        assert!(matches!(
            algo.add_replica(&Placement::new()),
            Err(Error::Unsupported(_))
        ));
        let p = Placement::new().with_is_sharded(true);
        assert!(matches!(
            algo.remove_instances(&p, &[]),
            Err(Error::IncompatibleAlgorithm("mirrored"))
        ));
    }
}
