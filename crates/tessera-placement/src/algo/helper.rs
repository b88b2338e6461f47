//! Shard placement scratchpad
//!
//! The helper copies the instances of a placement, indexes which instances
//! hold which shards and which isolation groups they belong to, computes a
//! target load per instance and then moves shards one by one while keeping
//! replicas of a shard in distinct isolation groups. Once done it emits a
//! fresh [`Placement`]; the input placement is never touched.
//!
//! Instances removed from the placement during an operation are kept aside
//! as detached instances: they still source shards (their shards turn
//! `Leaving` as they move away) but they take no load.

use super::heap::InstanceHeap;
use crate::instance::Instance;
use crate::options::Options;
use crate::placement::Placement;
use crate::shard::{Shard, ShardState};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tessera_common::{Error, Result, ShardStateMode};
use tracing::{debug, warn};

/// How an instance may be brought into a placement
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AddKind {
    /// The instance must not be in the placement
    Any,
    /// As [`AddKind::Any`], but an instance without shards is skipped
    WithShards,
}

/// Which existing instances may be re-added
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ExistingKind {
    /// Every shard on the existing instance is leaving
    WithLeavingShardsOnly,
    /// The existing instance has no initializing shards
    WithAvailableOrLeavingShardsOnly,
}

/// Which shards the optimization pass may move
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Optimize {
    /// Only shards assigned during this operation
    Safe,
    /// Any non-leaving shard, accepting extra shard movement
    Unsafe,
}

/// Working state for placing shards onto instances
#[derive(Debug)]
pub struct PlacementHelper {
    opts: Options,
    rf: usize,
    unique_shards: Vec<u32>,
    max_shard_set_id: u32,
    instances: BTreeMap<String, Instance>,
    detached: BTreeMap<String, Instance>,
    target_load: HashMap<String, i64>,
    shard_to_instances: HashMap<u32, BTreeSet<String>>,
    group_to_instances: HashMap<String, BTreeSet<String>>,
    group_to_weight: HashMap<String, u64>,
    total_weight: u64,
}

impl PlacementHelper {
    /// Build a helper over a placement at its own replica factor
    #[must_use]
    pub fn new(p: &Placement, opts: &Options) -> Self {
        Self::with_target_rf(p, p.replica_factor, opts)
    }

    pub(crate) fn with_target_rf(p: &Placement, rf: usize, opts: &Options) -> Self {
        let mut helper = Self {
            opts: opts.clone(),
            rf,
            unique_shards: p.shards.clone(),
            max_shard_set_id: p.max_shard_set_id,
            instances: p.instances.clone(),
            detached: BTreeMap::new(),
            target_load: HashMap::new(),
            shard_to_instances: HashMap::new(),
            group_to_instances: HashMap::new(),
            group_to_weight: HashMap::new(),
            total_weight: 0,
        };
        helper.scan_current_load();
        helper.build_target_load();
        helper
    }

    /// Helper for an initial placement: one replica of every shard
    pub(crate) fn for_initial(instances: Vec<Instance>, shards: Vec<u32>, opts: &Options) -> Self {
        let empty = Placement::new()
            .with_instances(instances)
            .with_shards(shards)
            .with_replica_factor(0)
            .with_is_sharded(true)
            .with_cutover_nanos(opts.placement_cutover_nanos());
        Self::with_target_rf(&empty, 1, opts)
    }

    /// Helper targeting one more replica than the placement has
    pub(crate) fn for_add_replica(p: &Placement, opts: &Options) -> Self {
        Self::with_target_rf(p, p.replica_factor + 1, opts)
    }

    /// Helper with `instance` in the placement. An instance already present
    /// is re-used as it is in the placement if it matches `kind`.
    pub(crate) fn for_add_instance(
        p: &Placement,
        instance: &Instance,
        opts: &Options,
        kind: ExistingKind,
    ) -> Result<Self> {
        let Some(existing) = p.instance(&instance.id) else {
            let mut p = p.clone();
            p.instances.insert(instance.id.clone(), instance.clone());
            return Ok(Self::new(&p, opts));
        };

        match kind {
            ExistingKind::WithLeavingShardsOnly => {
                if !existing.is_leaving() {
                    return Err(Error::invalid_instance_state(
                        &instance.id,
                        "the adding instance contains non leaving shards",
                    ));
                }
            }
            ExistingKind::WithAvailableOrLeavingShardsOnly => {
                let shards = &existing.shards;
                if shards.len()
                    != shards.num_shards_for_state(ShardState::Available)
                        + shards.num_shards_for_state(ShardState::Leaving)
                {
                    return Err(Error::invalid_instance_state(
                        &instance.id,
                        "the adding instance contains initializing shards",
                    ));
                }
            }
        }
        Ok(Self::new(p, opts))
    }

    /// Helper without the instance; it is kept detached so its shards can
    /// be moved away.
    pub(crate) fn for_remove_instance(p: &Placement, id: &str, opts: &Options) -> Result<Self> {
        let (p, leaving) = remove_instance_from_placement(p.clone(), id)?;
        let mut helper = Self::new(&p, opts);
        helper.detached.insert(leaving.id.clone(), leaving);
        Ok(helper)
    }

    /// Helper where the leaving instances are detached and the adding
    /// instances are part of the placement.
    pub(crate) fn for_replace_instances(
        p: &Placement,
        leaving_ids: &[String],
        adding: &[Instance],
        opts: &Options,
    ) -> Result<Self> {
        let mut p = p.clone();
        let mut leaving = Vec::with_capacity(leaving_ids.len());
        for id in leaving_ids {
            let (rest, instance) = remove_instance_from_placement(p, id)?;
            p = rest;
            leaving.push(instance);
        }
        for instance in adding {
            p = add_instance_to_placement(p, instance.clone(), AddKind::Any)?;
        }
        let mut helper = Self::new(&p, opts);
        for instance in leaving {
            helper.detached.insert(instance.id.clone(), instance);
        }
        Ok(helper)
    }

    fn scan_current_load(&mut self) {
        let mut total_weight = 0;
        for instance in self.instances.values() {
            self.group_to_instances
                .entry(instance.isolation_group.clone())
                .or_default()
                .insert(instance.id.clone());

            // Leaving instances are not usable capacity
            if instance.is_leaving() {
                continue;
            }

            *self
                .group_to_weight
                .entry(instance.isolation_group.clone())
                .or_default() += u64::from(instance.weight);
            total_weight += u64::from(instance.weight);

            for shard in instance.shards.iter() {
                if shard.state() == ShardState::Leaving {
                    continue;
                }
                self.shard_to_instances
                    .entry(shard.id())
                    .or_default()
                    .insert(instance.id.clone());
            }
        }
        self.total_weight = total_weight;
    }

    fn build_target_load(&mut self) {
        let mut over_weighted_groups = 0i64;
        let mut over_weight = 0u64;
        for weight in self.group_to_weight.values() {
            if is_over_weighted(*weight, self.total_weight, self.rf) {
                over_weighted_groups += 1;
                over_weight += *weight;
            }
        }

        let num_shards = self.unique_shards.len() as u64;
        let rf = self.rf as i64;
        let mut target_load = HashMap::with_capacity(self.instances.len());
        for instance in self.instances.values() {
            if instance.is_leaving() {
                continue;
            }
            let group_weight = self
                .group_to_weight
                .get(&instance.isolation_group)
                .copied()
                .unwrap_or(0);
            let weight = u64::from(instance.weight);
            let target = if is_over_weighted(group_weight, self.total_weight, self.rf) {
                // An oversized group holds one full replica spread by weight
                (num_shards * weight).div_ceil(group_weight) as i64
            } else {
                let rest_weight = self.total_weight - over_weight;
                if rest_weight == 0 {
                    0
                } else {
                    (num_shards as i64) * (rf - over_weighted_groups) * (weight as i64)
                        / (rest_weight as i64)
                }
            };
            target_load.insert(instance.id.clone(), target);
        }
        self.target_load = target_load;
    }

    /// Instances managed by the helper in id order
    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    /// Whether a replica of `shard` may move from an instance in
    /// `from_group` to an instance in `to_group` without sharing an
    /// isolation group with another live replica.
    #[must_use]
    pub fn can_move_shard(&self, shard: u32, from_group: Option<&str>, to_group: &str) -> bool {
        if from_group == Some(to_group) {
            return true;
        }
        self.shard_to_instances.get(&shard).is_none_or(|holders| {
            holders
                .iter()
                .filter_map(|id| self.instances.get(id))
                .all(|holder| holder.isolation_group != to_group)
        })
    }

    pub(crate) fn target_load(&self, id: &str) -> i64 {
        self.target_load.get(id).copied().unwrap_or(0)
    }

    /// Target load minus current load
    pub(crate) fn left_load(&self, id: &str) -> i64 {
        self.target_load(id) - self.instance(id).map_or(0, load_on_instance)
    }

    pub(crate) fn isolation_group(&self, id: &str) -> &str {
        self.instance(id).map_or("", |i| i.isolation_group.as_str())
    }

    pub(crate) fn group_weight(&self, group: &str) -> u64 {
        self.group_to_weight.get(group).copied().unwrap_or(0)
    }

    pub(crate) fn num_instances_in_group(&self, group: &str) -> usize {
        self.group_to_instances.get(group).map_or(0, BTreeSet::len)
    }

    pub(crate) fn instance(&self, id: &str) -> Option<&Instance> {
        self.instances.get(id).or_else(|| self.detached.get(id))
    }

    fn instance_mut(&mut self, id: &str) -> Option<&mut Instance> {
        match self.instances.get_mut(id) {
            Some(instance) => Some(instance),
            None => self.detached.get_mut(id),
        }
    }

    /// A detached instance as it looks after the moves so far
    pub(crate) fn detached(&self, id: &str) -> Option<&Instance> {
        self.detached.get(id)
    }

    fn can_assign_instance(&self, shard: u32, from: Option<&str>, to: &str) -> bool {
        let Some(to_instance) = self.instances.get(to) else {
            return false;
        };
        // A leaving copy can be taken back
        if to_instance
            .shards
            .get(shard)
            .is_some_and(|s| s.state() != ShardState::Leaving)
        {
            return false;
        }
        let from_group = from.and_then(|id| self.instance(id)).map(|i| i.isolation_group.as_str());
        self.can_move_shard(shard, from_group, &to_instance.isolation_group)
    }

    /// Move one replica of `shard` from `from` (or from nowhere for a new
    /// replica) to `to`. Returns false if the move is not allowed.
    pub(crate) fn move_shard(&mut self, shard_id: u32, from: Option<&str>, to: &str) -> bool {
        if !self.can_assign_instance(shard_id, from, to) {
            return false;
        }

        let mut new_shard = Shard::new(shard_id);
        if let Some(from_id) = from {
            let cutoff = self.opts.shard_cutoff_nanos();
            let Some(from_instance) = self.instance_mut(from_id) else {
                return false;
            };
            let Some(candidate) = from_instance.shards.get_mut(shard_id) else {
                return false;
            };
            match candidate.state() {
                // Leaving shards go away when their twin is marked available
                ShardState::Leaving => return false,
                ShardState::Unknown | ShardState::Initializing => {
                    new_shard.set_source_id(candidate.source_id());
                    from_instance.shards.remove(shard_id);
                }
                ShardState::Available => {
                    candidate.set_state(ShardState::Leaving);
                    candidate.set_cutoff_nanos(cutoff);
                    new_shard.set_source_id(from_id);
                }
            }
            if let Some(holders) = self.shard_to_instances.get_mut(&shard_id) {
                holders.remove(from_id);
            }
        }

        let reclaiming = self
            .instances
            .get(to)
            .and_then(|i| i.shards.get(shard_id))
            .is_some_and(|s| s.state() == ShardState::Leaving);
        if reclaiming {
            // The destination still had the shard as leaving: take it back
            // and break the link from whoever was initializing it.
            new_shard = Shard::new(shard_id).with_state(ShardState::Available);
            let holders: Vec<String> = self
                .shard_to_instances
                .get(&shard_id)
                .map(|h| h.iter().cloned().collect())
                .unwrap_or_default();
            for holder in holders {
                if let Some(s) = self
                    .instances
                    .get_mut(&holder)
                    .and_then(|i| i.shards.get_mut(shard_id))
                    && s.source_id() == to
                {
                    s.set_source_id("");
                }
            }
        }

        self.assign_shard_to_instance(new_shard, to);
        true
    }

    fn assign_shard_to_instance(&mut self, shard: Shard, to: &str) {
        let id = shard.id();
        if let Some(instance) = self.instances.get_mut(to) {
            instance.shards.add(shard);
        }
        self.shard_to_instances
            .entry(id)
            .or_default()
            .insert(to.to_string());
    }

    fn non_leaving(&self, candidates: &[String]) -> Vec<String> {
        candidates
            .iter()
            .filter(|id| self.instances.get(*id).is_some_and(|i| !i.is_leaving()))
            .cloned()
            .collect()
    }

    /// Ids of all instances in the helper
    pub(crate) fn instance_ids(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    /// Distribute `shards` coming from `from` (or brand new replicas when
    /// `from` is `None`) over `candidates`.
    pub(crate) fn place_shards(
        &mut self,
        shards: Vec<Shard>,
        from: Option<&str>,
        candidates: &[String],
    ) -> Result<()> {
        let mut shard_set: BTreeMap<u32, Shard> = shards.into_iter().map(|s| (s.id(), s)).collect();
        if let Some(from) = from {
            // Initializing shards on a leaving instance go back to where
            // they came from first; nothing was streamed to them yet.
            self.return_initializing_shards_to_source(&mut shard_set, from, candidates);
        }

        let mut heap = InstanceHeap::new(self.non_leaving(candidates), true);
        let mut tried = Vec::new();
        for shard in shard_set.values() {
            if shard.state() == ShardState::Leaving {
                continue;
            }
            let mut moved = false;
            while let Some(candidate) = heap.pop(self) {
                let ok = self.move_shard(shard.id(), from, &candidate);
                tried.push(candidate);
                if ok {
                    moved = true;
                    break;
                }
            }
            if !moved {
                return Err(Error::NotEnoughIsolationGroups);
            }
            for id in tried.drain(..) {
                heap.push(id);
            }
        }
        Ok(())
    }

    /// Return the initializing shards of an instance to their sources
    pub(crate) fn return_initializing_shards(&mut self, id: &str) {
        let Some(instance) = self.instance(id) else {
            return;
        };
        let mut shard_set: BTreeMap<u32, Shard> =
            instance.shards.iter().map(|s| (s.id(), s.clone())).collect();
        let candidates = self.instance_ids();
        self.return_initializing_shards_to_source(&mut shard_set, id, &candidates);
    }

    fn return_initializing_shards_to_source(
        &mut self,
        shard_set: &mut BTreeMap<u32, Shard>,
        from: &str,
        candidates: &[String],
    ) {
        let candidates: BTreeSet<&str> = candidates.iter().map(String::as_str).collect();
        let returnable: Vec<(u32, String)> = shard_set
            .values()
            .filter(|s| s.state() == ShardState::Initializing && !s.source_id().is_empty())
            .map(|s| (s.id(), s.source_id().to_string()))
            .collect();
        for (shard_id, source_id) in returnable {
            // Candidates are not necessarily every instance in the placement
            if !candidates.contains(source_id.as_str()) {
                continue;
            }
            if self.instances.get(&source_id).is_none_or(Instance::is_leaving) {
                continue;
            }
            if self.move_shard(shard_id, Some(from), &source_id) {
                shard_set.remove(&shard_id);
            }
        }
    }

    fn most_under_loaded_instance(&self) -> Option<String> {
        let mut result = None;
        let mut max_gap = 0;
        for id in self.instances.keys() {
            let gap = self.left_load(id);
            if gap > max_gap {
                max_gap = gap;
                result = Some(id.clone());
            }
        }
        result
    }

    /// Rebalance by filling the most under-loaded instances
    pub(crate) fn optimize(&mut self, kind: Optimize) {
        let mut seen = BTreeSet::new();
        while let Some(id) = self.most_under_loaded_instance() {
            if !seen.insert(id.clone()) {
                return;
            }
            match kind {
                Optimize::Safe => self.assign_load_safe(&id),
                Optimize::Unsafe => self.assign_load_unsafe(&id),
            }
        }
    }

    fn assign_load_safe(&mut self, id: &str) {
        self.assign_target_load(id, |helper, from, to| {
            helper.move_one_shard_in_state(from, to, ShardState::Unknown)
        });
    }

    fn assign_load_unsafe(&mut self, id: &str) {
        self.assign_target_load(id, Self::move_one_shard);
    }

    /// Steal shards from the most loaded instances until `target` reaches
    /// its target load.
    fn assign_target_load(&mut self, target: &str, move_one: impl Fn(&mut Self, &str, &str) -> bool) {
        let target_load = self.target_load(target);
        let candidates = self.non_leaving(&self.instance_ids());
        let mut heap = InstanceHeap::new(candidates, false);
        while !heap.is_empty()
            && (self.instances.get(target).map_or(0, |i| i.shards.len()) as i64) < target_load
        {
            let Some(from) = heap.pop(self) else {
                break;
            };
            if move_one(self, &from, target) {
                heap.push(from);
            }
        }
    }

    fn move_one_shard(&mut self, from: &str, to: &str) -> bool {
        // Unknown shards were just placed and are free to move; initializing
        // shards are cheaper to move than available ones.
        self.move_one_shard_in_state(from, to, ShardState::Unknown)
            || self.move_one_shard_in_state(from, to, ShardState::Initializing)
            || self.move_one_shard_in_state(from, to, ShardState::Available)
    }

    fn move_one_shard_in_state(&mut self, from: &str, to: &str, state: ShardState) -> bool {
        let ids: Vec<u32> = self
            .instance(from)
            .map(|i| i.shards.iter().filter(|s| s.state() == state).map(Shard::id).collect())
            .unwrap_or_default();
        ids.into_iter().any(|id| self.move_shard(id, Some(from), to))
    }

    /// Pull back every shard that moved away from `id` and is still
    /// initializing elsewhere.
    pub(crate) fn reclaim_leaving_shards(&mut self, id: &str) {
        let has_leaving = self
            .instance(id)
            .is_some_and(|i| i.shards.num_shards_for_state(ShardState::Leaving) > 0);
        if !has_leaving {
            return;
        }
        let mut reclaimable = Vec::new();
        for instance in self.instances.values() {
            for shard in instance.shards.iter() {
                if shard.state() == ShardState::Initializing && shard.source_id() == id {
                    reclaimable.push((instance.id.clone(), shard.id()));
                }
            }
        }
        for (holder, shard_id) in reclaimable {
            if !self.move_shard(shard_id, Some(&holder), id) {
                // Another replica took the isolation group meanwhile; the
                // load is filled from the rest of the cluster instead.
                warn!(
                    "Could not reclaim shard {} on instance {} from {}",
                    shard_id, id, holder
                );
            }
        }
    }

    /// Bring an instance to its target load, reclaiming its own leaving
    /// shards first.
    pub(crate) fn add_instance(&mut self, id: &str) {
        self.reclaim_leaving_shards(id);
        self.assign_load_unsafe(id);
    }

    /// Emit the resulting placement. Shards assigned in this operation
    /// become initializing and instances without shards are dropped.
    #[must_use]
    pub(crate) fn generate_placement(&self) -> Placement {
        let cutover = self.opts.shard_cutover_nanos();
        let mut max_shard_set_id = self.max_shard_set_id;
        let mut instances = Vec::with_capacity(self.instances.len());
        for instance in self.instances.values() {
            if instance.shards.is_empty() {
                continue;
            }
            let mut instance = instance.clone();
            for shard in instance.shards.iter_mut() {
                if shard.state() == ShardState::Unknown {
                    *shard = Shard::new(shard.id())
                        .with_source_id(shard.source_id())
                        .with_state(ShardState::Initializing)
                        .with_cutover_nanos(cutover);
                }
            }
            max_shard_set_id = max_shard_set_id.max(instance.shard_set_id);
            instances.push(instance);
        }

        debug!(
            "Generated placement with {} instances at rf {}",
            instances.len(),
            self.rf
        );
        Placement::new()
            .with_instances(instances)
            .with_shards(self.unique_shards.clone())
            .with_replica_factor(self.rf)
            .with_is_sharded(true)
            .with_is_mirrored(self.opts.is_mirrored)
            .with_cutover_nanos(self.opts.placement_cutover_nanos())
            .with_max_shard_set_id(max_shard_set_id)
    }
}

/// `weight / total >= 1 / rf`
const fn is_over_weighted(group_weight: u64, total_weight: u64, rf: usize) -> bool {
    total_weight > 0 && rf > 0 && group_weight * rf as u64 >= total_weight
}

/// Shards an instance holds that count towards its load
pub(crate) fn load_on_instance(instance: &Instance) -> i64 {
    (instance.shards.len() - instance.shards.num_shards_for_state(ShardState::Leaving)) as i64
}

/// Fresh replicas of the given shard ids
pub(crate) fn new_shards(ids: &[u32]) -> Vec<Shard> {
    ids.iter().map(|id| Shard::new(*id)).collect()
}

pub(crate) fn add_instance_to_placement(
    mut p: Placement,
    instance: Instance,
    kind: AddKind,
) -> Result<Placement> {
    if p.instances.contains_key(&instance.id) {
        return Err(Error::InstanceAlreadyExists(instance.id));
    }
    if kind == AddKind::WithShards && instance.shards.is_empty() {
        return Ok(p);
    }
    p.instances.insert(instance.id.clone(), instance);
    Ok(p)
}

pub(crate) fn remove_instance_from_placement(
    mut p: Placement,
    id: &str,
) -> Result<(Placement, Instance)> {
    let instance = p
        .instances
        .remove(id)
        .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;
    Ok((p, instance))
}

/// Mark initializing shards on an instance available and drop their
/// leaving twins from the source instances.
pub fn mark_shards_available(
    mut p: Placement,
    instance_id: &str,
    shard_ids: &[u32],
    opts: &Options,
) -> Result<Placement> {
    for &shard_id in shard_ids {
        let instance = p
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))?;
        let shard = instance
            .shards
            .get(shard_id)
            .cloned()
            .ok_or_else(|| Error::ShardNotFound {
                shard: shard_id,
                instance: instance_id.to_string(),
            })?;
        if shard.state() != ShardState::Initializing {
            return Err(Error::invalid_shard_state(format!(
                "could not mark shard {shard_id} as available, it's not in Initializing state"
            )));
        }
        opts.check_shard_cutover(&shard)?;

        instance
            .shards
            .add(Shard::new(shard_id).with_state(ShardState::Available));
        p.cutover_nanos = opts.placement_cutover_nanos();

        // No source for shards of an initial placement
        let source_id = shard.source_id();
        if source_id.is_empty() {
            continue;
        }

        let source = p
            .instances
            .get_mut(source_id)
            .ok_or_else(|| Error::InstanceNotFound(source_id.to_string()))?;
        let leaving = source
            .shards
            .get(shard_id)
            .ok_or_else(|| Error::ShardNotFound {
                shard: shard_id,
                instance: source_id.to_string(),
            })?;
        if leaving.state() != ShardState::Leaving {
            return Err(Error::invalid_shard_state(format!(
                "shard {shard_id} is not leaving instance {source_id}"
            )));
        }
        opts.check_shard_cutoff(leaving)?;

        source.shards.remove(shard_id);
        if source.shards.is_empty() {
            p.instances.remove(source_id);
        }
    }
    Ok(p)
}

/// Mark every initializing shard available. Also reports whether any
/// shard changed.
pub fn mark_all_shards_available(p: &Placement, opts: &Options) -> Result<(Placement, bool)> {
    let mut p = p.clone();
    let mut updated = false;
    for id in p.instances.keys().cloned().collect::<Vec<_>>() {
        let initializing: Vec<u32> = p.instances.get(&id).map_or_else(Vec::new, |i| {
            i.shards
                .iter()
                .filter(|s| s.state() == ShardState::Initializing)
                .map(Shard::id)
                .collect()
        });
        for shard_id in initializing {
            p = mark_shards_available(p, &id, &[shard_id], opts)?;
            updated = true;
        }
    }
    Ok((p, updated))
}

/// Settle every shard when only stable shard states should be emitted
pub(crate) fn try_cleanup_shard_state(p: Placement, opts: &Options) -> Result<Placement> {
    if opts.shard_state_mode == ShardStateMode::StableShardStateOnly {
        let opts = opts.clone().without_shard_predicates();
        return Ok(mark_all_shards_available(&p, &opts)?.0);
    }
    Ok(p)
}
