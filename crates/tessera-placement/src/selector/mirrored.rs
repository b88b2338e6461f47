//! Port-mirrored selector
//!
//! Hosts of equal weight are grouped `rf` at a time across distinct
//! isolation groups. Inside a host group the instances listening on the
//! same port form one shard set.

use super::{
    InstanceSelector, ReplacementGroup, assign_shard_set_ids_to_replacements,
    assign_shard_sets_to_grouped_instances, leaving_instances, valid_candidates,
};
use crate::instance::Instance;
use crate::options::Options;
use crate::placement::Placement;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use tessera_common::{Error, Result};
use tracing::warn;

const NO_VALID_MIRROR_INSTANCE: &str = "no valid instance for mirror placement in the candidate list";

/// Groups instances into shard sets by host and port
#[derive(Clone, Debug)]
pub struct PortMirroredSelector {
    opts: Options,
}

impl PortMirroredSelector {
    #[must_use]
    pub const fn new(opts: Options) -> Self {
        Self { opts }
    }
}

impl InstanceSelector for PortMirroredSelector {
    fn select_initial_instances(
        &self,
        candidates: &[Instance],
        rf: usize,
    ) -> Result<Vec<Instance>> {
        let candidates = valid_candidates(&Placement::new(), candidates, &self.opts)?;

        let mut groups = Vec::new();
        for hosts in group_hosts_by_weight(candidates)?.into_values() {
            let (grouped, ungrouped) = group_hosts_across_isolation_groups(hosts, rf);
            for host in &ungrouped {
                warn!(
                    "could not group host {} in isolation group {} with weight {}",
                    host.name, host.isolation_group, host.weight
                );
            }
            groups.extend(group_instances_by_port(&grouped)?);
        }

        if groups.is_empty() {
            return Err(Error::no_valid_instance(NO_VALID_MIRROR_INSTANCE));
        }
        Ok(assign_shard_sets_to_grouped_instances(groups, &Placement::new()))
    }

    fn select_adding_instances(
        &self,
        candidates: &[Instance],
        p: &Placement,
    ) -> Result<Vec<Instance>> {
        let candidates = valid_candidates(p, candidates, &self.opts)?;

        let mut groups = Vec::new();
        for hosts in group_hosts_by_weight(candidates)?.into_values() {
            let (grouped, _) = group_hosts_across_isolation_groups(hosts, p.replica_factor);
            if grouped.is_empty() {
                continue;
            }
            if !self.opts.add_all_candidates {
                // One host group at a time
                groups = group_instances_by_port(&grouped[..1])?;
                break;
            }
            groups.extend(group_instances_by_port(&grouped)?);
        }

        if groups.is_empty() {
            return Err(Error::no_valid_instance(NO_VALID_MIRROR_INSTANCE));
        }
        Ok(assign_shard_sets_to_grouped_instances(groups, p))
    }

    /// Replace instances living on one host with the matching ports of
    /// another host of the same weight.
    ///
    /// Backing out of a replacement works the same way: the leaving host of
    /// the earlier replace is simply offered as a candidate again.
    fn select_replace_instances(
        &self,
        candidates: &[Instance],
        leaving_ids: &[String],
        p: &Placement,
    ) -> Result<Vec<Instance>> {
        let candidates = valid_candidates(p, candidates, &self.opts)?;
        let leaving = leaving_instances(p, leaving_ids)?;

        let mut leaving_host: Option<Host> = None;
        let mut shard_set_ids = HashSet::with_capacity(leaving.len());
        for instance in leaving {
            shard_set_ids.insert(instance.shard_set_id);
            let host = leaving_host.get_or_insert_with(|| Host::for_instance(&instance));
            host.add_instance(instance)?;
        }
        let leaving_host =
            leaving_host.ok_or_else(|| Error::invalid_argument("no instances to replace"))?;

        let mut by_weight = group_hosts_by_weight(candidates)?;
        let hosts = by_weight.remove(&leaving_host.weight).ok_or_else(|| {
            Error::no_valid_instance(format!(
                "could not find instances with weight {} in the candidate list",
                leaving_host.weight
            ))
        })?;

        // Isolation groups already serving the shard sets from other hosts
        let conflicting_groups: HashSet<&str> = p
            .instances()
            .filter(|i| shard_set_ids.contains(&i.shard_set_id))
            .filter(|i| i.hostname != leaving_host.name && !i.is_leaving())
            .map(|i| i.isolation_group.as_str())
            .collect();

        let mut replacements = Vec::new();
        for candidate in hosts {
            if candidate.name == leaving_host.name
                || conflicting_groups.contains(candidate.isolation_group.as_str())
            {
                continue;
            }

            let candidate_name = candidate.name.clone();
            let groups = match group_instances_by_port(&[vec![leaving_host.clone(), candidate]]) {
                Ok(groups) => groups,
                Err(e) => {
                    warn!(
                        "could not match candidate host {candidate_name} with host {}: {e}",
                        leaving_host.name
                    );
                    continue;
                }
            };

            for group in groups {
                let mut leaving = None;
                let mut replacement = None;
                for instance in group {
                    if instance.hostname == leaving_host.name {
                        leaving = Some(instance);
                    } else if instance.hostname == candidate_name {
                        replacement = Some(instance);
                    }
                }
                let (Some(leaving), Some(replacement)) = (leaving, replacement) else {
                    return Err(Error::internal(format!(
                        "failed to pair host {} with host {candidate_name}",
                        leaving_host.name
                    )));
                };
                replacements.push(ReplacementGroup {
                    leaving,
                    replacement,
                });
            }
            break;
        }

        if replacements.is_empty() {
            return Err(Error::no_valid_instance(NO_VALID_MIRROR_INSTANCE));
        }
        assign_shard_set_ids_to_replacements(leaving_ids, replacements)
    }
}

/// Instances sharing a hostname, keyed by port
#[derive(Clone, Debug)]
struct Host {
    name: String,
    isolation_group: String,
    weight: u32,
    port_to_instance: BTreeMap<u32, Instance>,
}

impl Host {
    fn for_instance(instance: &Instance) -> Self {
        Self {
            name: instance.hostname.clone(),
            isolation_group: instance.isolation_group.clone(),
            weight: instance.weight,
            port_to_instance: BTreeMap::new(),
        }
    }

    fn add_instance(&mut self, instance: Instance) -> Result<()> {
        if instance.weight != self.weight {
            return Err(Error::invalid_argument(format!(
                "could not add instance {} to host {}, weight mismatch: {} and {}",
                instance.id, self.name, instance.weight, self.weight
            )));
        }
        if instance.isolation_group != self.isolation_group {
            return Err(Error::invalid_argument(format!(
                "could not add instance {} to host {}, isolation group mismatch: {} and {}",
                instance.id, self.name, instance.isolation_group, self.isolation_group
            )));
        }
        self.port_to_instance.insert(instance.port, instance);
        Ok(())
    }
}

/// Hosts bucketed by weight, each bucket in first-seen order
fn group_hosts_by_weight(candidates: Vec<Instance>) -> Result<BTreeMap<u32, Vec<Host>>> {
    let mut hosts: Vec<Host> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for instance in candidates {
        let idx = *index.entry(instance.hostname.clone()).or_insert_with(|| {
            hosts.push(Host::for_instance(&instance));
            hosts.len() - 1
        });
        hosts[idx].add_instance(instance)?;
    }

    let mut by_weight: BTreeMap<u32, Vec<Host>> = BTreeMap::new();
    for host in hosts {
        by_weight.entry(host.weight).or_default().push(host);
    }
    Ok(by_weight)
}

/// Hosts of one isolation group, ordered in the heap by how many remain
#[derive(Debug)]
struct IsolationGroupHosts {
    name: String,
    hosts: Vec<Host>,
}

impl Ord for IsolationGroupHosts {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hosts
            .len()
            .cmp(&other.hosts.len())
            .then_with(|| other.name.cmp(&self.name))
    }
}

impl PartialOrd for IsolationGroupHosts {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IsolationGroupHosts {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IsolationGroupHosts {}

/// Make as many groups of `rf` hosts from distinct isolation groups as
/// possible, always drawing from the isolation groups with the most hosts
/// left. Returns the groups and the hosts left over.
fn group_hosts_across_isolation_groups(hosts: Vec<Host>, rf: usize) -> (Vec<Vec<Host>>, Vec<Host>) {
    if rf == 0 || hosts.len() < rf {
        return (Vec::new(), hosts);
    }

    let mut by_group: Vec<IsolationGroupHosts> = Vec::new();
    for host in hosts {
        match by_group.iter_mut().find(|g| g.name == host.isolation_group) {
            Some(group) => group.hosts.push(host),
            None => by_group.push(IsolationGroupHosts {
                name: host.isolation_group.clone(),
                hosts: vec![host],
            }),
        }
    }

    let mut heap: BinaryHeap<IsolationGroupHosts> = by_group.into_iter().collect();
    let mut groups = Vec::new();
    while heap.len() >= rf {
        let mut drawn = Vec::with_capacity(rf);
        let mut group = Vec::with_capacity(rf);
        for _ in 0..rf {
            let Some(mut isolation_group) = heap.pop() else {
                break;
            };
            if let Some(host) = isolation_group.hosts.pop() {
                group.push(host);
            }
            drawn.push(isolation_group);
        }
        if group.len() == rf {
            groups.push(group);
        }
        heap.extend(drawn.into_iter().filter(|g| !g.hosts.is_empty()));
    }

    let ungrouped = heap.into_iter().flat_map(|g| g.hosts).collect();
    (groups, ungrouped)
}

/// Pair instances across the hosts of each group by port
fn group_instances_by_port(host_groups: &[Vec<Host>]) -> Result<Vec<Vec<Instance>>> {
    let mut instance_groups = Vec::new();
    for hosts in host_groups {
        let Some((first, others)) = hosts.split_first() else {
            continue;
        };
        for (port, instance) in &first.port_to_instance {
            let mut group = Vec::with_capacity(hosts.len());
            group.push(instance.clone());
            for other in others {
                let sibling = other.port_to_instance.get(port).ok_or_else(|| {
                    Error::invalid_argument(format!(
                        "could not find port {port} on host {}",
                        other.name
                    ))
                })?;
                group.push(sibling.clone());
            }
            instance_groups.push(group);
        }
    }
    Ok(instance_groups)
}
