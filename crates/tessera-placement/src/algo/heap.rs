//! Candidate ordering for shard assignment

use super::helper::PlacementHelper;

/// A priority queue of instance ids ordered by remaining target load.
///
/// Priorities are recomputed from the helper on every pop since loads
/// change while shards move. In ascending mode the instance with the most
/// room left comes first (used to place shards), in descending mode the
/// most overloaded instance comes first (used to steal shards). When both
/// instances still have room and sit in different isolation groups, the
/// heavier group wins: it accepts fewer shards, so it should pick first.
#[derive(Debug)]
pub(crate) struct InstanceHeap {
    ids: Vec<String>,
    capacity_ascending: bool,
}

impl InstanceHeap {
    pub(crate) fn new(mut ids: Vec<String>, capacity_ascending: bool) -> Self {
        ids.sort();
        Self {
            ids,
            capacity_ascending,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub(crate) fn push(&mut self, id: String) {
        self.ids.push(id);
    }

    pub(crate) fn pop(&mut self, helper: &PlacementHelper) -> Option<String> {
        if self.ids.is_empty() {
            return None;
        }
        let mut best = 0;
        for i in 1..self.ids.len() {
            if self.less(helper, &self.ids[i], &self.ids[best]) {
                best = i;
            }
        }
        Some(self.ids.remove(best))
    }

    fn less(&self, helper: &PlacementHelper, a: &str, b: &str) -> bool {
        let left_a = helper.left_load(a);
        let left_b = helper.left_load(b);
        if left_a > 0 && left_b > 0 {
            let group_a = helper.isolation_group(a);
            let group_b = helper.isolation_group(b);
            if group_a != group_b {
                return helper.group_weight(group_a) > helper.group_weight(group_b);
            }
        }
        if self.capacity_ascending {
            left_a > left_b
        } else {
            left_a < left_b
        }
    }
}
