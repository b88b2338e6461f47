//! Algorithm for placements without shards
//!
//! Instances are a plain membership list and the replica factor is only a
//! number carried along.

use super::helper::{AddKind, add_instance_to_placement, remove_instance_from_placement};
use crate::instance::Instance;
use crate::options::Options;
use crate::placement::Placement;
use tessera_common::{Error, Result};

#[derive(Clone, Debug)]
pub struct NonShardedAlgorithm {
    opts: Options,
}

impl NonShardedAlgorithm {
    #[must_use]
    pub const fn new(opts: Options) -> Self {
        Self { opts }
    }

    pub fn is_compatible_with(&self, p: &Placement) -> Result<()> {
        if p.is_sharded {
            return Err(Error::IncompatibleAlgorithm("non-sharded"));
        }
        Ok(())
    }

    pub fn initial_placement(
        &self,
        instances: &[Instance],
        shards: &[u32],
        rf: usize,
    ) -> Result<Placement> {
        if !shards.is_empty() {
            return Err(Error::invalid_argument(
                "could not apply shards in non-sharded placement",
            ));
        }
        Ok(Placement::new()
            .with_instances(instances.iter().cloned())
            .with_replica_factor(rf)
            .with_cutover_nanos(self.opts.placement_cutover_nanos()))
    }

    pub fn add_replica(&self, p: &Placement) -> Result<Placement> {
        self.is_compatible_with(p)?;
        let mut p = p.clone();
        p.replica_factor += 1;
        p.cutover_nanos = self.opts.placement_cutover_nanos();
        Ok(p)
    }

    pub fn remove_instances(&self, p: &Placement, ids: &[String]) -> Result<Placement> {
        self.is_compatible_with(p)?;
        let mut p = p.clone();
        for id in ids {
            p = remove_instance_from_placement(p, id)?.0;
        }
        p.cutover_nanos = self.opts.placement_cutover_nanos();
        Ok(p)
    }

    pub fn add_instances(&self, p: &Placement, instances: &[Instance]) -> Result<Placement> {
        self.is_compatible_with(p)?;
        let mut p = p.clone();
        for instance in instances {
            p = add_instance_to_placement(p, instance.clone(), AddKind::Any)?;
        }
        p.cutover_nanos = self.opts.placement_cutover_nanos();
        Ok(p)
    }

    pub fn replace_instances(
        &self,
        p: &Placement,
        leaving_ids: &[String],
        adding: &[Instance],
    ) -> Result<Placement> {
        let p = self.remove_instances(p, leaving_ids)?;
        self.add_instances(&p, adding)
    }

    /// Nothing to mark without shards
    pub fn mark_shards_available(
        &self,
        p: &Placement,
        _instance_id: &str,
        _shard_ids: &[u32],
    ) -> Result<Placement> {
        self.is_compatible_with(p)?;
        Ok(p.clone())
    }

    pub fn mark_all_shards_available(&self, p: &Placement) -> Result<(Placement, bool)> {
        self.is_compatible_with(p)?;
        Ok((p.clone(), false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str) -> Instance {
        Instance::new_empty(id, "r1", "z1", format!("{id}:1"), 1)
    }

    fn algo() -> NonShardedAlgorithm {
        NonShardedAlgorithm::new(Options::default().with_is_sharded(false))
    }

    #[test]
    fn test_initial_rejects_shards() {
        assert!(algo().initial_placement(&[instance("i1")], &[0], 1).is_err());

        let p = algo().initial_placement(&[instance("i1")], &[], 2).unwrap();
        assert_eq!(p.replica_factor, 2);
        assert!(!p.is_sharded);
        crate::validate::validate(&p).unwrap();
    }

    #[test]
    fn test_membership_changes() {
        let algo = algo();
        let p = algo
            .initial_placement(&[instance("i1"), instance("i2")], &[], 1)
            .unwrap();

        let p = algo.add_instances(&p, &[instance("i3")]).unwrap();
        assert_eq!(p.num_instances(), 3);
        assert!(matches!(
            algo.add_instances(&p, &[instance("i3")]),
            Err(Error::InstanceAlreadyExists(_))
        ));

        let p = algo.remove_instances(&p, &["i1".to_string()]).unwrap();
        assert!(p.instance("i1").is_none());
        assert!(matches!(
            algo.remove_instances(&p, &["i1".to_string()]),
            Err(Error::InstanceNotFound(_))
        ));

        let p = algo
            .replace_instances(&p, &["i2".to_string()], &[instance("i4")])
            .unwrap();
        let ids: Vec<&str> = p.instances().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["i3", "i4"]);

        let p = algo.add_replica(&p).unwrap();
        assert_eq!(p.replica_factor, 2);
        assert!(!algo.mark_all_shards_available(&p).unwrap().1);
    }

    #[test]
    fn test_sharded_placement_is_incompatible() {
        let p = Placement::new().with_is_sharded(true);
        assert!(matches!(
            algo().add_replica(&p),
            Err(Error::IncompatibleAlgorithm(_))
        ));
    }
}
