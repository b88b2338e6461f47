//! Runtime options for the placement algorithms and service
//!
//! [`Options`] is built from the serializable [`PlacementConfig`] and adds
//! the hooks that cannot be expressed in configuration: time sources,
//! shard cutover/cutoff predicates, the validator run before every update
//! and the instance selector.

use crate::placement::Placement;
use crate::selector::InstanceSelector;
use crate::shard::Shard;
use crate::validate::validate;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tessera_common::{PlacementConfig, Result, ShardStateMode};

/// Value stamped by the default time functions
pub const UNINITIALIZED_NANOS: i64 = 0;

/// Produces a timestamp in nanoseconds
pub type TimeNanosFn = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Checks whether a shard may transition
pub type ShardValidateFn = Arc<dyn Fn(&Shard) -> Result<()> + Send + Sync>;

/// Checks a whole placement
pub type ValidateFn = Arc<dyn Fn(&Placement) -> Result<()> + Send + Sync>;

/// Current wall-clock time in nanoseconds since the unix epoch
#[must_use]
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

/// Placement options
#[derive(Clone)]
pub struct Options {
    pub allow_partial_replace: bool,
    pub allow_all_zones: bool,
    pub add_all_candidates: bool,
    pub is_sharded: bool,
    pub is_mirrored: bool,
    pub is_staged: bool,
    pub shard_state_mode: ShardStateMode,
    pub valid_zone: Option<String>,
    pub dryrun: bool,
    /// Mark pending shard moves available before a mirrored add, remove or replace
    pub settle_before_mirrored_update: bool,
    pub placement_cutover_nanos_fn: TimeNanosFn,
    pub shard_cutover_nanos_fn: TimeNanosFn,
    pub shard_cutoff_nanos_fn: TimeNanosFn,
    /// `None` accepts every shard
    pub is_shard_cutover_fn: Option<ShardValidateFn>,
    /// `None` accepts every shard
    pub is_shard_cutoff_fn: Option<ShardValidateFn>,
    pub validate_fn_before_update: ValidateFn,
    pub now_fn: TimeNanosFn,
    pub instance_selector: Option<Arc<dyn InstanceSelector>>,
}

impl Default for Options {
    fn default() -> Self {
        Self::from_config(&PlacementConfig::default())
    }
}

impl Options {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build options from configuration with default hooks
    #[must_use]
    pub fn from_config(config: &PlacementConfig) -> Self {
        let uninitialized: TimeNanosFn = Arc::new(|| UNINITIALIZED_NANOS);
        Self {
            allow_partial_replace: config.allow_partial_replace,
            allow_all_zones: config.allow_all_zones,
            add_all_candidates: config.add_all_candidates,
            is_sharded: config.is_sharded || config.is_mirrored,
            is_mirrored: config.is_mirrored,
            is_staged: config.is_staged,
            shard_state_mode: config.shard_state_mode,
            valid_zone: config.valid_zone.clone(),
            dryrun: config.dryrun,
            settle_before_mirrored_update: config.settle_before_mirrored_update,
            placement_cutover_nanos_fn: uninitialized.clone(),
            shard_cutover_nanos_fn: uninitialized.clone(),
            shard_cutoff_nanos_fn: uninitialized,
            is_shard_cutover_fn: None,
            is_shard_cutoff_fn: None,
            validate_fn_before_update: Arc::new(validate),
            now_fn: Arc::new(now_nanos),
            instance_selector: None,
        }
    }

    #[must_use]
    pub const fn with_allow_partial_replace(mut self, v: bool) -> Self {
        self.allow_partial_replace = v;
        self
    }

    #[must_use]
    pub const fn with_allow_all_zones(mut self, v: bool) -> Self {
        self.allow_all_zones = v;
        self
    }

    #[must_use]
    pub const fn with_add_all_candidates(mut self, v: bool) -> Self {
        self.add_all_candidates = v;
        self
    }

    #[must_use]
    pub const fn with_is_sharded(mut self, v: bool) -> Self {
        self.is_sharded = v;
        self
    }

    #[must_use]
    pub const fn with_is_mirrored(mut self, v: bool) -> Self {
        self.is_mirrored = v;
        self
    }

    #[must_use]
    pub const fn with_is_staged(mut self, v: bool) -> Self {
        self.is_staged = v;
        self
    }

    #[must_use]
    pub const fn with_shard_state_mode(mut self, mode: ShardStateMode) -> Self {
        self.shard_state_mode = mode;
        self
    }

    #[must_use]
    pub fn with_valid_zone(mut self, zone: impl Into<String>) -> Self {
        self.valid_zone = Some(zone.into());
        self
    }

    #[must_use]
    pub const fn with_dryrun(mut self, v: bool) -> Self {
        self.dryrun = v;
        self
    }

    #[must_use]
    pub const fn with_settle_before_mirrored_update(mut self, v: bool) -> Self {
        self.settle_before_mirrored_update = v;
        self
    }

    #[must_use]
    pub fn with_placement_cutover_nanos_fn(
        mut self,
        f: impl Fn() -> i64 + Send + Sync + 'static,
    ) -> Self {
        self.placement_cutover_nanos_fn = Arc::new(f);
        self
    }

    #[must_use]
    pub fn with_shard_cutover_nanos_fn(mut self, f: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.shard_cutover_nanos_fn = Arc::new(f);
        self
    }

    #[must_use]
    pub fn with_shard_cutoff_nanos_fn(mut self, f: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.shard_cutoff_nanos_fn = Arc::new(f);
        self
    }

    #[must_use]
    pub fn with_is_shard_cutover_fn(
        mut self,
        f: impl Fn(&Shard) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.is_shard_cutover_fn = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_is_shard_cutoff_fn(
        mut self,
        f: impl Fn(&Shard) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.is_shard_cutoff_fn = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_validate_fn_before_update(
        mut self,
        f: impl Fn(&Placement) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.validate_fn_before_update = Arc::new(f);
        self
    }

    #[must_use]
    pub fn with_now_fn(mut self, f: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.now_fn = Arc::new(f);
        self
    }

    #[must_use]
    pub fn with_instance_selector(mut self, selector: Arc<dyn InstanceSelector>) -> Self {
        self.instance_selector = Some(selector);
        self
    }

    /// Drop the shard transition predicates
    #[must_use]
    pub fn without_shard_predicates(mut self) -> Self {
        self.is_shard_cutover_fn = None;
        self.is_shard_cutoff_fn = None;
        self
    }

    pub(crate) fn placement_cutover_nanos(&self) -> i64 {
        (self.placement_cutover_nanos_fn)()
    }

    pub(crate) fn shard_cutover_nanos(&self) -> i64 {
        (self.shard_cutover_nanos_fn)()
    }

    pub(crate) fn shard_cutoff_nanos(&self) -> i64 {
        (self.shard_cutoff_nanos_fn)()
    }

    pub(crate) fn now(&self) -> i64 {
        (self.now_fn)()
    }

    pub(crate) fn check_shard_cutover(&self, shard: &Shard) -> Result<()> {
        self.is_shard_cutover_fn.as_ref().map_or(Ok(()), |f| f(shard))
    }

    pub(crate) fn check_shard_cutoff(&self, shard: &Shard) -> Result<()> {
        self.is_shard_cutoff_fn.as_ref().map_or(Ok(()), |f| f(shard))
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("allow_partial_replace", &self.allow_partial_replace)
            .field("allow_all_zones", &self.allow_all_zones)
            .field("add_all_candidates", &self.add_all_candidates)
            .field("is_sharded", &self.is_sharded)
            .field("is_mirrored", &self.is_mirrored)
            .field("is_staged", &self.is_staged)
            .field("shard_state_mode", &self.shard_state_mode)
            .field("valid_zone", &self.valid_zone)
            .field("dryrun", &self.dryrun)
            .field(
                "settle_before_mirrored_update",
                &self.settle_before_mirrored_update,
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_common::Error;

    #[test]
    fn test_defaults_follow_config() {
        let opts = Options::default();
        assert!(opts.allow_partial_replace);
        assert!(opts.is_sharded);
        assert!(!opts.is_mirrored);
        assert_eq!(opts.placement_cutover_nanos(), UNINITIALIZED_NANOS);
        assert!(opts.check_shard_cutover(&Shard::new(1)).is_ok());
        assert!(opts.now() > 0);
    }

    #[test]
    fn test_mirrored_config_implies_sharded() {
        let config = PlacementConfig {
            is_sharded: false,
            is_mirrored: true,
            ..Default::default()
        };
        assert!(Options::from_config(&config).is_sharded);
    }

    #[test]
    fn test_shard_predicates() {
        let opts = Options::new()
            .with_is_shard_cutover_fn(|s| {
                if s.cutover_nanos() > 10 {
                    Err(Error::invalid_shard_state("not cut over"))
                } else {
                    Ok(())
                }
            })
            .with_is_shard_cutoff_fn(|_| Err(Error::invalid_shard_state("never")));
        assert!(opts.check_shard_cutover(&Shard::new(1).with_cutover_nanos(5)).is_ok());
        assert!(opts.check_shard_cutover(&Shard::new(1).with_cutover_nanos(50)).is_err());
        assert!(opts.check_shard_cutoff(&Shard::new(1)).is_err());

        let opts = opts.without_shard_predicates();
        assert!(opts.check_shard_cutoff(&Shard::new(1)).is_ok());
    }
}
