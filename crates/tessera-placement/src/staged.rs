//! Staged placements
//!
//! A staged placement is a version-tagged list of placements in ascending
//! cutover order. The placement in effect at time `t` is the last one whose
//! cutover is no later than `t`.
//!
//! [`ActiveStagedPlacement`] hands out [`ActivePlacementGuard`]s holding a
//! read lock. Expiry and [`ActiveStagedPlacement::close`] need the write
//! lock, so a guard must be dropped once the caller is done with it.

use crate::options::{TimeNanosFn, now_nanos};
use crate::placement::{Placement, Placements};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tessera_common::{Error, Result};
use tessera_proto as proto;
use tracing::debug;

/// Invoked with the placements entering or leaving an active staged
/// placement
pub type PlacementsFn = Arc<dyn Fn(&[Placement]) + Send + Sync>;

/// Clock and callbacks for active staged placements
#[derive(Clone)]
pub struct ActiveStagedPlacementOptions {
    pub now_fn: TimeNanosFn,
    pub on_placements_added_fn: Option<PlacementsFn>,
    pub on_placements_removed_fn: Option<PlacementsFn>,
}

impl Default for ActiveStagedPlacementOptions {
    fn default() -> Self {
        Self {
            now_fn: Arc::new(now_nanos),
            on_placements_added_fn: None,
            on_placements_removed_fn: None,
        }
    }
}

impl fmt::Debug for ActiveStagedPlacementOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveStagedPlacementOptions")
            .field("on_placements_added_fn", &self.on_placements_added_fn.is_some())
            .field("on_placements_removed_fn", &self.on_placements_removed_fn.is_some())
            .finish_non_exhaustive()
    }
}

impl ActiveStagedPlacementOptions {
    #[must_use]
    pub fn with_now_fn(mut self, f: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.now_fn = Arc::new(f);
        self
    }

    #[must_use]
    pub fn with_on_placements_added_fn(
        mut self,
        f: impl Fn(&[Placement]) + Send + Sync + 'static,
    ) -> Self {
        self.on_placements_added_fn = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_on_placements_removed_fn(
        mut self,
        f: impl Fn(&[Placement]) + Send + Sync + 'static,
    ) -> Self {
        self.on_placements_removed_fn = Some(Arc::new(f));
        self
    }
}

/// Versioned placements sorted by cutover
#[derive(Clone, Debug, Default)]
pub struct StagedPlacement {
    version: u64,
    placements: Placements,
    opts: ActiveStagedPlacementOptions,
}

impl StagedPlacement {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_proto(
        version: u64,
        snapshots: &proto::PlacementSnapshots,
        opts: ActiveStagedPlacementOptions,
    ) -> Result<Self> {
        Ok(Self {
            version,
            placements: Placements::from_proto(snapshots)?,
            opts,
        })
    }

    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub const fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub const fn placements(&self) -> &Placements {
        &self.placements
    }

    /// Placements are re-sorted by cutover
    #[must_use]
    pub fn with_placements(mut self, placements: Vec<Placement>) -> Self {
        self.placements = Placements::new(placements);
        self
    }

    #[must_use]
    pub fn with_options(mut self, opts: ActiveStagedPlacementOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn to_proto(&self) -> Result<proto::PlacementSnapshots> {
        self.placements.to_proto()
    }

    /// The placements from the one in effect at `time_nanos` onwards. All
    /// of them when every cutover is still in the future.
    #[must_use]
    pub fn active_staged_placement(&self, time_nanos: i64) -> ActiveStagedPlacement {
        let start = self.placements.active_index(time_nanos).unwrap_or(0);
        let placements = self.placements.as_slice()[start..].to_vec();
        ActiveStagedPlacement::new(placements, self.opts.clone())
    }
}

#[derive(Debug)]
struct ActiveState {
    placements: Placements,
    closed: bool,
}

/// The placements of a staged placement that are in effect or upcoming
pub struct ActiveStagedPlacement {
    state: RwLock<ActiveState>,
    opts: ActiveStagedPlacementOptions,
}

impl fmt::Debug for ActiveStagedPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveStagedPlacement")
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

impl ActiveStagedPlacement {
    #[must_use]
    pub fn new(placements: Vec<Placement>, opts: ActiveStagedPlacementOptions) -> Self {
        if let Some(f) = &opts.on_placements_added_fn {
            f(&placements);
        }
        Self {
            state: RwLock::new(ActiveState {
                placements: Placements::new(placements),
                closed: false,
            }),
            opts,
        }
    }

    /// The placement in effect now. Dropping the guard releases the read
    /// lock it holds.
    ///
    /// Placements that have been superseded are pruned first whenever the
    /// write lock is free.
    pub fn active_placement(&self) -> Result<ActivePlacementGuard<'_>> {
        let now = (self.opts.now_fn)();
        let state = match self.state.try_write() {
            Some(mut state) => {
                self.expire(&mut state, now);
                RwLockWriteGuard::downgrade(state)
            }
            None => self.state.read(),
        };

        if state.closed {
            return Err(Error::ActivePlacementClosed);
        }
        let index = state
            .placements
            .active_index(now)
            .ok_or(Error::NoApplicablePlacement)?;
        Ok(ActivePlacementGuard { state, index })
    }

    /// Release every placement. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Ok(());
        }
        let placements = std::mem::take(&mut state.placements).into_vec();
        if let Some(f) = &self.opts.on_placements_removed_fn {
            f(&placements);
        }
        state.closed = true;
        Ok(())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    fn expire(&self, state: &mut ActiveState, now: i64) {
        if state.closed {
            return;
        }
        let Some(idx) = state.placements.active_index(now).filter(|&idx| idx > 0) else {
            return;
        };

        let mut placements = std::mem::take(&mut state.placements).into_vec();
        let kept = placements.split_off(idx);
        debug!(
            "Expired {} placements with cutover before {}",
            placements.len(),
            kept.first().map_or(0, |p| p.cutover_nanos)
        );
        if let Some(f) = &self.opts.on_placements_removed_fn {
            f(&placements);
        }
        state.placements = Placements::new(kept);
    }
}

/// Read access to the placement in effect
pub struct ActivePlacementGuard<'a> {
    state: RwLockReadGuard<'a, ActiveState>,
    index: usize,
}

impl ActivePlacementGuard<'_> {
    /// Release the read lock
    pub fn done(self) {}
}

impl Deref for ActivePlacementGuard<'_> {
    type Target = Placement;

    fn deref(&self) -> &Placement {
        &self.state.placements.as_slice()[self.index]
    }
}

impl fmt::Debug for ActivePlacementGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
