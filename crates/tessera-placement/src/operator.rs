//! In-memory placement operator
//!
//! Chains several placement operations on a placement held in memory and
//! hands back the result. Nothing is persisted and versions are not
//! checked.

use crate::options::Options;
use crate::placement::Placement;
use crate::service::{PlacementService, PlacementStore};
use parking_lot::RwLock;
use std::ops::Deref;
use tessera_common::{Error, Result};

/// Holds the operator's working placement
#[derive(Debug, Default)]
pub struct InMemoryPlacement {
    current: RwLock<Option<Placement>>,
}

impl InMemoryPlacement {
    #[must_use]
    pub fn new(initial: Option<Placement>) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }
}

impl PlacementStore for InMemoryPlacement {
    fn set(&self, p: &Placement) -> Result<Placement> {
        *self.current.write() = Some(p.clone());
        Ok(p.clone())
    }

    /// Always writes
    fn check_and_set(&self, p: &Placement, _version: u64) -> Result<Placement> {
        self.set(p)
    }

    fn set_if_not_exist(&self, p: &Placement) -> Result<Placement> {
        let mut current = self.current.write();
        if current.is_some() {
            return Err(Error::invalid_argument(
                "placement already exists and can't be rebuilt",
            ));
        }
        *current = Some(p.clone());
        Ok(p.clone())
    }

    fn placement(&self) -> Result<Placement> {
        self.current.read().clone().ok_or_else(|| {
            Error::invalid_argument("no initial placement specified in operator constructor")
        })
    }
}

/// Placement service over an [`InMemoryPlacement`]
#[derive(Debug)]
pub struct PlacementOperator {
    service: PlacementService<InMemoryPlacement>,
}

impl PlacementOperator {
    /// Start from `initial`, or from nothing so that the first call must
    /// build an initial placement
    #[must_use]
    pub fn new(initial: Option<Placement>, opts: Options) -> Self {
        Self {
            service: PlacementService::new(InMemoryPlacement::new(initial), opts),
        }
    }

    /// The working placement, `None` before an initial placement exists
    #[must_use]
    pub fn current(&self) -> Option<Placement> {
        self.service.store().placement().ok()
    }
}

impl Deref for PlacementOperator {
    type Target = PlacementService<InMemoryPlacement>;

    fn deref(&self) -> &Self::Target {
        &self.service
    }
}
