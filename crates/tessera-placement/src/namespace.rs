//! Service identity and key namespacing
//!
//! Placements and service metadata live under separate namespaces of the
//! same store, keyed by `<namespace>/<environment>/<service>`.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use tessera_common::{NamespaceConfig, ServiceConfig};

/// Identifies a service across environments and zones
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("[name: {name}, env: {environment}, zone: {zone}]")]
pub struct ServiceId {
    pub name: String,
    pub environment: String,
    pub zone: String,
}

impl ServiceId {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    #[must_use]
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = zone.into();
        self
    }

    /// `<environment>/<name>`, or just the name without an environment
    #[must_use]
    pub fn key(&self) -> String {
        if self.environment.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.environment, self.name)
        }
    }
}

impl From<&ServiceConfig> for ServiceId {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            name: config.name.clone(),
            environment: config.environment.clone(),
            zone: config.zone.clone(),
        }
    }
}

/// Namespaces for placement and metadata keys
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceOptions {
    pub placement: String,
    pub metadata: String,
}

impl Default for NamespaceOptions {
    fn default() -> Self {
        Self::from(&NamespaceConfig::default())
    }
}

impl From<&NamespaceConfig> for NamespaceOptions {
    fn from(config: &NamespaceConfig) -> Self {
        Self {
            placement: config.placement.clone(),
            metadata: config.metadata.clone(),
        }
    }
}

/// Key holding the placement of a service
#[must_use]
pub fn placement_key(ns: &NamespaceOptions, sid: &ServiceId) -> String {
    format!("{}/{}", ns.placement, sid.key())
}

/// Key holding the metadata of a service
#[must_use]
pub fn metadata_key(ns: &NamespaceOptions, sid: &ServiceId) -> String {
    format!("{}/{}", ns.metadata, sid.key())
}
