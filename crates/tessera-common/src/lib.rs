//! tessera common - shared error and configuration types
//!
//! This crate provides the error taxonomy and the serializable
//! configuration used across all tessera components.

pub mod config;
pub mod error;

pub use config::{
    Config, NamespaceConfig, PlacementConfig, ServiceConfig, ShardStateMode, StoreConfig,
    WatcherConfig,
};
pub use error::{Error, Result};
