//! Core types and shared functionality for gearcache.
//!
//! This crate provides:
//! - Compartmented response store with SQLite backend
//! - Retention enforcement for runtime compartments
//! - Precache manifest model and generation identity
//! - Route table and request model
//! - Unified error types
//! - Configuration structures

pub mod cache;
pub mod config;
pub mod error;
pub mod expiration;
pub mod manifest;
pub mod request;
pub mod routes;
pub mod url;

pub use cache::{CacheDb, CacheEntry, GenerationState, Payload, ResourceKey};
pub use config::{ActivationPolicy, AppConfig, ConfigError};
pub use error::Error;
pub use expiration::{ExpirationReport, RetentionPolicy};
pub use manifest::{Manifest, ManifestEntry};
pub use request::{Destination, Request};
pub use routes::{RouteRule, RouteTable, StrategyKind};
