//! SQLite-backed store of named cache compartments.
//!
//! This module provides the persistent response store using SQLite with
//! async access via tokio-rusqlite. It supports:
//!
//! - Named compartments created lazily on first write
//! - Content-addressed keys using SHA-256 hashing
//! - Per-entry insertion and last-access timestamps for eviction
//! - Generation records for the precache lifecycle
//! - Automatic schema migrations and WAL mode for concurrent access

pub mod compartments;
pub mod connection;
pub mod entries;
pub mod generations;
pub mod key;
pub mod migrations;

pub use crate::Error;

pub use compartments::CompartmentStats;
pub use connection::CacheDb;
pub use entries::{CacheEntry, EntryMeta, Payload};
pub use generations::{GenerationRecord, GenerationState};
pub use key::ResourceKey;
