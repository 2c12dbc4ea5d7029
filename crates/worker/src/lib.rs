//! Request interception for gearcache.
//!
//! This crate provides:
//! - The strategy executor (precache lookup, cache-first,
//!   stale-while-revalidate, pass-through)
//! - The precache generation lifecycle
//! - [`CacheWorker`], the single `handle(request)` entry point
//! - Tracking of detached background work

pub mod background;
pub mod lifecycle;
pub mod strategy;
pub mod worker;

#[cfg(test)]
mod testing;

pub use background::BackgroundTasks;
pub use lifecycle::{Generation, InstallOutcome, Lifecycle};
pub use strategy::{Executor, Response, ResponseSource};
pub use worker::{CacheWorker, WorkerStatus};
