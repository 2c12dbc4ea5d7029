//! Network access for gearcache.
//!
//! This crate provides the HTTP fetch pipeline and the [`Network`] seam the
//! strategy executor talks to, so that tests can swap in an in-process
//! network.

pub mod fetch;
pub mod network;

pub use fetch::{FetchClient, FetchConfig, FetchResponse};
pub use network::Network;
