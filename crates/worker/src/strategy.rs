//! Strategy executor.
//!
//! Resolves one routed request against the store and the network. Store
//! trouble never fails a request: read errors fall through to the network and
//! write errors are logged after the response is already in hand.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::oneshot;
use url::Url;

use gearcache_client::Network;
use gearcache_core::cache::{CacheDb, CacheEntry, Payload, ResourceKey};
use gearcache_core::expiration::{RetentionPolicy, expire_compartment};
use gearcache_core::Error;

use crate::background::BackgroundTasks;

/// Where a response came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResponseSource {
    Precache { compartment: String },
    Cache { compartment: String },
    Network,
}

impl fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseSource::Precache { compartment } => write!(f, "precache:{compartment}"),
            ResponseSource::Cache { compartment } => write!(f, "cache:{compartment}"),
            ResponseSource::Network => f.write_str("network"),
        }
    }
}

/// A response delivered to the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub payload: Payload,
    pub source: ResponseSource,
}

impl Response {
    fn network(payload: Payload) -> Self {
        Self { payload, source: ResponseSource::Network }
    }

    fn cached(payload: Payload, compartment: &str) -> Self {
        Self { payload, source: ResponseSource::Cache { compartment: compartment.to_string() } }
    }
}

/// Only complete, plain successes are stored in runtime compartments.
fn is_storable(payload: &Payload) -> bool {
    payload.status == 200
}

/// Executes fetch strategies. Cheap to clone; clones share the store,
/// network and background task set.
#[derive(Clone)]
pub struct Executor {
    db: CacheDb,
    network: Arc<dyn Network>,
    retention: Arc<BTreeMap<String, RetentionPolicy>>,
    tasks: BackgroundTasks,
}

impl Executor {
    pub fn new(
        db: CacheDb, network: Arc<dyn Network>, retention: BTreeMap<String, RetentionPolicy>, tasks: BackgroundTasks,
    ) -> Self {
        Self { db, network, retention: Arc::new(retention), tasks }
    }

    /// Plain pass-through: fetch and return, never store.
    pub async fn network_only(&self, url: &Url) -> Result<Response, Error> {
        tracing::debug!(%url, "network pass-through");
        self.network.fetch(url).await.map(Response::network)
    }

    /// Serve `key` from a precache compartment without touching the network.
    ///
    /// Returns `None` when the entry is missing, which happens when the
    /// compartment is deleted by a generation swap mid-request.
    pub async fn precache_exact(&self, compartment: &str, key: &ResourceKey) -> Option<Response> {
        let entry = self.lookup(compartment, key).await?;
        tracing::debug!(compartment, url = key.url(), "precache hit");
        let source = ResponseSource::Precache { compartment: compartment.to_string() };
        Some(Response { payload: entry.payload, source })
    }

    /// Store first; the network is only consulted on a miss.
    pub async fn cache_first(&self, compartment: &str, key: &ResourceKey, url: &Url) -> Result<Response, Error> {
        if let Some(entry) = self.lookup(compartment, key).await {
            tracing::debug!(compartment, %url, "cache hit");
            if let Err(e) = self.db.touch_entry(compartment, key, Utc::now()).await {
                tracing::debug!(compartment, %url, error = %e, "failed to record access");
            }
            return Ok(Response::cached(entry.payload, compartment));
        }

        tracing::debug!(compartment, %url, "cache miss");
        self.fetch_and_store(compartment, key, url).await.map(Response::network)
    }

    /// Serve from the store immediately and refresh it in the background;
    /// on a miss the requester waits for the network.
    pub async fn stale_while_revalidate(
        &self, compartment: &str, key: &ResourceKey, url: &Url,
    ) -> Result<Response, Error> {
        if let Some(entry) = self.lookup(compartment, key).await {
            tracing::debug!(compartment, %url, "cache hit, revalidating");
            self.spawn_refresh(compartment, key, url);
            return Ok(Response::cached(entry.payload, compartment));
        }

        tracing::debug!(compartment, %url, "cache miss");
        self.fetch_and_store(compartment, key, url).await.map(Response::network)
    }

    /// Store read that fails open: errors are logged and reported as a miss.
    async fn lookup(&self, compartment: &str, key: &ResourceKey) -> Option<CacheEntry> {
        match self.db.get_entry(compartment, key).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(compartment, url = key.url(), error = %e, "store read failed, falling back to network");
                None
            }
        }
    }

    /// Fetch on behalf of a requester and cache the result.
    ///
    /// The fetch runs as a tracked task that reports back over a channel, so
    /// the store is still populated if the requester goes away.
    async fn fetch_and_store(&self, compartment: &str, key: &ResourceKey, url: &Url) -> Result<Payload, Error> {
        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        let compartment = compartment.to_string();
        let key = key.clone();
        let task_url = url.clone();

        self.tasks.spawn(async move {
            let result = this.network.fetch(&task_url).await;
            if let Ok(payload) = &result {
                this.store(&compartment, &key, payload).await;
            }
            if tx.send(result).is_err() {
                tracing::debug!(url = %task_url, "requester went away before the fetch completed");
            }
        });

        rx.await
            .map_err(|_| Error::NetworkUnavailable(format!("{url}: fetch task ended without a result")))?
    }

    fn spawn_refresh(&self, compartment: &str, key: &ResourceKey, url: &Url) {
        let this = self.clone();
        let compartment = compartment.to_string();
        let key = key.clone();
        let url = url.clone();

        self.tasks.spawn(async move {
            match this.network.fetch(&url).await {
                Ok(payload) => this.store(&compartment, &key, &payload).await,
                Err(e) => tracing::warn!(compartment, %url, error = %e, "background refresh failed"),
            }
        });
    }

    /// Opportunistic write. Failures are logged, never returned.
    async fn store(&self, compartment: &str, key: &ResourceKey, payload: &Payload) {
        if !is_storable(payload) {
            tracing::debug!(compartment, url = key.url(), status = payload.status, "not caching response");
            return;
        }

        let entry = CacheEntry::new(key.clone(), payload.clone(), Utc::now());
        match self.db.put_entry(compartment, &entry).await {
            Ok(()) => {
                tracing::debug!(compartment, url = key.url(), bytes = payload.body.len(), "cached response");
                self.schedule_expiration(compartment);
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(compartment, url = key.url(), error = %e, "cache write rejected");
            }
            Err(e) => {
                tracing::warn!(compartment, url = key.url(), error = %e, "cache write failed");
            }
        }
    }

    fn schedule_expiration(&self, compartment: &str) {
        let Some(policy) = self.retention.get(compartment).copied() else {
            return;
        };
        let db = self.db.clone();
        let compartment = compartment.to_string();

        self.tasks.spawn(async move {
            if let Err(e) = expire_compartment(&db, &compartment, &policy, Utc::now()).await {
                tracing::warn!(compartment, error = %e, "expiration pass failed");
            }
        });
    }
}
