//! The interception point.
//!
//! [`CacheWorker`] is built once per process and shared by every request
//! task. `handle` may run concurrently for independent requests; all shared
//! state lives behind the store and the lifecycle's generation slots.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use url::Url;

use gearcache_client::{FetchClient, FetchConfig, Network};
use gearcache_core::cache::{CacheDb, CompartmentStats, ResourceKey};
use gearcache_core::expiration::{ExpirationReport, RetentionPolicy, expire_compartment};
use gearcache_core::manifest::Manifest;
use gearcache_core::request::Request;
use gearcache_core::routes::{RouteTable, StrategyKind};
use gearcache_core::url::resolve;
use gearcache_core::{AppConfig, Error};

use crate::background::BackgroundTasks;
use crate::lifecycle::{Generation, InstallOutcome, Lifecycle};
use crate::strategy::{Executor, Response};

/// Snapshot of the worker's generations and compartments.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub active: Option<String>,
    pub waiting: Option<String>,
    pub compartments: Vec<CompartmentStats>,
}

/// Request interception and caching engine.
pub struct CacheWorker {
    db: CacheDb,
    origin: Url,
    routes: RouteTable,
    retention: BTreeMap<String, RetentionPolicy>,
    executor: Executor,
    lifecycle: Lifecycle,
    tasks: BackgroundTasks,
}

impl CacheWorker {
    /// Assemble a worker over an open store and a network.
    ///
    /// No generation is loaded; call [`CacheWorker::restore`] to pick up
    /// persisted state.
    pub fn new(db: CacheDb, network: Arc<dyn Network>, config: &AppConfig) -> Result<Self, Error> {
        let origin = config.origin_url().map_err(|e| Error::InvalidInput(e.to_string()))?;
        let fallback = resolve(&origin, &config.navigation_fallback)?;

        let routes = config.route_table();
        routes.validate().map_err(|e| Error::InvalidInput(format!("route table: {e}")))?;

        let tasks = BackgroundTasks::new();
        let executor = Executor::new(db.clone(), Arc::clone(&network), config.retention.clone(), tasks.clone());
        let lifecycle = Lifecycle::new(db.clone(), network, origin.clone(), fallback, config.activation);

        Ok(Self { db, origin, routes, retention: config.retention.clone(), executor, lifecycle, tasks })
    }

    /// Open the configured store, connect the HTTP client and restore
    /// persisted generations.
    pub async fn open(config: &AppConfig) -> Result<Self, Error> {
        let db = match config.store_quota_bytes {
            Some(quota) => CacheDb::open_with_quota(&config.db_path, quota).await?,
            None => CacheDb::open(&config.db_path).await?,
        };
        let network: Arc<dyn Network> = Arc::new(FetchClient::new(FetchConfig::from(config))?);

        let worker = Self::new(db, network, config)?;
        worker.restore().await?;
        Ok(worker)
    }

    pub async fn restore(&self) -> Result<(), Error> {
        self.lifecycle.restore().await
    }

    pub fn db(&self) -> &CacheDb {
        &self.db
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Resolve a path or URL against the application origin.
    pub fn resolve(&self, input: &str) -> Result<Url, Error> {
        Ok(resolve(&self.origin, input)?)
    }

    /// Produce a response for one intercepted request.
    ///
    /// Only a network failure with nothing cached is returned as an error.
    pub async fn handle(&self, request: &Request) -> Result<Response, Error> {
        let url = &request.url;

        if !request.is_cacheable_method() {
            return self.executor.network_only(url).await;
        }

        let Some(generation) = self.lifecycle.active() else {
            tracing::debug!(%url, "no active generation, passing through");
            return self.executor.network_only(url).await;
        };

        if let Some(key) = generation.precache_key(url) {
            if let Some(response) = self.executor.precache_exact(generation.compartment(), &key).await {
                return Ok(response);
            }
            tracing::warn!(%url, generation = generation.id(), "precached resource missing, falling back to network");
            return self.executor.network_only(url).await;
        }

        let Some(rule) = self.routes.find(request) else {
            tracing::debug!(%url, destination = %request.destination, "no route matched");
            return self.executor.network_only(url).await;
        };
        tracing::debug!(%url, rule = %rule.name, strategy = ?rule.strategy, "routed");

        let key = ResourceKey::with_variance(url, request.navigate);
        match (rule.strategy, rule.compartment.as_deref()) {
            (StrategyKind::CacheFirst, Some(compartment)) => self.executor.cache_first(compartment, &key, url).await,
            (StrategyKind::StaleWhileRevalidate, Some(compartment)) => {
                self.executor.stale_while_revalidate(compartment, &key, url).await
            }
            (StrategyKind::NavigationFallback, _) => self.navigation_fallback(&generation, url).await,
            _ => self.executor.network_only(url).await,
        }
    }

    /// Serve the application shell from the active generation.
    async fn navigation_fallback(&self, generation: &Generation, url: &Url) -> Result<Response, Error> {
        let shell = ResourceKey::new(self.lifecycle.fallback());
        if let Some(response) = self.executor.precache_exact(generation.compartment(), &shell).await {
            tracing::debug!(%url, shell = shell.url(), "navigation served from shell");
            return Ok(response);
        }
        tracing::warn!(%url, generation = generation.id(), "application shell missing, falling back to network");
        self.executor.network_only(url).await
    }

    /// Install a manifest as the next generation.
    pub async fn install(&self, manifest: Manifest) -> Result<InstallOutcome, Error> {
        self.lifecycle.install(manifest).await
    }

    /// Activate the waiting generation, returning its id.
    pub async fn activate_waiting(&self) -> Result<String, Error> {
        self.lifecycle.activate_waiting().await
    }

    pub fn active_generation(&self) -> Option<String> {
        self.lifecycle.active().map(|g| g.id().to_string())
    }

    pub fn waiting_generation(&self) -> Option<String> {
        self.lifecycle.waiting().map(|g| g.id().to_string())
    }

    /// Run an expiration pass over every compartment with a retention policy.
    pub async fn expire_all(&self) -> Result<Vec<ExpirationReport>, Error> {
        let now = Utc::now();
        let mut reports = Vec::with_capacity(self.retention.len());
        for (compartment, policy) in &self.retention {
            reports.push(expire_compartment(&self.db, compartment, policy, now).await?);
        }
        Ok(reports)
    }

    pub async fn status(&self) -> Result<WorkerStatus, Error> {
        Ok(WorkerStatus {
            active: self.active_generation(),
            waiting: self.waiting_generation(),
            compartments: self.db.compartment_stats().await?,
        })
    }

    /// Wait for background refreshes, cache writes and expiration passes.
    pub async fn settle(&self) {
        self.tasks.settle().await;
    }
}
