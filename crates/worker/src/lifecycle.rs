//! Precache generation lifecycle.
//!
//! A generation moves `Installing -> Waiting -> Activating -> Active` and
//! ends `Redundant` once superseded. Installation is all-or-nothing: the new
//! precache compartment only becomes visible to requests after every manifest
//! resource is stored. States are persisted so a restart resumes where the
//! previous process stopped.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::Serialize;
use url::Url;

use gearcache_client::Network;
use gearcache_core::cache::{CacheDb, CacheEntry, GenerationRecord, GenerationState, ResourceKey};
use gearcache_core::config::ActivationPolicy;
use gearcache_core::manifest::{Manifest, is_precache_compartment};
use gearcache_core::url::resolve;
use gearcache_core::Error;

/// Query parameters that never change which precached resource is meant.
fn is_tracking_param(name: &str) -> bool {
    name.starts_with("utm_") || name == "fbclid"
}

fn strip_tracking_params(url: &Url) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !is_tracking_param(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    let mut stripped = url.clone();
    if kept.is_empty() {
        stripped.set_query(None);
    } else {
        stripped.query_pairs_mut().clear().extend_pairs(kept);
    }
    stripped
}

/// An installed manifest resolved against the application origin.
#[derive(Debug, Clone)]
pub struct Generation {
    id: String,
    compartment: String,
    manifest: Manifest,
    resources: Vec<(Url, String)>,
    index: HashMap<String, usize>,
}

impl Generation {
    pub fn new(manifest: Manifest, origin: &Url) -> Result<Self, Error> {
        let mut resources = Vec::with_capacity(manifest.len());
        let mut index = HashMap::with_capacity(manifest.len());

        for entry in manifest.entries() {
            let url = resolve(origin, &entry.url)
                .map_err(|e| Error::InvalidManifest(format!("bad resource {}: {e}", entry.url)))?;
            if index.insert(url.to_string(), resources.len()).is_some() {
                return Err(Error::InvalidManifest(format!("{} is listed twice", url)));
            }
            resources.push((url, entry.revision.clone()));
        }

        Ok(Self { id: manifest.generation(), compartment: manifest.compartment_name(), manifest, resources, index })
    }

    /// Rebuild a generation from its persisted record.
    pub fn from_record(record: &GenerationRecord, origin: &Url) -> Result<Self, Error> {
        let manifest = Manifest::from_json(&record.manifest_json)?;
        let generation = Self::new(manifest, origin)?;
        if generation.id != record.id {
            return Err(Error::InvalidState(format!(
                "generation record {} holds the manifest of {}",
                record.id, generation.id
            )));
        }
        Ok(generation)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn compartment(&self) -> &str {
        &self.compartment
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Resolved resource URLs with their revisions, in manifest order.
    pub fn resources(&self) -> impl Iterator<Item = (&Url, &str)> {
        self.resources.iter().map(|(url, revision)| (url, revision.as_str()))
    }

    pub fn revision_of(&self, url: &Url) -> Option<&str> {
        self.index.get(url.as_str()).map(|&i| self.resources[i].1.as_str())
    }

    pub fn contains(&self, url: &Url) -> bool {
        self.index.contains_key(url.as_str())
    }

    /// Store key of the precached resource a request URL refers to.
    ///
    /// Tries the URL as is, then without tracking parameters, then a
    /// directory URL as its `index.html`.
    pub fn precache_key(&self, url: &Url) -> Option<ResourceKey> {
        let mut url = url.clone();
        url.set_fragment(None);
        if self.contains(&url) {
            return Some(ResourceKey::new(&url));
        }

        let stripped = strip_tracking_params(&url);
        if self.contains(&stripped) {
            return Some(ResourceKey::new(&stripped));
        }

        if stripped.path().ends_with('/') {
            let index = stripped.join("index.html").ok()?;
            if self.contains(&index) {
                return Some(ResourceKey::new(&index));
            }
        }

        None
    }
}

/// Result of [`Lifecycle::install`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "generation", rename_all = "lowercase")]
pub enum InstallOutcome {
    /// Installed and now serving.
    Activated(String),
    /// Installed, waiting for the activation signal.
    Waiting(String),
    /// The manifest describes the generation already active.
    Unchanged(String),
}

impl InstallOutcome {
    pub fn generation(&self) -> &str {
        match self {
            InstallOutcome::Activated(id) | InstallOutcome::Waiting(id) | InstallOutcome::Unchanged(id) => id,
        }
    }
}

impl fmt::Display for InstallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallOutcome::Activated(id) => write!(f, "activated {id}"),
            InstallOutcome::Waiting(id) => write!(f, "waiting {id}"),
            InstallOutcome::Unchanged(id) => write!(f, "unchanged {id}"),
        }
    }
}

#[derive(Debug, Default)]
struct Slots {
    active: Option<Arc<Generation>>,
    waiting: Option<Arc<Generation>>,
}

/// Owns the active and waiting generations.
pub struct Lifecycle {
    db: CacheDb,
    network: Arc<dyn Network>,
    origin: Url,
    fallback: Url,
    activation: ActivationPolicy,
    slots: Mutex<Slots>,
    install_lock: tokio::sync::Mutex<()>,
}

impl Lifecycle {
    pub fn new(
        db: CacheDb, network: Arc<dyn Network>, origin: Url, fallback: Url, activation: ActivationPolicy,
    ) -> Self {
        Self {
            db,
            network,
            origin,
            fallback,
            activation,
            slots: Mutex::new(Slots::default()),
            install_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The generation currently serving requests.
    pub fn active(&self) -> Option<Arc<Generation>> {
        self.slots().active.clone()
    }

    pub fn waiting(&self) -> Option<Arc<Generation>> {
        self.slots().waiting.clone()
    }

    /// URL of the application shell served for navigations.
    pub fn fallback(&self) -> &Url {
        &self.fallback
    }

    /// Reload persisted generations after a restart.
    ///
    /// Generations left `Installing` by a crash are discarded with their
    /// partial compartment. One left `Activating` had finished installing and
    /// is activated now. Precache compartments belonging to neither the
    /// active nor the waiting generation are deleted, which also finishes a
    /// swap cut short between commit and cleanup.
    pub async fn restore(&self) -> Result<(), Error> {
        let _guard = self.install_lock.lock().await;

        for record in self.db.generations_in_state(GenerationState::Installing).await? {
            tracing::warn!(generation = %record.id, "discarding interrupted install");
            self.db.delete_compartment(&record.compartment).await?;
            self.db.delete_generation(&record.id).await?;
        }

        if let Some(record) = self.db.generations_in_state(GenerationState::Activating).await?.into_iter().next() {
            let generation = Generation::from_record(&record, &self.origin)?;
            tracing::info!(generation = %record.id, "completing interrupted activation");
            self.activate(Arc::new(generation)).await?;
        }

        let active = self.load_state(GenerationState::Active).await?;
        let waiting = self.load_state(GenerationState::Waiting).await?;

        tracing::info!(
            active = active.as_ref().map(|g| g.id()),
            waiting = waiting.as_ref().map(|g| g.id()),
            "restored generations"
        );

        let keep: Vec<String> = active.iter().chain(waiting.iter()).map(|g| g.compartment().to_string()).collect();
        {
            let mut slots = self.slots();
            slots.active = active;
            slots.waiting = waiting;
        }

        let keep: Vec<&str> = keep.iter().map(String::as_str).collect();
        self.drop_stale_compartments(&keep).await;
        Ok(())
    }

    async fn load_state(&self, state: GenerationState) -> Result<Option<Arc<Generation>>, Error> {
        let Some(record) = self.db.generations_in_state(state).await?.into_iter().next() else {
            return Ok(None);
        };
        if !self.db.has_compartment(&record.compartment).await? {
            tracing::warn!(generation = %record.id, %state, "precache compartment missing, ignoring generation");
            self.db.set_generation_state(&record.id, GenerationState::Redundant).await?;
            return Ok(None);
        }
        Ok(Some(Arc::new(Generation::from_record(&record, &self.origin)?)))
    }

    /// Install a manifest as a new generation.
    ///
    /// Every resource is fetched (or copied from the active generation when
    /// its revision is unchanged) into a fresh precache compartment. Any
    /// failure discards the compartment and leaves the active generation
    /// untouched.
    pub async fn install(&self, manifest: Manifest) -> Result<InstallOutcome, Error> {
        let _guard = self.install_lock.lock().await;

        let generation = Generation::new(manifest, &self.origin)?;
        if !generation.contains(&self.fallback) {
            return Err(Error::InvalidManifest(format!("navigation fallback {} is not precached", self.fallback)));
        }

        let (active, waiting) = {
            let slots = self.slots();
            (slots.active.clone(), slots.waiting.clone())
        };

        if active.as_ref().is_some_and(|a| a.id() == generation.id()) {
            tracing::info!(generation = generation.id(), "generation already active");
            return Ok(InstallOutcome::Unchanged(generation.id().to_string()));
        }
        if let Some(waiting) = waiting.as_ref().filter(|w| w.id() == generation.id()) {
            return self.settle_installed(Arc::clone(waiting), active.is_none()).await;
        }

        tracing::info!(generation = generation.id(), resources = generation.manifest().len(), "installing");

        let now = Utc::now();
        let mut record = GenerationRecord {
            id: generation.id().to_string(),
            compartment: generation.compartment().to_string(),
            manifest_json: generation.manifest().to_json()?,
            state: GenerationState::Installing,
            installed_at: now,
            activated_at: None,
        };
        self.db.delete_compartment(generation.compartment()).await?;
        self.db.record_generation(&record).await?;

        if let Err(e) = self.populate(&generation, active.as_deref()).await {
            tracing::warn!(generation = generation.id(), error = %e, "install aborted");
            self.discard(&generation).await;
            return Err(e);
        }

        record.state = GenerationState::Waiting;
        self.db.record_generation(&record).await?;
        tracing::info!(generation = generation.id(), "installed");

        if let Some(previous) = waiting {
            tracing::info!(generation = previous.id(), replaced_by = generation.id(), "replacing waiting generation");
            self.db.set_generation_state(previous.id(), GenerationState::Redundant).await?;
            if let Err(e) = self.db.delete_compartment(previous.compartment()).await {
                tracing::warn!(generation = previous.id(), error = %e, "failed to delete replaced compartment");
            }
        }

        let generation = Arc::new(generation);
        self.slots().waiting = Some(Arc::clone(&generation));

        self.settle_installed(generation, active.is_none()).await
    }

    /// Activate right away or leave waiting, per policy.
    async fn settle_installed(&self, generation: Arc<Generation>, nothing_active: bool) -> Result<InstallOutcome, Error> {
        if nothing_active || self.activation == ActivationPolicy::Immediate {
            let id = generation.id().to_string();
            self.activate(generation).await?;
            Ok(InstallOutcome::Activated(id))
        } else {
            tracing::info!(generation = generation.id(), "waiting for activation");
            Ok(InstallOutcome::Waiting(generation.id().to_string()))
        }
    }

    async fn populate(&self, generation: &Generation, active: Option<&Generation>) -> Result<(), Error> {
        for (url, revision) in generation.resources() {
            let key = ResourceKey::new(url);

            if let Some(active) = active.filter(|a| a.revision_of(url) == Some(revision)) {
                match self.db.get_entry(active.compartment(), &key).await {
                    Ok(Some(existing)) => {
                        let entry = CacheEntry::new(key, existing.payload, Utc::now());
                        self.db.put_entry(generation.compartment(), &entry).await?;
                        tracing::debug!(%url, revision, "reused unchanged resource");
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => tracing::debug!(%url, error = %e, "could not reuse resource, refetching"),
                }
            }

            let payload = self
                .network
                .fetch(url)
                .await
                .map_err(|e| Error::ManifestIncomplete { url: url.to_string(), reason: e.to_string() })?;
            if !payload.is_success() {
                return Err(Error::ManifestIncomplete {
                    url: url.to_string(),
                    reason: format!("status {}", payload.status),
                });
            }

            let entry = CacheEntry::new(key, payload, Utc::now());
            self.db.put_entry(generation.compartment(), &entry).await?;
            tracing::debug!(%url, revision, "precached");
        }
        Ok(())
    }

    /// Drop a failed install. Best effort; leftovers are also cleaned up by
    /// the next restore.
    async fn discard(&self, generation: &Generation) {
        if let Err(e) = self.db.delete_compartment(generation.compartment()).await {
            tracing::warn!(generation = generation.id(), error = %e, "failed to delete partial compartment");
        }
        if let Err(e) = self.db.delete_generation(generation.id()).await {
            tracing::warn!(generation = generation.id(), error = %e, "failed to delete generation record");
        }
    }

    /// External activation signal for the waiting generation.
    pub async fn activate_waiting(&self) -> Result<String, Error> {
        let _guard = self.install_lock.lock().await;

        let Some(generation) = self.waiting() else {
            return Err(Error::InvalidState("no generation is waiting".into()));
        };
        let id = generation.id().to_string();
        self.activate(generation).await?;
        Ok(id)
    }

    /// Make `generation` active and drop every other precache compartment.
    ///
    /// The in-memory swap happens before deletion; a request still reading
    /// an old compartment sees a miss and goes to the network.
    async fn activate(&self, generation: Arc<Generation>) -> Result<(), Error> {
        self.db.set_generation_state(generation.id(), GenerationState::Activating).await?;
        self.db.activate_generation(generation.id(), Utc::now()).await?;

        let previous = {
            let mut slots = self.slots();
            slots.waiting = None;
            slots.active.replace(Arc::clone(&generation))
        };

        tracing::info!(
            generation = generation.id(),
            previous = previous.as_ref().map(|g| g.id()),
            "activated"
        );

        self.drop_stale_compartments(&[generation.compartment()]).await;
        Ok(())
    }

    /// Delete every precache compartment not named in `keep`, then forget
    /// redundant generations whose compartment is gone.
    ///
    /// Runs after the swap is committed, so failures are logged and left for
    /// the next restore.
    async fn drop_stale_compartments(&self, keep: &[&str]) {
        let names = match self.db.compartment_names().await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(error = %e, "could not list compartments, stale precache left in place");
                return;
            }
        };

        for name in names {
            if !is_precache_compartment(&name) || keep.contains(&name.as_str()) {
                continue;
            }
            match self.db.delete_compartment(&name).await {
                Ok(_) => tracing::info!(compartment = %name, "deleted stale precache compartment"),
                Err(e) => tracing::warn!(compartment = %name, error = %e, "failed to delete stale precache compartment"),
            }
        }

        match self.db.prune_redundant_generations().await {
            Ok(0) => {}
            Ok(pruned) => tracing::debug!(pruned, "pruned redundant generation records"),
            Err(e) => tracing::warn!(error = %e, "failed to prune redundant generation records"),
        }
    }
}
