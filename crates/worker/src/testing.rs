//! In-process network for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gearcache_client::Network;
use gearcache_core::{AppConfig, Error, Payload};
use tokio::sync::Notify;
use url::Url;

pub(crate) const ORIGIN: &str = "https://gear.example";

pub(crate) fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub(crate) fn test_config() -> AppConfig {
    AppConfig { origin: ORIGIN.into(), ..Default::default() }
}

#[derive(Default)]
pub(crate) struct MockNetwork {
    responses: Mutex<HashMap<String, Payload>>,
    failing: Mutex<HashSet<String>>,
    offline: AtomicBool,
    calls: AtomicUsize,
    calls_by_url: Mutex<HashMap<String, usize>>,
    delay: Mutex<Option<Duration>>,
    started: Notify,
}

impl MockNetwork {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn respond(&self, path: &str, payload: Payload) {
        self.responses.lock().unwrap().insert(url(path).to_string(), payload);
    }

    pub(crate) fn respond_text(&self, path: &str, body: &str) {
        self.respond(path, Payload::new(200, body).with_header("content-type", "text/plain"));
    }

    pub(crate) fn fail(&self, path: &str) {
        self.failing.lock().unwrap().insert(url(path).to_string());
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn calls_for(&self, path: &str) -> usize {
        self.calls_by_url.lock().unwrap().get(url(path).as_str()).copied().unwrap_or(0)
    }

    /// Resolves once a fetch has begun.
    pub(crate) async fn fetch_started(&self) {
        self.started.notified().await;
    }
}

#[async_trait]
impl Network for MockNetwork {
    async fn fetch(&self, url: &Url) -> Result<Payload, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.calls_by_url.lock().unwrap().entry(url.to_string()).or_default() += 1;
        self.started.notify_one();

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::NetworkUnavailable(format!("{url}: offline")));
        }
        if self.failing.lock().unwrap().contains(url.as_str()) {
            return Err(Error::NetworkUnavailable(format!("{url}: connection reset")));
        }

        let response = self.responses.lock().unwrap().get(url.as_str()).cloned();
        Ok(response.unwrap_or_else(|| Payload::new(404, "not found")))
    }
}
