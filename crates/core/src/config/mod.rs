//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (GEARCACHE_*)
//! 2. TOML config file (if GEARCACHE_CONFIG_FILE set)
//! 3. Built-in defaults

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::expiration::RetentionPolicy;
use crate::routes::{RouteRule, RouteTable};

mod validation;

pub use validation::ConfigError;

/// When a freshly installed generation takes over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationPolicy {
    /// Activate as soon as the install completes.
    Immediate,
    /// Wait in `Waiting` until an explicit activation signal.
    #[default]
    Deferred,
}

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (GEARCACHE_*)
/// 2. TOML config file (if GEARCACHE_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the SQLite store.
    ///
    /// Set via GEARCACHE_DB_PATH environment variable.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Origin that relative request and manifest URLs resolve against.
    ///
    /// Set via GEARCACHE_ORIGIN environment variable.
    #[serde(default = "default_origin")]
    pub origin: String,

    /// User-Agent string for HTTP requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Network timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Largest response body accepted from the network.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Optional cap on the store size; writes beyond it fail with STORE_FULL.
    #[serde(default)]
    pub store_quota_bytes: Option<u64>,

    /// Precache manifest produced by the build.
    ///
    /// Set via GEARCACHE_MANIFEST_PATH environment variable.
    #[serde(default)]
    pub manifest_path: Option<PathBuf>,

    /// Application shell served for navigations.
    #[serde(default = "default_navigation_fallback")]
    pub navigation_fallback: String,

    /// Path prefixes never treated as application navigations.
    #[serde(default = "default_reserved_prefixes")]
    pub reserved_prefixes: Vec<String>,

    /// Whether new generations activate immediately or on request.
    #[serde(default)]
    pub activation: ActivationPolicy,

    /// Ordered route table.
    #[serde(default = "RouteTable::default_rules")]
    pub routes: Vec<RouteRule>,

    /// Retention policy per runtime compartment.
    #[serde(default = "default_retention")]
    pub retention: BTreeMap<String, RetentionPolicy>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./gearcache.sqlite")
}

fn default_origin() -> String {
    "http://localhost:3000".into()
}

fn default_user_agent() -> String {
    "gearcache/0.1".into()
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_max_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_navigation_fallback() -> String {
    "/index.html".into()
}

fn default_reserved_prefixes() -> Vec<String> {
    vec!["/_".into()]
}

const DAY: u64 = 24 * 60 * 60;

fn default_retention() -> BTreeMap<String, RetentionPolicy> {
    BTreeMap::from([
        ("images".to_string(), RetentionPolicy::new(60, 30 * DAY)),
        ("fonts".to_string(), RetentionPolicy::new(30, 365 * DAY)),
        ("static-resources".to_string(), RetentionPolicy::new(100, 7 * DAY)),
    ])
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            origin: default_origin(),
            user_agent: default_user_agent(),
            timeout_ms: default_timeout_ms(),
            max_bytes: default_max_bytes(),
            store_quota_bytes: None,
            manifest_path: None,
            navigation_fallback: default_navigation_fallback(),
            reserved_prefixes: default_reserved_prefixes(),
            activation: ActivationPolicy::default(),
            routes: RouteTable::default_rules(),
            retention: default_retention(),
        }
    }
}

impl AppConfig {
    /// Timeout as Duration for use with reqwest/tokio.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Parsed application origin.
    pub fn origin_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.origin)
            .map_err(|e| ConfigError::Invalid { field: "origin".into(), reason: e.to_string() })
    }

    /// The configured route table.
    pub fn route_table(&self) -> RouteTable {
        RouteTable::new(self.routes.clone(), self.reserved_prefixes.clone())
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `GEARCACHE_`
    /// 2. TOML file from `GEARCACHE_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var("GEARCACHE_CONFIG_FILE").ok().map(PathBuf::from);
        Self::load_from(file.as_deref())
    }

    /// Like [`AppConfig::load`] with an explicit TOML file taking the place
    /// of `GEARCACHE_CONFIG_FILE`.
    pub fn load_from(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(
            Env::prefixed("GEARCACHE_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Manifest path, required by the install command.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if no manifest path is configured.
    pub fn require_manifest_path(&self) -> Result<&Path, ConfigError> {
        self.manifest_path.as_deref().ok_or_else(|| ConfigError::Missing {
            field: "manifest_path".into(),
            hint: "Set GEARCACHE_MANIFEST_PATH or pass --manifest".into(),
        })
    }
}
