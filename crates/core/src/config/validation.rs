//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `max_bytes` is 0 or exceeds 50MB
    /// - `timeout_ms` is less than 100ms or exceeds 5 minutes
    /// - `user_agent` is empty
    /// - `origin` is not an http(s) URL
    /// - `navigation_fallback` or a reserved prefix is not an absolute path
    /// - a retention limit is zero
    /// - the route table is inconsistent
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_bytes == 0 {
            return Err(invalid("max_bytes", "must be greater than 0"));
        }
        if self.max_bytes > 50 * 1024 * 1024 {
            return Err(invalid("max_bytes", "must not exceed 50MB"));
        }

        if self.timeout_ms < 100 {
            return Err(invalid("timeout_ms", "must be at least 100ms"));
        }
        if self.timeout_ms > 300_000 {
            return Err(invalid("timeout_ms", "must not exceed 5 minutes (300000ms)"));
        }

        if self.user_agent.is_empty() {
            return Err(invalid("user_agent", "must not be empty"));
        }

        let origin = self.origin_url()?;
        if !matches!(origin.scheme(), "http" | "https") {
            return Err(invalid("origin", format!("unsupported scheme `{}`", origin.scheme())));
        }

        if !self.navigation_fallback.starts_with('/') {
            return Err(invalid("navigation_fallback", "must be an absolute path starting with '/'"));
        }
        if let Some(prefix) = self.reserved_prefixes.iter().find(|p| !p.starts_with('/')) {
            return Err(invalid("reserved_prefixes", format!("`{prefix}` must start with '/'")));
        }

        for (compartment, policy) in &self.retention {
            if policy.max_entries == Some(0) {
                return Err(invalid(format!("retention.{compartment}.max_entries"), "must be greater than 0"));
            }
            if policy.max_age_seconds == Some(0) {
                return Err(invalid(format!("retention.{compartment}.max_age_seconds"), "must be greater than 0"));
            }
        }

        let table = self.route_table();
        table.validate().map_err(|e| invalid("routes", e.to_string()))?;

        let written = table.runtime_compartments();
        for compartment in self.retention.keys() {
            if !written.contains(&compartment.as_str()) {
                tracing::warn!(compartment, "retention configured for a compartment no route writes to");
            }
        }

        Ok(())
    }
}
