//! Unified error types for gearcache.
//!
//! Every variant renders with a stable upper-case code prefix so that the
//! CLI and log consumers can match on it without parsing free text.

use tokio_rusqlite::rusqlite;

/// Unified error types for the caching layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters (e.g., an empty URL).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Invalid URL.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// Network fetch failed and no cached response could stand in.
    #[error("NETWORK_UNAVAILABLE: {0}")]
    NetworkUnavailable(String),

    /// Fetch response too large.
    #[error("FETCH_TOO_LARGE: {0}")]
    FetchTooLarge(String),

    /// The persistent medium rejected a write (quota exhausted).
    #[error("STORE_FULL: {0}")]
    StoreFull(String),

    /// A precache resource could not be fetched during install.
    #[error("MANIFEST_INCOMPLETE: {url}: {reason}")]
    ManifestIncomplete { url: String, reason: String },

    /// The manifest itself is malformed.
    #[error("INVALID_MANIFEST: {0}")]
    InvalidManifest(String),

    /// A single cache entry could not be deleted.
    #[error("EVICTION_FAILED: {compartment}/{key}: {reason}")]
    EvictionFailure { compartment: String, key: String, reason: String },

    /// Lifecycle operation not valid in the current state.
    #[error("INVALID_STATE: {0}")]
    InvalidState(String),

    /// Database operation failed.
    #[error("CACHE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("CACHE_ERROR: migration failed: {0}")]
    MigrationFailed(String),
}

impl Error {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "INVALID_INPUT",
            Error::InvalidUrl(_) => "INVALID_URL",
            Error::NetworkUnavailable(_) => "NETWORK_UNAVAILABLE",
            Error::FetchTooLarge(_) => "FETCH_TOO_LARGE",
            Error::StoreFull(_) => "STORE_FULL",
            Error::ManifestIncomplete { .. } => "MANIFEST_INCOMPLETE",
            Error::InvalidManifest(_) => "INVALID_MANIFEST",
            Error::EvictionFailure { .. } => "EVICTION_FAILED",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::Database(_) | Error::MigrationFailed(_) => "CACHE_ERROR",
        }
    }

    /// Whether the interception point can carry on after this error.
    ///
    /// Only a network failure with nothing cached is surfaced to a requester;
    /// store pressure and eviction failures degrade silently.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::StoreFull(_) | Error::EvictionFailure { .. })
    }
}

fn is_disk_full(err: &rusqlite::Error) -> bool {
    matches!(err.sqlite_error_code(), Some(rusqlite::ErrorCode::DiskFull))
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e.into(),
            other => Error::Database(other),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        if is_disk_full(&err) {
            return Error::StoreFull(err.to_string());
        }
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidInput(format!("malformed JSON: {err}"))
    }
}
