//! The network as seen by the caching layer.

use async_trait::async_trait;
use gearcache_core::{Error, Payload};
use url::Url;

/// Something that can fetch a complete response for a URL.
///
/// Any HTTP status is a successful fetch; only transport failures (offline,
/// timeout, refused connection) are errors, reported as
/// [`Error::NetworkUnavailable`].
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Payload, Error>;
}
