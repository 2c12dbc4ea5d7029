//! Resource identity used as the store lookup key.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::url::{UrlError, canonicalize};

/// Canonical identity of a requested resource.
///
/// Built once from a normalized URL plus the navigation flag and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    url: String,
    navigation: bool,
}

impl ResourceKey {
    /// Key for a subresource (script, image, precached document...).
    pub fn new(url: &Url) -> Self {
        Self::with_variance(url, false)
    }

    /// Key carrying an explicit navigation flag.
    pub fn with_variance(url: &Url, navigation: bool) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self { url: url.to_string(), navigation }
    }

    /// Parse and canonicalize an absolute URL string into a key.
    pub fn parse(input: &str, navigation: bool) -> Result<Self, UrlError> {
        let url = canonicalize(input)?;
        Ok(Self { url: url.to_string(), navigation })
    }

    pub(crate) fn from_parts(url: String, navigation: bool) -> Self {
        Self { url, navigation }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_navigation(&self) -> bool {
        self.navigation
    }

    /// Content-addressed hash of this key.
    pub fn hash(&self) -> String {
        compute_key_hash(&self.url, self.navigation)
    }
}

/// Compute the SHA-256 hex digest identifying a cached resource.
pub fn compute_key_hash(url: &str, navigation: bool) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(b"\n");
    hasher.update(if navigation { b"navigate".as_slice() } else { b"subresource".as_slice() });
    hex::encode(hasher.finalize())
}
