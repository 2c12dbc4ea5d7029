//! Build-time precache manifest.
//!
//! A manifest lists every resource that must be available offline for one
//! build, each with the content hash the bundler computed for it. The hash of
//! all those hashes names the precache generation.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Error;

/// Name prefix reserved for precache compartments.
pub const PRECACHE_PREFIX: &str = "precache-";

/// Whether a compartment name belongs to the precache namespace.
pub fn is_precache_compartment(name: &str) -> bool {
    name.starts_with(PRECACHE_PREFIX)
}

/// One precached resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Absolute path (`/app.9f3.js`) or URL of the resource.
    #[serde(alias = "resourceId")]
    pub url: String,
    /// Content hash produced by the build.
    #[serde(alias = "contentHash")]
    pub revision: String,
}

impl ManifestEntry {
    pub fn new(url: impl Into<String>, revision: impl Into<String>) -> Self {
        Self { url: url.into(), revision: revision.into() }
    }
}

/// The immutable list of precached resources for one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Build and validate a manifest.
    pub fn new(entries: Vec<ManifestEntry>) -> Result<Self, Error> {
        let manifest = Self { entries };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse a JSON array of `{ "url", "revision" }` objects.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let manifest: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidManifest(format!("malformed manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidManifest(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entries.iter().any(|e| e.url == url)
    }

    /// Reject manifests that cannot define a usable generation.
    pub fn validate(&self) -> Result<(), Error> {
        if self.entries.is_empty() {
            return Err(Error::InvalidManifest("manifest has no entries".into()));
        }

        let mut seen = HashSet::with_capacity(self.entries.len());
        for entry in &self.entries {
            if entry.url.trim().is_empty() {
                return Err(Error::InvalidManifest("entry with empty url".into()));
            }
            if entry.revision.trim().is_empty() {
                return Err(Error::InvalidManifest(format!("entry {} has an empty revision", entry.url)));
            }
            if !seen.insert(entry.url.as_str()) {
                return Err(Error::InvalidManifest(format!("duplicate entry {}", entry.url)));
            }
        }

        Ok(())
    }

    /// Generation identifier: hash of the URL-sorted entry hashes.
    ///
    /// Independent of entry order in the source file.
    pub fn generation(&self) -> String {
        let mut sorted: Vec<&ManifestEntry> = self.entries.iter().collect();
        sorted.sort_by(|a, b| a.url.cmp(&b.url));

        let mut hasher = Sha256::new();
        for entry in sorted {
            hasher.update(entry.url.as_bytes());
            hasher.update(b"\n");
            hasher.update(entry.revision.as_bytes());
            hasher.update(b"\n");
        }
        let digest = hex::encode(hasher.finalize());
        digest[..16].to_string()
    }

    /// Name of the precache compartment for this generation.
    pub fn compartment_name(&self) -> String {
        format!("{PRECACHE_PREFIX}{}", self.generation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        Manifest::new(vec![ManifestEntry::new("/app.9f3.js", "h1"), ManifestEntry::new("/index.html", "h2")]).unwrap()
    }

    #[test]
    fn test_generation_is_stable_and_order_independent() {
        let reordered =
            Manifest::new(vec![ManifestEntry::new("/index.html", "h2"), ManifestEntry::new("/app.9f3.js", "h1")])
                .unwrap();
        assert_eq!(sample().generation(), reordered.generation());
        assert_eq!(sample().generation().len(), 16);
    }

    #[test]
    fn test_generation_changes_with_revision() {
        let changed =
            Manifest::new(vec![ManifestEntry::new("/app.9f3.js", "h1"), ManifestEntry::new("/index.html", "h3")])
                .unwrap();
        assert_ne!(sample().generation(), changed.generation());
    }

    #[test]
    fn test_compartment_name() {
        let m = sample();
        assert_eq!(m.compartment_name(), format!("precache-{}", m.generation()));
        assert!(is_precache_compartment(&m.compartment_name()));
        assert!(!is_precache_compartment("images"));
    }

    #[test]
    fn test_from_json_accepts_both_field_spellings() {
        let m = Manifest::from_json(
            r#"[{"url": "/app.9f3.js", "revision": "h1"}, {"resourceId": "/index.html", "contentHash": "h2"}]"#,
        )
        .unwrap();
        assert_eq!(m, sample());
    }

    #[test]
    fn test_rejects_empty_manifest() {
        assert!(matches!(Manifest::from_json("[]"), Err(Error::InvalidManifest(_))));
    }

    #[test]
    fn test_rejects_duplicates() {
        let result = Manifest::new(vec![ManifestEntry::new("/a.js", "1"), ManifestEntry::new("/a.js", "2")]);
        assert!(matches!(result, Err(Error::InvalidManifest(msg)) if msg.contains("duplicate")));
    }

    #[test]
    fn test_rejects_empty_revision() {
        let result = Manifest::new(vec![ManifestEntry::new("/a.js", " ")]);
        assert!(matches!(result, Err(Error::InvalidManifest(_))));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(Manifest::from_json("{not json"), Err(Error::InvalidManifest(_))));
    }

    #[test]
    fn test_json_round_trip_preserves_order() {
        let m = sample();
        let again = Manifest::from_json(&m.to_json().unwrap()).unwrap();
        assert_eq!(again.entries()[0].url, "/app.9f3.js");
        assert!(again.contains("/index.html"));
    }
}
