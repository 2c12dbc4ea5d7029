//! Cache entry CRUD operations.
//!
//! Entries live inside named compartments. A compartment row is created
//! lazily by the first `put_entry` that targets it.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;

use super::connection::CacheDb;
use super::key::ResourceKey;
use crate::Error;

/// A complete response: status, headers and body bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub status: u16,
    /// Header names are stored lower-cased.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Payload {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self { status, headers: BTreeMap::new(), body: body.into() }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A stored response together with its bookkeeping timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: ResourceKey,
    pub payload: Payload,
    pub inserted_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl CacheEntry {
    /// A fresh entry stamped with `now` for both timestamps.
    pub fn new(key: ResourceKey, payload: Payload, now: DateTime<Utc>) -> Self {
        Self { key, payload, inserted_at: now, last_accessed_at: now }
    }
}

/// Entry metadata without the payload, used by eviction scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    pub key_hash: String,
    pub url: String,
    pub inserted_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

/// Fixed-width RFC 3339 so that lexical order in SQL equals time order.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

impl CacheDb {
    /// Insert or replace an entry.
    ///
    /// Creates the compartment if it does not exist yet. The compartment row
    /// and the entry are written in one transaction, so readers never see a
    /// partially written entry.
    pub async fn put_entry(&self, compartment: &str, entry: &CacheEntry) -> Result<(), Error> {
        let compartment = compartment.to_string();
        let key_hash = entry.key.hash();
        let url = entry.key.url().to_string();
        let navigation = entry.key.is_navigation();
        let status = entry.payload.status;
        let headers_json = serde_json::to_string(&entry.payload.headers)?;
        let body = entry.payload.body.clone();
        let inserted_at = format_ts(entry.inserted_at);
        let last_accessed_at = format_ts(entry.last_accessed_at);

        self.conn
            .call(move |conn| -> Result<(), Error> {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT OR IGNORE INTO compartments (name, created_at) VALUES (?1, ?2)",
                    params![&compartment, &inserted_at],
                )?;
                tx.execute(
                    "INSERT INTO entries (
                    compartment, key_hash, url, navigation, status, headers_json, body,
                    inserted_at, last_accessed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(compartment, key_hash) DO UPDATE SET
                    url = excluded.url,
                    navigation = excluded.navigation,
                    status = excluded.status,
                    headers_json = excluded.headers_json,
                    body = excluded.body,
                    inserted_at = excluded.inserted_at,
                    last_accessed_at = excluded.last_accessed_at",
                    params![
                        &compartment,
                        &key_hash,
                        &url,
                        navigation as i32,
                        status as i64,
                        &headers_json,
                        &body,
                        &inserted_at,
                        &last_accessed_at,
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Get an entry by key.
    ///
    /// Returns None on a miss, including when the compartment does not exist.
    pub async fn get_entry(&self, compartment: &str, key: &ResourceKey) -> Result<Option<CacheEntry>, Error> {
        let compartment = compartment.to_string();
        let key = key.clone();
        self.conn
            .call(move |conn| -> Result<Option<CacheEntry>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT status, headers_json, body, inserted_at, last_accessed_at
                FROM entries WHERE compartment = ?1 AND key_hash = ?2",
                )?;

                let result = stmt.query_row(params![compartment, key.hash()], |row| {
                    let status: i64 = row.get(0)?;
                    let headers_json: String = row.get(1)?;
                    let body: Vec<u8> = row.get(2)?;
                    let inserted_at: String = row.get(3)?;
                    let last_accessed_at: String = row.get(4)?;
                    Ok((status, headers_json, body, inserted_at, last_accessed_at))
                });

                let (status, headers_json, body, inserted_at, last_accessed_at) = match result {
                    Ok(row) => row,
                    Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
                    Err(e) => return Err(e.into()),
                };

                let headers: BTreeMap<String, String> = serde_json::from_str(&headers_json)?;
                Ok(Some(CacheEntry {
                    key,
                    payload: Payload { status: status as u16, headers, body },
                    inserted_at: parse_ts(&inserted_at)?,
                    last_accessed_at: parse_ts(&last_accessed_at)?,
                }))
            })
            .await
            .map_err(Error::from)
    }

    /// Record an access to an entry.
    ///
    /// Returns false if the entry is gone (e.g. evicted concurrently).
    pub async fn touch_entry(&self, compartment: &str, key: &ResourceKey, at: DateTime<Utc>) -> Result<bool, Error> {
        let compartment = compartment.to_string();
        let key_hash = key.hash();
        let at = format_ts(at);
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let updated = conn.execute(
                    "UPDATE entries SET last_accessed_at = ?3 WHERE compartment = ?1 AND key_hash = ?2",
                    params![compartment, key_hash, at],
                )?;
                Ok(updated > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete an entry by key.
    ///
    /// Returns false if nothing was deleted.
    pub async fn delete_entry(&self, compartment: &str, key: &ResourceKey) -> Result<bool, Error> {
        let compartment = compartment.to_string();
        let key_hash = key.hash();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let deleted = conn.execute(
                    "DELETE FROM entries WHERE compartment = ?1 AND key_hash = ?2",
                    params![compartment, key_hash],
                )?;
                Ok(deleted > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete the entry described by `meta`, but only if it has not been
    /// rewritten since the metadata was read.
    ///
    /// Returns false when the entry is gone or was replaced in the meantime.
    pub async fn evict_entry(&self, compartment: &str, meta: &EntryMeta) -> Result<bool, Error> {
        let compartment = compartment.to_string();
        let key_hash = meta.key_hash.clone();
        let inserted_at = format_ts(meta.inserted_at);
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let deleted = conn.execute(
                    "DELETE FROM entries WHERE compartment = ?1 AND key_hash = ?2 AND inserted_at = ?3",
                    params![compartment, key_hash, inserted_at],
                )?;
                Ok(deleted > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// Snapshot of the keys in a compartment, ordered by URL.
    pub async fn entry_keys(&self, compartment: &str) -> Result<Vec<ResourceKey>, Error> {
        let compartment = compartment.to_string();
        self.conn
            .call(move |conn| -> Result<Vec<ResourceKey>, Error> {
                let mut stmt =
                    conn.prepare("SELECT url, navigation FROM entries WHERE compartment = ?1 ORDER BY url, navigation")?;
                let keys = stmt
                    .query_map(params![compartment], |row| {
                        Ok(ResourceKey::from_parts(row.get(0)?, row.get::<_, i32>(1)? == 1))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(keys)
            })
            .await
            .map_err(Error::from)
    }

    /// Metadata for every entry of a compartment, least recently accessed first.
    pub async fn entry_meta(&self, compartment: &str) -> Result<Vec<EntryMeta>, Error> {
        let compartment = compartment.to_string();
        self.conn
            .call(move |conn| -> Result<Vec<EntryMeta>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT key_hash, url, inserted_at, last_accessed_at
                FROM entries WHERE compartment = ?1
                ORDER BY last_accessed_at ASC, inserted_at ASC, key_hash ASC",
                )?;
                let meta = stmt
                    .query_map(params![compartment], |row| {
                        let inserted_at: String = row.get(2)?;
                        let last_accessed_at: String = row.get(3)?;
                        Ok(EntryMeta {
                            key_hash: row.get(0)?,
                            url: row.get(1)?,
                            inserted_at: parse_ts(&inserted_at)?,
                            last_accessed_at: parse_ts(&last_accessed_at)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(meta)
            })
            .await
            .map_err(Error::from)
    }

    /// Number of entries in a compartment.
    pub async fn entry_count(&self, compartment: &str) -> Result<u64, Error> {
        let compartment = compartment.to_string();
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM entries WHERE compartment = ?1", params![compartment], |row| {
                        row.get(0)
                    })?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key(path: &str) -> ResourceKey {
        ResourceKey::parse(&format!("https://gear.example{path}"), false).unwrap()
    }

    fn entry(path: &str, body: &str) -> CacheEntry {
        let payload = Payload::new(200, body).with_header("Content-Type", "image/png");
        CacheEntry::new(key(path), payload, Utc::now())
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let e = entry("/logo.png", "png-bytes");

        db.put_entry("images", &e).await.unwrap();

        let got = db.get_entry("images", &e.key).await.unwrap().unwrap();
        assert_eq!(got.payload.body, b"png-bytes");
        assert_eq!(got.payload.content_type(), Some("image/png"));
        assert_eq!(got.key, e.key);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let db = CacheDb::open_in_memory().await.unwrap();
        assert!(db.get_entry("images", &key("/nope.png")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compartments_are_independent() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let e = entry("/inter.woff2", "font");
        db.put_entry("fonts", &e).await.unwrap();

        assert!(db.get_entry("images", &e.key).await.unwrap().is_none());
        assert!(db.get_entry("fonts", &e.key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let db = CacheDb::open_in_memory().await.unwrap();
        db.put_entry("static-resources", &entry("/app.js", "v1")).await.unwrap();
        db.put_entry("static-resources", &entry("/app.js", "v2")).await.unwrap();

        let got = db.get_entry("static-resources", &key("/app.js")).await.unwrap().unwrap();
        assert_eq!(got.payload.body, b"v2");
        assert_eq!(db.entry_count("static-resources").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_touch_updates_last_access() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let mut e = entry("/logo.png", "x");
        e.inserted_at = Utc::now() - Duration::hours(2);
        e.last_accessed_at = e.inserted_at;
        db.put_entry("images", &e).await.unwrap();

        let later = Utc::now();
        assert!(db.touch_entry("images", &e.key, later).await.unwrap());

        let got = db.get_entry("images", &e.key).await.unwrap().unwrap();
        assert_eq!(format_ts(got.last_accessed_at), format_ts(later));
        assert_eq!(format_ts(got.inserted_at), format_ts(e.inserted_at));
    }

    #[tokio::test]
    async fn test_touch_missing_entry() {
        let db = CacheDb::open_in_memory().await.unwrap();
        assert!(!db.touch_entry("images", &key("/gone.png"), Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_and_keys() {
        let db = CacheDb::open_in_memory().await.unwrap();
        db.put_entry("images", &entry("/a.png", "a")).await.unwrap();
        db.put_entry("images", &entry("/b.png", "b")).await.unwrap();

        assert!(db.delete_entry("images", &key("/a.png")).await.unwrap());
        assert!(!db.delete_entry("images", &key("/a.png")).await.unwrap());

        let keys = db.entry_keys("images").await.unwrap();
        assert_eq!(keys, vec![key("/b.png")]);
    }

    #[tokio::test]
    async fn test_evict_skips_rewritten_entry() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let mut old = entry("/logo.png", "v1");
        old.inserted_at = Utc::now() - Duration::days(90);
        old.last_accessed_at = old.inserted_at;
        db.put_entry("images", &old).await.unwrap();
        let seen = db.entry_meta("images").await.unwrap().remove(0);

        db.put_entry("images", &entry("/logo.png", "v2")).await.unwrap();

        assert!(!db.evict_entry("images", &seen).await.unwrap());
        let got = db.get_entry("images", &key("/logo.png")).await.unwrap().unwrap();
        assert_eq!(got.payload.body, b"v2");

        let current = db.entry_meta("images").await.unwrap().remove(0);
        assert!(db.evict_entry("images", &current).await.unwrap());
        assert_eq!(db.entry_count("images").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_entry_meta_orders_by_last_access() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let now = Utc::now();
        for (i, path) in ["/c.png", "/a.png", "/b.png"].iter().enumerate() {
            let mut e = entry(path, "x");
            e.last_accessed_at = now - Duration::minutes(10 - i as i64);
            db.put_entry("images", &e).await.unwrap();
        }

        let urls: Vec<String> = db.entry_meta("images").await.unwrap().into_iter().map(|m| m.url).collect();
        assert_eq!(
            urls,
            vec!["https://gear.example/c.png", "https://gear.example/a.png", "https://gear.example/b.png"]
        );
    }

    #[tokio::test]
    async fn test_put_beyond_quota_is_store_full() {
        let db = CacheDb::open_in_memory_with_quota(64 * 1024).await.unwrap();
        let big = CacheEntry::new(key("/huge.png"), Payload::new(200, vec![7u8; 512 * 1024]), Utc::now());

        let err = db.put_entry("images", &big).await.unwrap_err();
        assert!(matches!(err, Error::StoreFull(_)), "unexpected error: {err}");

        assert!(db.get_entry("images", &big.key).await.unwrap().is_none());
    }

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let a = format_ts(DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc));
        let b = format_ts(DateTime::parse_from_rfc3339("2026-01-01T00:00:00.5Z").unwrap().with_timezone(&Utc));
        assert_eq!(a.len(), b.len());
        assert!(a < b);
    }
}
