//! Retention enforcement for runtime compartments.
//!
//! Two independent limits are applied on every pass: entries older than
//! `max_age_seconds` (by insertion time) are dropped, then the survivors are
//! trimmed least-recently-accessed first down to `max_entries`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::cache::{CacheDb, EntryMeta};
use crate::manifest::is_precache_compartment;

/// Retention limits for one runtime compartment.
///
/// A `None` limit is not enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub max_entries: Option<u32>,
    #[serde(default)]
    pub max_age_seconds: Option<u64>,
}

impl RetentionPolicy {
    pub fn new(max_entries: u32, max_age_seconds: u64) -> Self {
        Self { max_entries: Some(max_entries), max_age_seconds: Some(max_age_seconds) }
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_entries.is_none() && self.max_age_seconds.is_none()
    }
}

/// Why an entry was chosen for eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Expired,
    OverCapacity,
}

/// Outcome of one expiration pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExpirationReport {
    pub compartment: String,
    pub examined: usize,
    pub evicted: usize,
    pub failed: usize,
}

/// Pick the entries to evict. Pure; the store is not touched.
///
/// `entries` may be in any order. Victims keep the order in which they were
/// selected: expired entries first, then least recently accessed.
pub fn select_victims<'a>(
    entries: &'a [EntryMeta], policy: &RetentionPolicy, now: DateTime<Utc>,
) -> Vec<(&'a EntryMeta, EvictionReason)> {
    let mut victims = Vec::new();
    let mut survivors: Vec<&EntryMeta> = Vec::with_capacity(entries.len());

    // An age too large to represent can never be exceeded.
    let cutoff = policy.max_age_seconds.and_then(|secs| {
        let age = Duration::try_seconds(i64::try_from(secs).ok()?)?;
        now.checked_sub_signed(age)
    });

    for entry in entries {
        match cutoff {
            Some(cutoff) if entry.inserted_at < cutoff => {
                victims.push((entry, EvictionReason::Expired));
            }
            _ => survivors.push(entry),
        }
    }

    if let Some(max) = policy.max_entries {
        let max = max as usize;
        if survivors.len() > max {
            survivors.sort_by(|a, b| {
                a.last_accessed_at
                    .cmp(&b.last_accessed_at)
                    .then(a.inserted_at.cmp(&b.inserted_at))
                    .then(a.key_hash.cmp(&b.key_hash))
            });
            let excess = survivors.len() - max;
            victims.extend(survivors.iter().take(excess).map(|e| (*e, EvictionReason::OverCapacity)));
        }
    }

    victims
}

/// Run one eviction pass over `compartment`.
///
/// Deletion is best-effort: a failed delete is logged as an
/// [`Error::EvictionFailure`] and the pass moves on. Only a failure to
/// enumerate the compartment is returned as an error. An entry rewritten
/// after the scan is left alone.
pub async fn expire_compartment(
    db: &CacheDb, compartment: &str, policy: &RetentionPolicy, now: DateTime<Utc>,
) -> Result<ExpirationReport, Error> {
    let mut report = ExpirationReport { compartment: compartment.to_string(), ..Default::default() };

    if is_precache_compartment(compartment) {
        tracing::debug!(compartment, "precache compartments are not subject to expiration");
        return Ok(report);
    }
    if policy.is_unbounded() {
        return Ok(report);
    }

    let entries = db.entry_meta(compartment).await?;
    report.examined = entries.len();

    for (meta, reason) in select_victims(&entries, policy, now) {
        match db.evict_entry(compartment, meta).await {
            Ok(true) => {
                report.evicted += 1;
                tracing::debug!(compartment, url = %meta.url, ?reason, "evicted entry");
            }
            // Already gone, or rewritten since the scan.
            Ok(false) => {}
            Err(e) => {
                report.failed += 1;
                let failure = Error::EvictionFailure {
                    compartment: compartment.to_string(),
                    key: meta.url.clone(),
                    reason: e.to_string(),
                };
                tracing::warn!(error = %failure, "eviction failed, continuing");
            }
        }
    }

    if report.evicted > 0 || report.failed > 0 {
        tracing::info!(
            compartment,
            examined = report.examined,
            evicted = report.evicted,
            failed = report.failed,
            "expiration pass finished"
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheEntry, Payload, ResourceKey};

    fn meta(name: &str, inserted_mins_ago: i64, accessed_mins_ago: i64, now: DateTime<Utc>) -> EntryMeta {
        EntryMeta {
            key_hash: name.to_string(),
            url: format!("https://gear.example/{name}"),
            inserted_at: now - Duration::minutes(inserted_mins_ago),
            last_accessed_at: now - Duration::minutes(accessed_mins_ago),
        }
    }

    fn hashes<'a>(victims: &[(&'a EntryMeta, EvictionReason)]) -> Vec<&'a str> {
        victims.iter().map(|(m, _)| m.key_hash.as_str()).collect()
    }

    #[test]
    fn test_unbounded_policy_selects_nothing() {
        let now = Utc::now();
        let entries = vec![meta("a", 10_000, 10_000, now)];
        assert!(select_victims(&entries, &RetentionPolicy::default(), now).is_empty());
    }

    #[test]
    fn test_count_limit_evicts_least_recently_accessed() {
        let now = Utc::now();
        let entries = vec![meta("a", 30, 1, now), meta("b", 20, 15, now), meta("c", 10, 5, now)];
        let policy = RetentionPolicy { max_entries: Some(2), max_age_seconds: None };

        let victims = select_victims(&entries, &policy, now);
        assert_eq!(hashes(&victims), vec!["b"]);
        assert_eq!(victims[0].1, EvictionReason::OverCapacity);
    }

    #[test]
    fn test_age_limit_uses_insertion_time() {
        let now = Utc::now();
        // "old" was accessed a moment ago but inserted two hours back.
        let entries = vec![meta("old", 120, 0, now), meta("new", 5, 5, now)];
        let policy = RetentionPolicy { max_entries: None, max_age_seconds: Some(3600) };

        let victims = select_victims(&entries, &policy, now);
        assert_eq!(hashes(&victims), vec!["old"]);
        assert_eq!(victims[0].1, EvictionReason::Expired);
    }

    #[test]
    fn test_both_limits_do_not_over_evict() {
        let now = Utc::now();
        let entries = vec![
            meta("expired", 200, 1, now),
            meta("lru", 10, 9, now),
            meta("mid", 10, 5, now),
            meta("fresh", 10, 1, now),
        ];
        let policy = RetentionPolicy::new(2, 3600);

        let victims = select_victims(&entries, &policy, now);
        assert_eq!(hashes(&victims), vec!["expired", "lru"]);
    }

    #[test]
    fn test_at_limit_selects_nothing() {
        let now = Utc::now();
        let entries = vec![meta("a", 1, 1, now), meta("b", 1, 1, now)];
        let policy = RetentionPolicy { max_entries: Some(2), max_age_seconds: None };
        assert!(select_victims(&entries, &policy, now).is_empty());
    }

    async fn seed(db: &CacheDb, compartment: &str, name: &str, inserted: DateTime<Utc>, accessed: DateTime<Utc>) {
        let key = ResourceKey::parse(&format!("https://gear.example/{name}"), false).unwrap();
        let entry = CacheEntry { key, payload: Payload::new(200, name), inserted_at: inserted, last_accessed_at: accessed };
        db.put_entry(compartment, &entry).await.unwrap();
    }

    #[tokio::test]
    async fn test_expire_max_entries_plus_one() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let now = Utc::now();
        let policy = RetentionPolicy { max_entries: Some(3), max_age_seconds: None };

        for i in 0..4 {
            let at = now - Duration::minutes(10 - i);
            seed(&db, "images", &format!("{i}.png"), at, at).await;
        }

        let report = expire_compartment(&db, "images", &policy, now).await.unwrap();
        assert_eq!(report.examined, 4);
        assert_eq!(report.evicted, 1);
        assert_eq!(db.entry_count("images").await.unwrap(), 3);

        let oldest = ResourceKey::parse("https://gear.example/0.png", false).unwrap();
        assert!(db.get_entry("images", &oldest).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expire_by_age() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let now = Utc::now();
        seed(&db, "fonts", "stale.woff2", now - Duration::days(400), now).await;
        seed(&db, "fonts", "fresh.woff2", now - Duration::days(1), now - Duration::days(1)).await;

        let policy = RetentionPolicy { max_entries: Some(30), max_age_seconds: Some(365 * 24 * 3600) };
        let report = expire_compartment(&db, "fonts", &policy, now).await.unwrap();

        assert_eq!(report.evicted, 1);
        let keys: Vec<String> = db.entry_keys("fonts").await.unwrap().iter().map(|k| k.url().to_string()).collect();
        assert_eq!(keys, vec!["https://gear.example/fresh.woff2"]);
    }

    #[tokio::test]
    async fn test_precache_compartments_are_exempt() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let long_ago = Utc::now() - Duration::days(1000);
        seed(&db, "precache-0123456789abcdef", "index.html", long_ago, long_ago).await;

        let policy = RetentionPolicy::new(0, 1);
        let report = expire_compartment(&db, "precache-0123456789abcdef", &policy, Utc::now()).await.unwrap();

        assert_eq!(report.evicted, 0);
        assert_eq!(db.entry_count("precache-0123456789abcdef").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_eviction_does_not_stop_the_pass() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let now = Utc::now();
        let long_ago = now - Duration::days(30);
        for name in ["a.png", "b.png", "c.png"] {
            seed(&db, "images", name, long_ago, long_ago).await;
        }
        db.conn
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER pin_b BEFORE DELETE ON entries
                    WHEN OLD.url = 'https://gear.example/b.png'
                    BEGIN SELECT RAISE(ABORT, 'entry is pinned'); END;",
                )
            })
            .await
            .unwrap();

        let policy = RetentionPolicy { max_entries: None, max_age_seconds: Some(3600) };
        let report = expire_compartment(&db, "images", &policy, now).await.unwrap();

        assert_eq!(report.examined, 3);
        assert_eq!(report.evicted, 2);
        assert_eq!(report.failed, 1);
        let keys: Vec<String> = db.entry_keys("images").await.unwrap().iter().map(|k| k.url().to_string()).collect();
        assert_eq!(keys, vec!["https://gear.example/b.png"]);
    }
}
