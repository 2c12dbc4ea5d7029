//! Compartment-level operations: enumerate, inspect, drop.

use serde::{Deserialize, Serialize};
use tokio_rusqlite::params;

use super::connection::CacheDb;
use crate::Error;

/// Entry count and stored bytes for one compartment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompartmentStats {
    pub name: String,
    pub entries: u64,
    pub bytes: u64,
}

impl CacheDb {
    /// Names of all compartments, sorted.
    pub async fn compartment_names(&self) -> Result<Vec<String>, Error> {
        self.conn
            .call(|conn| -> Result<Vec<String>, Error> {
                let mut stmt = conn.prepare("SELECT name FROM compartments ORDER BY name")?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(names)
            })
            .await
            .map_err(Error::from)
    }

    pub async fn has_compartment(&self, name: &str) -> Result<bool, Error> {
        let name = name.to_string();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM compartments WHERE name = ?1)",
                    params![name],
                    |row| row.get(0),
                )?;
                Ok(exists)
            })
            .await
            .map_err(Error::from)
    }

    /// Drop a compartment and every entry in it.
    ///
    /// Returns false if the compartment did not exist.
    pub async fn delete_compartment(&self, name: &str) -> Result<bool, Error> {
        let name = name.to_string();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM entries WHERE compartment = ?1", params![&name])?;
                let deleted = tx.execute("DELETE FROM compartments WHERE name = ?1", params![&name])?;
                tx.commit()?;
                Ok(deleted > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// Per-compartment entry counts and payload sizes.
    pub async fn compartment_stats(&self) -> Result<Vec<CompartmentStats>, Error> {
        self.conn
            .call(|conn| -> Result<Vec<CompartmentStats>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT c.name, COUNT(e.key_hash), COALESCE(SUM(LENGTH(e.body)), 0)
                FROM compartments c LEFT JOIN entries e ON e.compartment = c.name
                GROUP BY c.name ORDER BY c.name",
                )?;
                let stats = stmt
                    .query_map([], |row| {
                        Ok(CompartmentStats {
                            name: row.get(0)?,
                            entries: row.get::<_, i64>(1)? as u64,
                            bytes: row.get::<_, i64>(2)? as u64,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(stats)
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheEntry, Payload, ResourceKey};
    use chrono::Utc;

    async fn seed(db: &CacheDb, compartment: &str, path: &str, body: &str) {
        let key = ResourceKey::parse(&format!("https://gear.example{path}"), false).unwrap();
        db.put_entry(compartment, &CacheEntry::new(key, Payload::new(200, body), Utc::now()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_creates_compartment_lazily() {
        let db = CacheDb::open_in_memory().await.unwrap();
        assert!(!db.has_compartment("images").await.unwrap());

        seed(&db, "images", "/logo.png", "png").await;

        assert!(db.has_compartment("images").await.unwrap());
        assert_eq!(db.compartment_names().await.unwrap(), vec!["images".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_compartment_removes_entries() {
        let db = CacheDb::open_in_memory().await.unwrap();
        seed(&db, "precache-aaaa", "/index.html", "<html>").await;
        seed(&db, "images", "/logo.png", "png").await;

        assert!(db.delete_compartment("precache-aaaa").await.unwrap());
        assert!(!db.delete_compartment("precache-aaaa").await.unwrap());

        assert_eq!(db.entry_count("precache-aaaa").await.unwrap(), 0);
        assert_eq!(db.entry_count("images").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_compartment_stats() {
        let db = CacheDb::open_in_memory().await.unwrap();
        seed(&db, "fonts", "/inter.woff2", "font").await;
        let font = ResourceKey::parse("https://gear.example/inter.woff2", false).unwrap();
        assert!(db.delete_entry("fonts", &font).await.unwrap());
        seed(&db, "images", "/a.png", "aaaa").await;
        seed(&db, "images", "/b.png", "bb").await;

        let stats = db.compartment_stats().await.unwrap();
        assert_eq!(
            stats,
            vec![
                CompartmentStats { name: "fonts".into(), entries: 0, bytes: 0 },
                CompartmentStats { name: "images".into(), entries: 2, bytes: 6 },
            ]
        );
    }
}
