//! Persisted precache generation records.
//!
//! Each installed manifest is tracked by a row holding its state so that a
//! restarted process knows which precache compartment is authoritative.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;

use super::connection::CacheDb;
use super::entries::{format_ts, parse_ts};
use crate::Error;

/// Lifecycle state of a precache generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    Installing,
    Waiting,
    Activating,
    Active,
    Redundant,
}

impl GenerationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationState::Installing => "installing",
            GenerationState::Waiting => "waiting",
            GenerationState::Activating => "activating",
            GenerationState::Active => "active",
            GenerationState::Redundant => "redundant",
        }
    }
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "installing" => Ok(GenerationState::Installing),
            "waiting" => Ok(GenerationState::Waiting),
            "activating" => Ok(GenerationState::Activating),
            "active" => Ok(GenerationState::Active),
            "redundant" => Ok(GenerationState::Redundant),
            other => Err(Error::InvalidState(format!("unknown generation state: {other}"))),
        }
    }
}

/// A stored generation row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRecord {
    pub id: String,
    pub compartment: String,
    pub manifest_json: String,
    pub state: GenerationState,
    pub installed_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

fn read_record(row: &rusqlite::Row<'_>) -> Result<GenerationRecord, rusqlite::Error> {
    let state: String = row.get(3)?;
    let installed_at: String = row.get(4)?;
    let activated_at: Option<String> = row.get(5)?;
    Ok(GenerationRecord {
        id: row.get(0)?,
        compartment: row.get(1)?,
        manifest_json: row.get(2)?,
        state: state.parse().map_err(|e: Error| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.to_string().into())
        })?,
        installed_at: parse_ts(&installed_at)?,
        activated_at: activated_at.as_deref().map(parse_ts).transpose()?,
    })
}

impl CacheDb {
    /// Insert or replace a generation record.
    pub async fn record_generation(&self, record: &GenerationRecord) -> Result<(), Error> {
        let record = record.clone();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO generations (id, compartment, manifest_json, state, installed_at, activated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(id) DO UPDATE SET
                    compartment = excluded.compartment,
                    manifest_json = excluded.manifest_json,
                    state = excluded.state,
                    installed_at = excluded.installed_at,
                    activated_at = excluded.activated_at",
                    params![
                        &record.id,
                        &record.compartment,
                        &record.manifest_json,
                        record.state.as_str(),
                        format_ts(record.installed_at),
                        record.activated_at.map(format_ts),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Change the state of an existing generation.
    pub async fn set_generation_state(&self, id: &str, state: GenerationState) -> Result<bool, Error> {
        let id = id.to_string();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let updated =
                    conn.execute("UPDATE generations SET state = ?2 WHERE id = ?1", params![id, state.as_str()])?;
                Ok(updated > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// Atomically make `id` the single active generation.
    ///
    /// Whatever was active (or waiting) before becomes redundant in the same
    /// transaction, so there is never a moment with zero or two active rows.
    pub async fn activate_generation(&self, id: &str, at: DateTime<Utc>) -> Result<(), Error> {
        let id = id.to_string();
        let at = format_ts(at);
        self.conn
            .call(move |conn| -> Result<(), Error> {
                let tx = conn.transaction()?;
                let updated = tx.execute(
                    "UPDATE generations SET state = 'active', activated_at = ?2 WHERE id = ?1",
                    params![&id, &at],
                )?;
                if updated == 0 {
                    return Err(Error::InvalidState(format!("unknown generation: {id}")));
                }
                tx.execute(
                    "UPDATE generations SET state = 'redundant'
                WHERE id != ?1 AND state IN ('active', 'waiting', 'activating')",
                    params![&id],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// All generations currently in `state`, newest install first.
    pub async fn generations_in_state(&self, state: GenerationState) -> Result<Vec<GenerationRecord>, Error> {
        self.conn
            .call(move |conn| -> Result<Vec<GenerationRecord>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT id, compartment, manifest_json, state, installed_at, activated_at
                FROM generations WHERE state = ?1 ORDER BY installed_at DESC",
                )?;
                let records = stmt
                    .query_map(params![state.as_str()], read_record)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await
            .map_err(Error::from)
    }

    pub async fn get_generation(&self, id: &str) -> Result<Option<GenerationRecord>, Error> {
        let id = id.to_string();
        self.conn
            .call(move |conn| -> Result<Option<GenerationRecord>, Error> {
                let result = conn.query_row(
                    "SELECT id, compartment, manifest_json, state, installed_at, activated_at
                FROM generations WHERE id = ?1",
                    params![id],
                    read_record,
                );
                match result {
                    Ok(record) => Ok(Some(record)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// Drop redundant generation records whose compartment is already gone.
    pub async fn prune_redundant_generations(&self) -> Result<usize, Error> {
        self.conn
            .call(|conn| -> Result<usize, Error> {
                let deleted = conn.execute(
                    "DELETE FROM generations WHERE state = 'redundant'
                AND compartment NOT IN (SELECT name FROM compartments)",
                    [],
                )?;
                Ok(deleted)
            })
            .await
            .map_err(Error::from)
    }

    pub async fn delete_generation(&self, id: &str) -> Result<bool, Error> {
        let id = id.to_string();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let deleted = conn.execute("DELETE FROM generations WHERE id = ?1", params![id])?;
                Ok(deleted > 0)
            })
            .await
            .map_err(Error::from)
    }
}
