//! Persistence backends for the round history.
//!
//! A sink always stores the full snapshot, newest first. Each `save`
//! replaces whatever was stored before.

use std::path::{Path, PathBuf};

use dicefeed_core::types::RoundRecord;
use dicefeed_core::{RoundResult, HISTORY_CAPACITY};
use parking_lot::Mutex;
use rusqlite::params;
use tracing::warn;

use crate::database::Database;
use crate::error::StoreError;

/// Where the history snapshot lives between restarts.
pub trait HistorySink: Send + Sync {
    /// Previously saved snapshot. A sink with nothing stored yields an empty list.
    fn load(&self) -> Result<Vec<RoundResult>, StoreError>;

    /// Overwrite the stored snapshot.
    fn save(&self, rounds: &[RoundResult]) -> Result<(), StoreError>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Records with out-of-range dice are dropped with a warning.
fn into_rounds(records: Vec<RoundRecord>) -> Vec<RoundResult> {
    records
        .into_iter()
        .filter_map(|record| match RoundResult::try_from(record) {
            Ok(round) => Some(round),
            Err(e) => {
                warn!(error = %e, "skipping invalid persisted round");
                None
            }
        })
        .take(HISTORY_CAPACITY)
        .collect()
}

// ─── JSON file ──────────────────────────────────────────────────────────────

/// A JSON array of `{sid, d1, d2, d3, timestamp}` records.
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl HistorySink for JsonFileSink {
    fn load(&self) -> Result<Vec<RoundResult>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let records: Vec<RoundRecord> = serde_json::from_str(&content)?;
        Ok(into_rounds(records))
    }

    fn save(&self, rounds: &[RoundResult]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(rounds)?;
        let tmp = self.temp_path();
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

// ─── SQLite ─────────────────────────────────────────────────────────────────

pub struct SqliteSink {
    db: Database,
}

impl SqliteSink {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?))
    }
}

impl HistorySink for SqliteSink {
    fn load(&self) -> Result<Vec<RoundResult>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT sid, d1, d2, d3, observed_at FROM rounds ORDER BY position ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map([HISTORY_CAPACITY as i64], |row| {
                Ok(RoundRecord {
                    sid: row.get::<_, i64>(0)?.max(0) as u64,
                    d1: row.get(1)?,
                    d2: row.get(2)?,
                    d3: row.get(3)?,
                    timestamp: row.get(4)?,
                })
            })?;
            let records = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(into_rounds(records))
        })
    }

    fn save(&self, rounds: &[RoundResult]) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM rounds", [])?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO rounds (position, sid, d1, d2, d3, observed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for (position, round) in rounds.iter().enumerate() {
                    let [d1, d2, d3] = round.dice().faces();
                    let sid = i64::try_from(round.sid().get())
                        .map_err(|_| StoreError::Serialization(format!("sid {} overflows", round.sid())))?;
                    stmt.execute(params![
                        position as i64,
                        sid,
                        d1,
                        d2,
                        d3,
                        round.observed_at().map(|t| t.timestamp_millis()),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

// ─── Memory ─────────────────────────────────────────────────────────────────

/// Keeps the snapshot in process memory only.
#[derive(Default)]
pub struct MemorySink {
    rounds: Mutex<Vec<RoundResult>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeded with a snapshot, as if it had been saved by a previous run.
    pub fn with_rounds(rounds: Vec<RoundResult>) -> Self {
        Self {
            rounds: Mutex::new(rounds),
        }
    }

    pub fn snapshot(&self) -> Vec<RoundResult> {
        self.rounds.lock().clone()
    }
}

impl HistorySink for MemorySink {
    fn load(&self) -> Result<Vec<RoundResult>, StoreError> {
        Ok(self.rounds.lock().iter().take(HISTORY_CAPACITY).cloned().collect())
    }

    fn save(&self, rounds: &[RoundResult]) -> Result<(), StoreError> {
        *self.rounds.lock() = rounds.to_vec();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
