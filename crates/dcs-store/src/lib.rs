//! Append-only SQLite snapshot store with a same-period idempotency guard.

use std::path::PathBuf;

use chrono::NaiveDate;
use dcs_core::CleanRecord;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "dcs-store";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub table: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid table name {0:?}")]
    InvalidTableName(String),
    #[error("creating store directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("storage failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Read-only summary for the reporting boundary (email notifier, dashboard).
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct StoreReport {
    pub total_records: u64,
    pub period_records: u64,
    pub categories: Vec<String>,
    pub avg_price: f64,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
}

impl StoreReport {
    pub fn to_markdown(&self, period: NaiveDate) -> String {
        let mut lines = vec![
            "# Daily Catalog Snapshot".to_string(),
            String::new(),
            format!("- total records: {}", self.total_records),
            format!("- records for {}: {}", period, self.period_records),
            format!("- average price: {:.2}", self.avg_price),
        ];
        match (self.first_date, self.last_date) {
            (Some(first), Some(last)) => lines.push(format!("- date range: {first} to {last}")),
            _ => lines.push("- date range: n/a".to_string()),
        }
        lines.push(format!("- categories: {}", self.categories.join(", ")));
        lines.join("\n")
    }
}

/// Handle on the snapshot table. Opened at the start of the storage stage
/// and dropped at its end; the connection closes on drop on every path.
///
/// The idempotency guard and the append are two separate statements, not one
/// transactional check-and-insert. Concurrent invocations against the same
/// store can race between them; acceptable for a single-scheduler deployment.
pub struct SnapshotStore {
    conn: Connection,
    table: String,
}

impl SnapshotStore {
    /// Open or create the snapshot database at the configured path.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        validate_table_name(&config.table)?;
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let conn = Connection::open(&config.path)?;
        Ok(Self {
            conn,
            table: config.table.clone(),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory(table: &str) -> Result<Self, StoreError> {
        validate_table_name(table)?;
        Ok(Self {
            conn: Connection::open_in_memory()?,
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn table_exists(&self) -> Result<bool, StoreError> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![self.table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn ensure_table(&self) -> Result<(), StoreError> {
        self.conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                     id INTEGER,
                     title TEXT,
                     category TEXT NOT NULL,
                     price REAL NOT NULL,
                     rating_rate REAL NOT NULL,
                     rating_count INTEGER,
                     fetch_date TEXT NOT NULL
                 )",
                self.table
            ),
            [],
        )?;
        Ok(())
    }

    /// Advisory idempotency predicate: true when at least one row already
    /// carries `fetch_date = period`, false when none do or the table does
    /// not exist yet.
    pub fn already_ingested(&self, period: NaiveDate) -> Result<bool, StoreError> {
        if !self.table_exists()? {
            return Ok(false);
        }
        let count: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE fetch_date = ?1",
                self.table
            ),
            params![period],
            |row| row.get(0),
        )?;
        if count > 0 {
            warn!(count, %period, "idempotency check: records already exist for period");
            return Ok(true);
        }
        Ok(false)
    }

    /// Append the batch for `period`, all-or-nothing. Returns 0 without
    /// writing when the idempotency guard reports the period as already
    /// ingested; any insert failure rolls the whole batch back.
    pub fn write(
        &mut self,
        period: NaiveDate,
        records: &[CleanRecord],
    ) -> Result<usize, StoreError> {
        if self.already_ingested(period)? {
            warn!(%period, "skipping storage: period already ingested");
            return Ok(0);
        }

        self.ensure_table()?;
        let insert_sql = format!(
            "INSERT INTO {} (id, title, category, price, rating_rate, rating_count, fetch_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            self.table
        );

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&insert_sql)?;
            for record in records {
                stmt.execute(params![
                    record.id,
                    record.title,
                    record.category,
                    record.price,
                    record.rating_rate,
                    record.rating_count,
                    record.fetch_date,
                ])?;
            }
        }
        tx.commit()?;

        info!(records = records.len(), table = %self.table, "stored clean records");
        Ok(records.len())
    }

    /// Read-only reporting query; never mutates. Returns an empty report
    /// when the table does not exist yet.
    pub fn report(&self, period: NaiveDate) -> Result<StoreReport, StoreError> {
        if !self.table_exists()? {
            warn!(table = %self.table, "snapshot table does not exist yet");
            return Ok(StoreReport::default());
        }

        let total_records: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.table),
            [],
            |row| row.get(0),
        )?;
        let period_records: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE fetch_date = ?1",
                self.table
            ),
            params![period],
            |row| row.get(0),
        )?;
        let avg_price: Option<f64> = self.conn.query_row(
            &format!("SELECT AVG(price) FROM {}", self.table),
            [],
            |row| row.get(0),
        )?;
        let (first_date, last_date): (Option<NaiveDate>, Option<NaiveDate>) =
            self.conn.query_row(
                &format!(
                    "SELECT MIN(fetch_date), MAX(fetch_date) FROM {}",
                    self.table
                ),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT DISTINCT category FROM {} ORDER BY category",
            self.table
        ))?;
        let categories = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(StoreReport {
            total_records: total_records as u64,
            period_records: period_records as u64,
            categories,
            avg_price: avg_price.map(|p| (p * 100.0).round() / 100.0).unwrap_or(0.0),
            first_date,
            last_date,
        })
    }
}

fn validate_table_name(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let head_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if head_ok && tail_ok {
        Ok(())
    } else {
        Err(StoreError::InvalidTableName(name.to_string()))
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}
