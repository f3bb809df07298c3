//! Persisted migration state.
//!
//! One row per applied unit lives in the state table; a single-row companion
//! table `<name>_data` records whether the one-time data load has run.

use crate::config::validate_identifier;
use crate::db::Connection;
use crate::error::{DbError, DbResult};
use crate::models::{BackendKind, Value};
use chrono::Utc;
use tracing::debug;

/// What the state table records about one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedUnit {
    pub sequence: i64,
    pub background_completed: bool,
}

/// Dialect-aware access to the state tables.
#[derive(Debug, Clone)]
pub struct StateTable {
    name: String,
    backend: BackendKind,
}

impl StateTable {
    pub fn new(name: impl Into<String>, backend: BackendKind) -> DbResult<Self> {
        let name = name.into();
        validate_identifier(&name).map_err(DbError::configuration)?;
        Ok(Self { name, backend })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn data_table(&self) -> String {
        format!("{}_data", self.name)
    }

    fn timestamp_type(&self) -> &'static str {
        match self.backend {
            BackendKind::PostgreSQL => "TIMESTAMPTZ",
            BackendKind::MySQL => "DATETIME(6)",
            BackendKind::SQLite => "TEXT",
        }
    }

    fn insert_ignore(&self, table: &str, columns: &str, values: &str) -> String {
        match self.backend {
            BackendKind::MySQL => format!("INSERT IGNORE INTO {table} ({columns}) VALUES ({values})"),
            _ => format!("INSERT INTO {table} ({columns}) VALUES ({values}) ON CONFLICT DO NOTHING"),
        }
    }

    /// Create both tables if they do not exist yet.
    pub async fn ensure(&self, conn: &Connection) -> DbResult<()> {
        let ts = self.timestamp_type();
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    sequence BIGINT NOT NULL PRIMARY KEY,
                    applied_at {ts} NOT NULL,
                    background_completed_at {ts} NULL
                )",
                self.name
            ),
            (),
        )
        .await?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER NOT NULL PRIMARY KEY,
                    data_loaded BOOLEAN NOT NULL
                )",
                self.data_table()
            ),
            (),
        )
        .await?;
        conn.execute(
            &self.insert_ignore(&self.data_table(), "id, data_loaded", "1, FALSE"),
            (),
        )
        .await?;
        debug!(table = %self.name, "State tables ready");
        Ok(())
    }

    /// Every recorded unit, in sequence order.
    pub async fn applied(&self, conn: &Connection) -> DbResult<Vec<AppliedUnit>> {
        let rows = conn
            .fetch_all(
                &format!(
                    "SELECT sequence, background_completed_at FROM {} ORDER BY sequence",
                    self.name
                ),
                (),
            )
            .await?;
        rows.iter()
            .map(|row| {
                Ok(AppliedUnit {
                    sequence: row.get("sequence")?,
                    background_completed: row
                        .value("background_completed_at")
                        .is_some_and(|v| !v.is_null()),
                })
            })
            .collect()
    }

    /// The highest applied sequence, or -1 when nothing has been applied.
    pub async fn last_applied(&self, conn: &Connection) -> DbResult<i64> {
        let last = conn
            .fetch_val(&format!("SELECT MAX(sequence) FROM {}", self.name), ())
            .await?;
        match last {
            None | Some(Value::Null) => Ok(-1),
            Some(Value::Integer(seq)) => Ok(seq),
            Some(Value::Text(s)) => s
                .parse()
                .map_err(|_| DbError::internal(format!("invalid sequence '{}' in {}", s, self.name))),
            Some(other) => Err(DbError::internal(format!(
                "unexpected {} sequence in {}",
                other.type_name(),
                self.name
            ))),
        }
    }

    pub async fn record_applied(&self, conn: &Connection, sequence: i64) -> DbResult<()> {
        conn.execute(
            &format!(
                "INSERT INTO {} (sequence, applied_at) VALUES (:sequence, :now)",
                self.name
            ),
            [("sequence", Value::Integer(sequence)), ("now", Value::Timestamp(Utc::now()))],
        )
        .await?;
        Ok(())
    }

    pub async fn record_background_completed(&self, conn: &Connection, sequence: i64) -> DbResult<()> {
        conn.execute(
            &format!(
                "UPDATE {} SET background_completed_at = :now WHERE sequence = :sequence",
                self.name
            ),
            [("sequence", Value::Integer(sequence)), ("now", Value::Timestamp(Utc::now()))],
        )
        .await?;
        Ok(())
    }

    /// Whether the one-time data load has run. With `for_update` the flag row
    /// stays locked until the enclosing transaction ends.
    pub async fn data_loaded(&self, conn: &Connection, for_update: bool) -> DbResult<bool> {
        let lock = if for_update { " FOR UPDATE" } else { "" };
        let flag = conn
            .fetch_val(
                &format!("SELECT data_loaded FROM {} WHERE id = 1{lock}", self.data_table()),
                (),
            )
            .await?;
        Ok(flag.and_then(|v| v.truthy()).unwrap_or(false))
    }

    pub async fn mark_data_loaded(&self, conn: &Connection) -> DbResult<()> {
        conn.execute(
            &format!("UPDATE {} SET data_loaded = TRUE WHERE id = 1", self.data_table()),
            (),
        )
        .await?;
        Ok(())
    }
}
