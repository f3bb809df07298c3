//! SQLite adapter.

use super::{Capabilities, Driver, RawConnection, connect_error};
use crate::db::bind::PlaceholderStyle;
use crate::db::params::bind_sqlite_value;
use crate::error::{DbError, DbResult};
use crate::models::BackendKind;
use async_trait::async_trait;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, SqliteConnection};
use std::str::FromStr;
use tracing::debug;

/// Opens `SqliteConnection`s. Database files are created if missing.
#[derive(Debug, Clone)]
pub struct SqliteDriver {
    options: SqliteConnectOptions,
}

impl SqliteDriver {
    pub fn new(url: &str) -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| {
                DbError::connection(
                    format!("Invalid SQLite connection string: {}", e),
                    "Check the connection URL format: sqlite:path/to/db.sqlite",
                )
            })?
            .create_if_missing(true)
            .foreign_keys(true);
        Ok(Self { options })
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    fn backend(&self) -> BackendKind {
        BackendKind::SQLite
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            advisory_locks: false,
            savepoints: true,
            for_update: false,
        }
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::NumberedQuestion
    }

    async fn connect(&self) -> DbResult<Box<dyn RawConnection>> {
        let conn = self
            .options
            .connect()
            .await
            .map_err(|e| connect_error(BackendKind::SQLite, e))?;
        debug!("Opened SQLite connection");
        Ok(Box::new(SqliteLink { conn }))
    }
}

pub(super) struct SqliteLink {
    conn: SqliteConnection,
}

impl_raw_connection!(SqliteLink, bind_sqlite_value, {});
