//! PostgreSQL adapter.

use super::{Capabilities, Driver, RawConnection, connect_error};
use crate::db::bind::PlaceholderStyle;
use crate::db::params::bind_postgres_value;
use crate::error::DbResult;
use crate::models::BackendKind;
use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use tracing::debug;

/// Opens `PgConnection`s.
#[derive(Debug, Clone)]
pub struct PostgresDriver {
    url: String,
}

impl PostgresDriver {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn backend(&self) -> BackendKind {
        BackendKind::PostgreSQL
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            advisory_locks: true,
            savepoints: true,
            for_update: true,
        }
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Dollar
    }

    fn casts_typed_params(&self) -> bool {
        true
    }

    async fn connect(&self) -> DbResult<Box<dyn RawConnection>> {
        let conn = PgConnection::connect(&self.url)
            .await
            .map_err(|e| connect_error(BackendKind::PostgreSQL, e))?;
        debug!("Opened PostgreSQL connection");
        Ok(Box::new(PgLink { conn }))
    }
}

pub(super) struct PgLink {
    conn: PgConnection,
}

impl_raw_connection!(PgLink, bind_postgres_value, {
    async fn advisory_lock(&mut self, key: i64) -> DbResult<()> {
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(key)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn advisory_unlock(&mut self, key: i64) -> DbResult<()> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }
});
