//! Transactions.
//!
//! A [`Transaction`] is a scope on a [`Connection`]. The outermost scope issues
//! `BEGIN`/`COMMIT`/`ROLLBACK`; nested scopes use savepoints on engines that
//! have them. A transaction dereferences to its connection, so statements run
//! through it directly.
//!
//! Dropping a transaction without committing or rolling back records a
//! pending rollback; the connection applies it before its next statement and
//! the pool applies it before the connection is handed out again.

use crate::db::connection::{Connection, InFlight, observe};
use crate::error::{DbError, DbResult};
use std::ops::Deref;
use tracing::debug;
use uuid::Uuid;

/// An open transaction scope.
#[derive(Debug)]
pub struct Transaction<'c> {
    conn: &'c Connection,
    /// Depth of this scope (1 = outermost).
    depth: usize,
    force_rollback: bool,
    finished: bool,
}

impl<'c> Transaction<'c> {
    /// Open a scope on `conn`. The guard is held for the BEGIN (or
    /// SAVEPOINT) statement only.
    pub(crate) async fn begin(conn: &'c Connection, force_rollback: bool) -> DbResult<Self> {
        let mut link = conn.link().lock().await;
        link.settle(conn.state()).await?;

        let depth = link.depth + 1;
        // Recorded first so a cancelled BEGIN still counts as an open scope
        link.depth = depth;
        let savepoint = (depth > 1 && conn.capabilities().savepoints)
            .then(|| format!("sp_{}", Uuid::new_v4().simple()));
        if let Some(name) = &savepoint {
            link.savepoints.push(name.clone());
        }

        let in_flight = InFlight::new(conn.state());
        let result = match (link.raw(), &savepoint) {
            (Err(e), _) => Err(e),
            (Ok(raw), None) if depth == 1 => raw.begin().await,
            (Ok(raw), Some(name)) => raw.savepoint(name).await,
            (Ok(_), None) => Ok(()),
        };
        in_flight.done();

        if let Err(e) = observe(conn.state(), conn.close_on_fatal(), result) {
            link.depth = depth - 1;
            if savepoint.is_some() {
                link.savepoints.pop();
            }
            return Err(e);
        }
        debug!(connection_id = conn.id(), depth, force_rollback, "Transaction started");

        Ok(Self {
            conn,
            depth,
            force_rollback,
            finished: false,
        })
    }

    /// Nesting depth of this scope (1 = outermost).
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_force_rollback(&self) -> bool {
        self.force_rollback
    }

    /// The connection this transaction runs on.
    pub fn connection(&self) -> &'c Connection {
        self.conn
    }

    /// Commit this scope, or roll it back when force-rollback is set.
    pub async fn commit(mut self) -> DbResult<()> {
        let result = if self.force_rollback {
            self.finish_rollback().await
        } else {
            self.finish_commit().await
        };
        self.finished = true;
        result
    }

    /// Roll back this scope.
    pub async fn rollback(mut self) -> DbResult<()> {
        let result = self.finish_rollback().await;
        self.finished = true;
        result
    }

    async fn finish_commit(&mut self) -> DbResult<()> {
        let conn = self.conn;
        let mut link = conn.link().lock().await;
        link.settle(conn.state()).await?;
        if link.depth != self.depth {
            conn.state().request_rollback_to(self.depth - 1);
            return Err(DbError::transaction(format!(
                "cannot commit scope at depth {} while depth {} is open",
                self.depth, link.depth
            )));
        }

        let in_flight = InFlight::new(conn.state());
        if self.depth == 1 {
            let result = match link.raw() {
                Ok(raw) => raw.commit().await,
                Err(e) => Err(e),
            };
            in_flight.done();
            // A failed COMMIT ends the transaction too
            link.depth = 0;
            link.savepoints.clear();
            observe(conn.state(), conn.close_on_fatal(), result)?;
        } else {
            let name = link.savepoints.pop();
            link.depth -= 1;
            let result = match (name, link.raw()) {
                (Some(name), Ok(raw)) => raw.release_savepoint(&name).await,
                (Some(_), Err(e)) => Err(e),
                (None, _) => Ok(()),
            };
            in_flight.done();
            observe(conn.state(), conn.close_on_fatal(), result)?;
        }
        debug!(connection_id = conn.id(), depth = self.depth, "Transaction committed");
        Ok(())
    }

    async fn finish_rollback(&mut self) -> DbResult<()> {
        let conn = self.conn;
        let mut link = conn.link().lock().await;
        link.settle(conn.state()).await?;
        if link.depth < self.depth {
            // Already rolled back by an outer scope or a settled abandonment
            return Ok(());
        }
        if let Err(e) = link.rollback_to(self.depth - 1, conn.state()).await {
            conn.state().mark_broken();
            return Err(e);
        }
        debug!(connection_id = conn.id(), depth = self.depth, "Transaction rolled back");
        Ok(())
    }
}

impl Deref for Transaction<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                connection_id = self.conn.id(),
                depth = self.depth,
                "Transaction dropped without commit or rollback"
            );
            self.conn.state().request_rollback_to(self.depth - 1);
        }
    }
}
