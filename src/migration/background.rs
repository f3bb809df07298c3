//! Background migration supervision.
//!
//! Each background unit runs as its own task on its own pooled connection,
//! outside any transaction. Cancelling stops the task where it stands; since
//! completion is only recorded after the work finishes, a cancelled unit runs
//! again from the start on the next startup.

use crate::db::Pool;
use crate::error::{DbError, DbResult, MigrationFailureReason};
use crate::migration::Migration;
use crate::migration::state::StateTable;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How a background task ended.
#[derive(Debug)]
pub enum BackgroundOutcome {
    Completed,
    Failed(DbError),
    Cancelled,
}

impl BackgroundOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Handle to the running background tasks.
#[derive(Debug)]
pub struct BackgroundMigrations {
    token: CancellationToken,
    tasks: JoinSet<(i64, BackgroundOutcome)>,
}

impl BackgroundMigrations {
    pub(crate) fn spawn(
        pool: &Pool,
        state: &StateTable,
        units: Vec<(i64, Arc<dyn Migration>)>,
        token: CancellationToken,
    ) -> Self {
        let mut tasks = JoinSet::new();
        for (sequence, unit) in units {
            let pool = pool.clone();
            let state = state.clone();
            let token = token.clone();
            tasks.spawn(async move {
                let outcome = tokio::select! {
                    _ = token.cancelled() => BackgroundOutcome::Cancelled,
                    result = run_unit(&pool, &state, sequence, unit.as_ref()) => match result {
                        Ok(()) => BackgroundOutcome::Completed,
                        Err(e) => BackgroundOutcome::Failed(e),
                    },
                };
                match &outcome {
                    BackgroundOutcome::Completed => {
                        info!(sequence, "Background migration completed")
                    }
                    BackgroundOutcome::Failed(e) => error!(
                        sequence,
                        error = %e,
                        "Background migration failed, it will be retried on next startup"
                    ),
                    BackgroundOutcome::Cancelled => {
                        warn!(sequence, "Background migration cancelled")
                    }
                }
                (sequence, outcome)
            });
        }
        Self { token, tasks }
    }

    /// Number of tasks still being tracked.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Ask every task to stop.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// A token that cancels these tasks, usable after `join` has taken self.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for every task to end, returning outcomes by sequence.
    pub async fn join(mut self) -> Vec<(i64, BackgroundOutcome)> {
        let mut outcomes = Vec::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "Background migration task panicked"),
            }
        }
        outcomes.sort_by_key(|(sequence, _)| *sequence);
        outcomes
    }

    /// Cancel every task and wait for them to stop.
    pub async fn shutdown(self) -> Vec<(i64, BackgroundOutcome)> {
        self.cancel();
        self.join().await
    }
}

async fn run_unit(
    pool: &Pool,
    state: &StateTable,
    sequence: i64,
    unit: &dyn Migration,
) -> DbResult<()> {
    let conn = pool.acquire().await?;
    info!(sequence, connection_id = conn.id(), "Background migration started");
    unit.background_migrate(&conn).await.map_err(|e| {
        DbError::migration_failed(sequence, MigrationFailureReason::Background(e.to_string()))
    })?;
    state.record_background_completed(&conn, sequence).await?;
    conn.release().await;
    Ok(())
}
