//! Forward-only migration engine.
//!
//! A [`Migrator`] applies numbered units in order. The foreground phase runs
//! before traffic is admitted: under the engine's advisory lock where one
//! exists, one transaction per unit, the whole phase bounded by a timeout.
//! Background work runs afterwards as supervised tasks, see [`background`].
//!
//! Each unit moves `pending → applying → applied`, or `applying →
//! rolled_back` when its apply step fails or its validation returns false.
//! A failed phase leaves every earlier unit applied; the next run resumes at
//! the first pending unit.

pub mod background;
pub mod source;
pub mod state;

pub use background::{BackgroundMigrations, BackgroundOutcome};
pub use source::{DirectorySource, MigrationSet, SqlDataLoader, SqlMigration};
pub use state::{AppliedUnit, StateTable};

use crate::config::DEFAULT_STATE_TABLE_NAME;
use crate::db::{Connection, Pool};
use crate::error::{DbError, DbResult, MigrationFailureReason};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Sequence reported when the one-time data load fails.
pub const DATA_LOAD_SEQUENCE: i64 = -1;

/// One migration unit.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Foreground change, run inside the unit's transaction.
    async fn migrate(&self, conn: &Connection) -> DbResult<()>;

    /// Whether [`Migration::background_migrate`] has work to do.
    fn has_background(&self) -> bool {
        false
    }

    /// Idempotent change run after every foreground unit is applied,
    /// outside any transaction. May run concurrently on several instances.
    async fn background_migrate(&self, _conn: &Connection) -> DbResult<()> {
        Ok(())
    }

    /// Checked after `migrate`, inside the same transaction.
    async fn valid_migration(&self, _conn: &Connection) -> DbResult<bool> {
        Ok(true)
    }
}

/// A one-time data load run after the foreground phase.
#[async_trait]
pub trait DataLoader: Send + Sync {
    async fn load(&self, conn: &Connection) -> DbResult<()>;
}

/// Result of the apply and validate steps of one unit.
#[derive(Debug)]
pub enum UnitOutcome {
    Applied,
    Failed(DbError),
    Invalid,
}

impl UnitOutcome {
    async fn of(unit: &dyn Migration, conn: &Connection) -> Self {
        if let Err(e) = unit.migrate(conn).await {
            return Self::Failed(e);
        }
        match unit.valid_migration(conn).await {
            Ok(true) => Self::Applied,
            Ok(false) => Self::Invalid,
            Err(e) => Self::Failed(e),
        }
    }
}

/// What a foreground run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Units applied by this run, in order.
    pub applied: Vec<i64>,
    /// Units found already applied.
    pub already_applied: usize,
    /// Whether this run performed the one-time data load.
    pub data_loaded: bool,
}

/// Stable advisory lock key for a state table.
fn lock_key(state_table: &str) -> i64 {
    // FNV-1a
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in "pooled_db:".bytes().chain(state_table.bytes()) {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash as i64
}

/// Applies a [`MigrationSet`] against a pool.
#[derive(Clone)]
pub struct Migrator {
    units: MigrationSet,
    state_table: String,
    timeout: Option<Duration>,
    data_loader: Option<Arc<dyn DataLoader>>,
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("units", &self.units.len())
            .field("state_table", &self.state_table)
            .field("timeout", &self.timeout)
            .field("data_loader", &self.data_loader.is_some())
            .finish()
    }
}

impl Migrator {
    pub fn new(units: MigrationSet) -> Self {
        Self {
            units,
            state_table: DEFAULT_STATE_TABLE_NAME.to_string(),
            timeout: Some(Duration::from_secs(
                crate::config::DEFAULT_MIGRATION_TIMEOUT_SECS,
            )),
            data_loader: None,
        }
    }

    pub fn with_state_table(mut self, name: impl Into<String>) -> Self {
        self.state_table = name.into();
        self
    }

    /// Bound the foreground phase. `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_data_loader(mut self, loader: impl DataLoader + 'static) -> Self {
        self.data_loader = Some(Arc::new(loader));
        self
    }

    pub fn with_shared_data_loader(mut self, loader: Arc<dyn DataLoader>) -> Self {
        self.data_loader = Some(loader);
        self
    }

    pub fn units(&self) -> &MigrationSet {
        &self.units
    }

    fn state(&self, pool: &Pool) -> DbResult<StateTable> {
        StateTable::new(&self.state_table, pool.backend())
    }

    /// Run the foreground phase and the one-time data load.
    ///
    /// Fails with [`DbError::MigrationTimeout`] when the configured bound is
    /// exceeded; the unit in progress is rolled back.
    pub async fn run(&self, pool: &Pool) -> DbResult<MigrationReport> {
        let state = self.state(pool)?;
        let conn = pool.acquire().await?;

        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.run_exclusive(&conn, &state)).await
            {
                Ok(result) => result,
                Err(_) => {
                    error!(timeout_ms = limit.as_millis() as u64, "Foreground migrations timed out");
                    self.recover_after_timeout(&conn).await;
                    Err(DbError::MigrationTimeout { timeout: limit })
                }
            },
            None => self.run_exclusive(&conn, &state).await,
        };

        conn.release().await;
        result
    }

    /// Roll back the interrupted unit and drop the advisory lock if held.
    async fn recover_after_timeout(&self, conn: &Connection) {
        if !conn.reset().await {
            return;
        }
        if conn.capabilities().advisory_locks {
            if let Err(e) = conn.advisory_unlock(lock_key(&self.state_table)).await {
                warn!(error = %e, "Failed to release migration lock, discarding connection");
                conn.state().mark_broken();
            }
        }
    }

    async fn run_exclusive(&self, conn: &Connection, state: &StateTable) -> DbResult<MigrationReport> {
        let locked = conn.capabilities().advisory_locks;
        let key = lock_key(&self.state_table);
        if locked {
            debug!(lock_key = key, "Waiting for migration lock");
            conn.advisory_lock(key).await?;
        } else {
            info!(
                backend = %conn.backend(),
                "No advisory locks on this backend, assuming a single migrating process"
            );
        }

        let result = self.run_locked(conn, state).await;

        // Leftover scopes from an error path must be gone before unlocking
        if locked && conn.reset().await {
            if let Err(e) = conn.advisory_unlock(key).await {
                warn!(error = %e, "Failed to release migration lock, discarding connection");
                conn.state().mark_broken();
            }
        }
        result
    }

    async fn run_locked(&self, conn: &Connection, state: &StateTable) -> DbResult<MigrationReport> {
        state.ensure(conn).await?;

        let last = state.last_applied(conn).await?;
        let discovered = self.units.len();
        if last >= discovered as i64 {
            return Err(DbError::DatabaseAhead {
                applied: last,
                discovered,
            });
        }

        let mut report = MigrationReport {
            already_applied: (last + 1) as usize,
            ..MigrationReport::default()
        };
        for (index, unit) in self.units.units().iter().enumerate().skip(report.already_applied) {
            let sequence = index as i64;
            self.apply_unit(conn, state, sequence, unit.as_ref()).await?;
            report.applied.push(sequence);
        }
        info!(
            applied = report.applied.len(),
            already_applied = report.already_applied,
            "Foreground migrations complete"
        );

        if let Some(loader) = &self.data_loader {
            report.data_loaded = self.load_data(conn, state, loader.as_ref()).await?;
        }
        Ok(report)
    }

    async fn apply_unit(
        &self,
        conn: &Connection,
        state: &StateTable,
        sequence: i64,
        unit: &dyn Migration,
    ) -> DbResult<()> {
        debug!(sequence, "Applying migration");
        let tx = conn.transaction().await?;

        let reason = match UnitOutcome::of(unit, &tx).await {
            UnitOutcome::Applied => {
                state.record_applied(&tx, sequence).await?;
                tx.commit().await?;
                info!(sequence, "Migration applied");
                return Ok(());
            }
            UnitOutcome::Failed(e) => MigrationFailureReason::Apply(e.to_string()),
            UnitOutcome::Invalid => MigrationFailureReason::Invalid,
        };

        if let Err(e) = tx.rollback().await {
            warn!(sequence, error = %e, "Rollback of failed migration failed");
        }
        error!(sequence, reason = %reason, "Migration rolled back");
        Err(DbError::migration_failed(sequence, reason))
    }

    async fn load_data(
        &self,
        conn: &Connection,
        state: &StateTable,
        loader: &dyn DataLoader,
    ) -> DbResult<bool> {
        let tx = conn.transaction().await?;
        if state.data_loaded(&tx, tx.supports_for_update()).await? {
            tx.commit().await?;
            debug!("Data already loaded");
            return Ok(false);
        }

        if let Err(e) = loader.load(&tx).await {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback of failed data load failed");
            }
            return Err(DbError::migration_failed(
                DATA_LOAD_SEQUENCE,
                MigrationFailureReason::DataLoad(e.to_string()),
            ));
        }
        state.mark_data_loaded(&tx).await?;
        tx.commit().await?;
        info!("Data loaded");
        Ok(true)
    }

    /// Start background tasks for every unit whose background work has not
    /// completed. Fails while foreground units are still pending.
    pub async fn start_background(
        &self,
        pool: &Pool,
        token: CancellationToken,
    ) -> DbResult<BackgroundMigrations> {
        let state = self.state(pool)?;
        let applied = {
            let conn = pool.acquire().await?;
            state.ensure(&conn).await?;
            let applied = state.applied(&conn).await?;
            conn.release().await;
            applied
        };

        if applied.len() < self.units.len() {
            return Err(DbError::internal(format!(
                "{} foreground migrations are still pending",
                self.units.len() - applied.len()
            )));
        }

        let pending: Vec<_> = applied
            .iter()
            .filter(|unit| !unit.background_completed)
            .filter_map(|unit| {
                let migration = self.units.units().get(unit.sequence as usize)?;
                migration
                    .has_background()
                    .then(|| (unit.sequence, Arc::clone(migration)))
            })
            .collect();
        info!(tasks = pending.len(), "Starting background migrations");
        Ok(BackgroundMigrations::spawn(pool, &state, pending, token))
    }
}
