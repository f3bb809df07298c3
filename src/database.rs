//! Database facade.
//!
//! [`Database`] ties configuration, the converter registry, the pool and the
//! migration engine together:
//!
//! ```ignore
//! let db = Database::new(Config::for_url("sqlite:app.db"));
//! db.startup().await?;           // migrations, then background tasks
//! let conn = db.connection().await?;
//! conn.execute("INSERT INTO t (a) VALUES (:a)", [("a", 1)]).await?;
//! conn.release().await;
//! db.shutdown().await;
//! ```
//!
//! Business code gets connections explicitly from [`Database::connection`];
//! nothing is attached to ambient state.

use crate::config::Config;
use crate::db::{ConverterRegistry, Pool, PoolStatus, PooledConnection};
use crate::error::{DbError, DbResult};
use crate::migration::{
    BackgroundMigrations, DataLoader, DirectorySource, MigrationReport, MigrationSet, Migrator,
    SqlDataLoader,
};
use crate::models::{Value, ValueKind};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Where migration units come from.
enum MigrationsSource {
    Config,
    Units(MigrationSet),
    Disabled,
}

/// A configured database with its pool and migrations.
pub struct Database {
    config: Config,
    registry: Arc<ConverterRegistry>,
    migrations: MigrationsSource,
    data_loader: Option<Arc<dyn DataLoader>>,
    pool: OnceCell<Pool>,
    background: Mutex<Option<BackgroundMigrations>>,
    shutdown_token: CancellationToken,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("config", &self.config)
            .field("pool", &self.pool.get())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Create a database from configuration. Nothing connects until
    /// [`Database::startup`].
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: Arc::new(ConverterRegistry::with_defaults()),
            migrations: MigrationsSource::Config,
            data_loader: None,
            pool: OnceCell::new(),
            background: Mutex::new(None),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Use in-code migration units instead of the configured folder.
    pub fn with_migrations(mut self, units: MigrationSet) -> Self {
        self.migrations = MigrationsSource::Units(units);
        self
    }

    /// Skip the migration engine entirely.
    pub fn without_migrations(mut self) -> Self {
        self.migrations = MigrationsSource::Disabled;
        self
    }

    /// Use an in-code data loader instead of the configured data file.
    pub fn with_data_loader(mut self, loader: impl DataLoader + 'static) -> Self {
        self.data_loader = Some(Arc::new(loader));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConverterRegistry> {
        &self.registry
    }

    /// Register a converter for `type_name`.
    ///
    /// Must happen before the type is first used; later registrations fail.
    pub fn set_converter<E, D>(
        &self,
        type_name: &str,
        encode: E,
        decode: D,
        schema: Option<&str>,
        native: Option<ValueKind>,
    ) -> DbResult<()>
    where
        E: Fn(&Value) -> DbResult<Value> + Send + Sync + 'static,
        D: Fn(&Value) -> DbResult<Value> + Send + Sync + 'static,
    {
        self.registry
            .register(type_name, encode, decode, schema, native)
    }

    /// The pool, once [`Database::startup`] has run.
    pub fn pool(&self) -> DbResult<&Pool> {
        self.pool.get().ok_or(DbError::PoolClosed)
    }

    pub fn status(&self) -> Option<PoolStatus> {
        self.pool.get().map(Pool::status)
    }

    fn migrator(&self) -> DbResult<Option<Migrator>> {
        let units = match &self.migrations {
            MigrationsSource::Disabled => None,
            MigrationsSource::Units(units) => Some(units.clone()),
            MigrationsSource::Config => match self.config.migrations_folder() {
                Some(folder) => Some(DirectorySource::new(folder).discover()?),
                None => None,
            },
        };

        let loader = self.data_loader.clone().or_else(|| {
            self.config
                .data_path
                .as_ref()
                .map(|path| Arc::new(SqlDataLoader::new(path)) as Arc<dyn DataLoader>)
        });

        if units.is_none() && loader.is_none() {
            return Ok(None);
        }
        let mut migrator = Migrator::new(units.unwrap_or_default())
            .with_state_table(&self.config.state_table)
            .with_timeout(self.config.migration_timeout.0);
        if let Some(loader) = loader {
            migrator = migrator.with_shared_data_loader(loader);
        }
        Ok(Some(migrator))
    }

    /// Connect, run foreground migrations and the data load, then start
    /// background migrations.
    ///
    /// A failed or timed-out foreground phase fails startup.
    pub async fn startup(&self) -> DbResult<Option<MigrationReport>> {
        self.config.validate()?;
        let url = self.config.database_url()?;
        let pool = self
            .pool
            .get_or_try_init(|| Pool::connect(url, Arc::clone(&self.registry)))
            .await?;

        let Some(migrator) = self.migrator()? else {
            info!("Migrations disabled");
            return Ok(None);
        };
        let report = migrator.run(pool).await?;

        let background = migrator
            .start_background(pool, self.shutdown_token.child_token())
            .await?;
        if !background.is_empty() {
            *self.lock_background() = Some(background);
        }
        Ok(Some(report))
    }

    fn lock_background(&self) -> std::sync::MutexGuard<'_, Option<BackgroundMigrations>> {
        self.background.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take background tasks off the facade, e.g. to wait for them.
    pub fn take_background(&self) -> Option<BackgroundMigrations> {
        self.lock_background().take()
    }

    /// Acquire a connection from the pool.
    pub async fn connection(&self) -> DbResult<PooledConnection> {
        self.pool()?.acquire().await
    }

    /// Cancel background migrations and drain the pool.
    ///
    /// Waits up to the configured close timeout for in-use connections.
    /// Calling it twice is a no-op.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        if let Some(background) = self.take_background() {
            let outcomes = background.join().await;
            let unfinished = outcomes.iter().filter(|(_, o)| !o.is_completed()).count();
            if unfinished > 0 {
                warn!(unfinished, "Background migrations did not complete before shutdown");
            }
        }
        if let Some(pool) = self.pool.get() {
            pool.disconnect(self.config.close_timeout_duration()).await;
        }
    }
}
