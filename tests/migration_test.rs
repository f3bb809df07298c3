//! Integration tests for the migration engine against SQLite.
//!
//! Tests verify that:
//! - Re-running the foreground phase skips applied units
//! - A failing or invalid unit rolls back and later runs resume from it
//! - The foreground phase honours its timeout
//! - The data load runs at most once
//! - The advisory lock brackets the foreground phase and is always released
//! - Background migrations run after the foreground phase and resume after
//!   cancellation
//! - The directory source and the `Database` facade work end to end

mod common;

use async_trait::async_trait;
use common::{locking_pool, sqlite_url};
use pooled_db::config::{Config, MigrationTimeout};
use pooled_db::db::{Connection, ConverterRegistry, Pool};
use pooled_db::error::{DbError, DbResult, MigrationFailureReason};
use pooled_db::migration::{
    BackgroundOutcome, DataLoader, Migration, MigrationSet, Migrator, StateTable,
};
use pooled_db::models::{BackendKind, Value};
use pooled_db::Database;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Creates `t`, inserts one row and checks there is exactly one.
struct CreateTable;

#[async_trait]
impl Migration for CreateTable {
    async fn migrate(&self, conn: &Connection) -> DbResult<()> {
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, note TEXT)", ())
            .await?;
        conn.execute("INSERT INTO t (note) VALUES (:note)", [("note", "seed")])
            .await?;
        Ok(())
    }

    async fn valid_migration(&self, conn: &Connection) -> DbResult<bool> {
        let count = conn.fetch_val("SELECT COUNT(*) FROM t", ()).await?;
        Ok(count == Some(Value::Integer(1)))
    }
}

struct Failing;

#[async_trait]
impl Migration for Failing {
    async fn migrate(&self, conn: &Connection) -> DbResult<()> {
        conn.execute("CREATE TABLE half_done (id INTEGER)", ()).await?;
        Err(DbError::internal("boom"))
    }
}

struct AddColumn;

#[async_trait]
impl Migration for AddColumn {
    async fn migrate(&self, conn: &Connection) -> DbResult<()> {
        conn.execute("ALTER TABLE t ADD COLUMN extra TEXT", ()).await?;
        Ok(())
    }
}

struct NeverValid;

#[async_trait]
impl Migration for NeverValid {
    async fn migrate(&self, conn: &Connection) -> DbResult<()> {
        conn.execute("CREATE TABLE rejected (id INTEGER)", ()).await?;
        Ok(())
    }

    async fn valid_migration(&self, _conn: &Connection) -> DbResult<bool> {
        Ok(false)
    }
}

struct Slow(Duration);

#[async_trait]
impl Migration for Slow {
    async fn migrate(&self, conn: &Connection) -> DbResult<()> {
        conn.execute("CREATE TABLE slow (id INTEGER)", ()).await?;
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

/// Backfills `t.note`; optionally takes a while first.
struct Backfill {
    delay: Duration,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Migration for Backfill {
    async fn migrate(&self, conn: &Connection) -> DbResult<()> {
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, note TEXT)", ())
            .await?;
        conn.execute("INSERT INTO t (note) VALUES (NULL)", ()).await?;
        Ok(())
    }

    fn has_background(&self) -> bool {
        true
    }

    async fn background_migrate(&self, conn: &Connection) -> DbResult<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        conn.execute("UPDATE t SET note = 'filled' WHERE note IS NULL", ())
            .await?;
        Ok(())
    }
}

/// Creates `counted` after a short pause, counting how often it ran.
struct Counted(Arc<AtomicUsize>);

#[async_trait]
impl Migration for Counted {
    async fn migrate(&self, conn: &Connection) -> DbResult<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        conn.execute("CREATE TABLE counted (id INTEGER)", ()).await?;
        Ok(())
    }
}

struct CountingLoader(Arc<AtomicUsize>);

#[async_trait]
impl DataLoader for CountingLoader {
    async fn load(&self, conn: &Connection) -> DbResult<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        conn.execute("INSERT INTO t (note) VALUES ('loaded')", ()).await?;
        Ok(())
    }
}

async fn connect(url: &str) -> Pool {
    Pool::connect(url, Arc::new(ConverterRegistry::with_defaults()))
        .await
        .unwrap()
}

async fn applied(pool: &Pool) -> Vec<i64> {
    let conn = pool.acquire().await.unwrap();
    let state = StateTable::new("schema_migration", BackendKind::SQLite).unwrap();
    let applied = state
        .applied(&conn)
        .await
        .unwrap()
        .into_iter()
        .map(|unit| unit.sequence)
        .collect();
    conn.release().await;
    applied
}

async fn table_exists(pool: &Pool, name: &str) -> bool {
    let conn = pool.acquire().await.unwrap();
    let found = conn
        .fetch_first(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = :name",
            [("name", name)],
        )
        .await
        .unwrap()
        .is_some();
    conn.release().await;
    found
}

#[tokio::test]
async fn test_rerun_skips_applied_units() {
    let (url, _dir) = sqlite_url();
    let pool = connect(&url).await;
    let migrator = Migrator::new(MigrationSet::new().with(CreateTable));

    let first = migrator.run(&pool).await.unwrap();
    assert_eq!(first.applied, vec![0]);
    assert_eq!(first.already_applied, 0);

    for _ in 0..3 {
        let again = migrator.run(&pool).await.unwrap();
        assert!(again.applied.is_empty());
        assert_eq!(again.already_applied, 1);
    }
    assert_eq!(applied(&pool).await, vec![0]);

    // Unit 0 did not run again
    let conn = pool.acquire().await.unwrap();
    let rows = conn.fetch_val("SELECT COUNT(*) FROM t", ()).await.unwrap();
    assert_eq!(rows, Some(Value::Integer(1)));
}

#[tokio::test]
async fn test_failed_unit_rolls_back_and_retry_resumes() {
    let (url, _dir) = sqlite_url();
    let pool = connect(&url).await;

    let broken = Migrator::new(MigrationSet::new().with(CreateTable).with(Failing));
    let err = broken.run(&pool).await.unwrap_err();
    match err {
        DbError::MigrationFailed { sequence, reason } => {
            assert_eq!(sequence, 1);
            assert!(matches!(reason, MigrationFailureReason::Apply(_)));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(table_exists(&pool, "t").await);
    assert!(!table_exists(&pool, "half_done").await);
    assert_eq!(applied(&pool).await, vec![0]);

    let fixed = Migrator::new(MigrationSet::new().with(CreateTable).with(AddColumn));
    let report = fixed.run(&pool).await.unwrap();
    assert_eq!(report.applied, vec![1]);
    assert_eq!(report.already_applied, 1);
    assert_eq!(applied(&pool).await, vec![0, 1]);
}

#[tokio::test]
async fn test_invalid_unit_is_rolled_back() {
    let (url, _dir) = sqlite_url();
    let pool = connect(&url).await;

    let migrator = Migrator::new(MigrationSet::new().with(NeverValid));
    let err = migrator.run(&pool).await.unwrap_err();
    assert!(matches!(
        err,
        DbError::MigrationFailed {
            sequence: 0,
            reason: MigrationFailureReason::Invalid
        }
    ));
    assert!(!table_exists(&pool, "rejected").await);
    assert!(applied(&pool).await.is_empty());
}

#[tokio::test]
async fn test_foreground_timeout() {
    let (url, _dir) = sqlite_url();
    let pool = connect(&url).await;

    let slow = Migrator::new(MigrationSet::new().with(Slow(Duration::from_millis(500))))
        .with_timeout(Some(Duration::from_millis(50)));
    let err = slow.run(&pool).await.unwrap_err();
    assert!(matches!(
        err,
        DbError::MigrationTimeout { timeout } if timeout == Duration::from_millis(50)
    ));
    assert!(err.to_string().contains("50ms"));
    assert!(!table_exists(&pool, "slow").await);
    assert!(applied(&pool).await.is_empty());

    let unbounded = Migrator::new(MigrationSet::new().with(Slow(Duration::from_millis(10))))
        .with_timeout(None);
    assert_eq!(unbounded.run(&pool).await.unwrap().applied, vec![0]);
}

#[tokio::test]
async fn test_database_ahead_of_migrations() {
    let (url, _dir) = sqlite_url();
    let pool = connect(&url).await;

    Migrator::new(MigrationSet::new().with(CreateTable).with(AddColumn))
        .run(&pool)
        .await
        .unwrap();
    let err = Migrator::new(MigrationSet::new().with(CreateTable))
        .run(&pool)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DbError::DatabaseAhead {
            applied: 1,
            discovered: 1
        }
    ));
}

#[tokio::test]
async fn test_data_loaded_once() {
    let (url, _dir) = sqlite_url();
    let pool = connect(&url).await;
    let loads = Arc::new(AtomicUsize::new(0));

    let migrator = Migrator::new(MigrationSet::new().with(CreateTable))
        .with_data_loader(CountingLoader(Arc::clone(&loads)));
    assert!(migrator.run(&pool).await.unwrap().data_loaded);
    assert!(!migrator.run(&pool).await.unwrap().data_loaded);
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_custom_state_table() {
    let (url, _dir) = sqlite_url();
    let pool = connect(&url).await;

    Migrator::new(MigrationSet::new().with(CreateTable))
        .with_state_table("app_migrations")
        .run(&pool)
        .await
        .unwrap();
    assert!(table_exists(&pool, "app_migrations").await);
    assert!(table_exists(&pool, "app_migrations_data").await);
    assert!(!table_exists(&pool, "schema_migration").await);
}

#[tokio::test]
async fn test_background_runs_after_foreground() {
    let (url, _dir) = sqlite_url();
    let pool = connect(&url).await;
    let runs = Arc::new(AtomicUsize::new(0));
    let migrator = Migrator::new(MigrationSet::new().with(Backfill {
        delay: Duration::ZERO,
        runs: Arc::clone(&runs),
    }));

    // Background work refuses to start before the foreground phase
    assert!(
        migrator
            .start_background(&pool, CancellationToken::new())
            .await
            .is_err()
    );

    migrator.run(&pool).await.unwrap();
    let background = migrator
        .start_background(&pool, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(background.len(), 1);
    let outcomes = background.join().await;
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].1.is_completed());

    let conn = pool.acquire().await.unwrap();
    let note = conn.fetch_val("SELECT note FROM t", ()).await.unwrap();
    assert_eq!(note, Some(Value::Text("filled".to_string())));
    conn.release().await;

    // Completed work is not started again
    let again = migrator
        .start_background(&pool, CancellationToken::new())
        .await
        .unwrap();
    assert!(again.is_empty());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_background_is_retried() {
    let (url, _dir) = sqlite_url();
    let pool = connect(&url).await;
    let runs = Arc::new(AtomicUsize::new(0));

    let slow = Migrator::new(MigrationSet::new().with(Backfill {
        delay: Duration::from_secs(30),
        runs: Arc::clone(&runs),
    }));
    slow.run(&pool).await.unwrap();
    let background = slow
        .start_background(&pool, CancellationToken::new())
        .await
        .unwrap();
    common::eventually(|| runs.load(Ordering::SeqCst) == 1).await;
    let outcomes = background.shutdown().await;
    assert!(matches!(outcomes[0].1, BackgroundOutcome::Cancelled));

    let quick = Migrator::new(MigrationSet::new().with(Backfill {
        delay: Duration::ZERO,
        runs: Arc::clone(&runs),
    }));
    let outcomes = quick
        .start_background(&pool, CancellationToken::new())
        .await
        .unwrap()
        .join()
        .await;
    assert!(outcomes[0].1.is_completed());
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_database_facade_with_directory() {
    let (url, dir) = sqlite_url();
    let migrations = dir.path().join("migrations");
    std::fs::create_dir(&migrations).unwrap();
    std::fs::write(
        migrations.join("0.sql"),
        "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT);
         INSERT INTO notes (body) VALUES ('first');",
    )
    .unwrap();
    std::fs::write(
        migrations.join("0.valid.sql"),
        "SELECT COUNT(*) = 1 FROM notes",
    )
    .unwrap();
    std::fs::write(
        migrations.join("1.sql"),
        "ALTER TABLE notes ADD COLUMN tag TEXT",
    )
    .unwrap();
    std::fs::write(
        migrations.join("1.background.sql"),
        "UPDATE notes SET tag = 'old' WHERE tag IS NULL",
    )
    .unwrap();
    let data = dir.path().join("data.sql");
    std::fs::write(&data, "INSERT INTO notes (body, tag) VALUES ('seed', 'new')").unwrap();

    let config = Config {
        migrations: migrations.display().to_string(),
        data_path: Some(data),
        migration_timeout: MigrationTimeout(Some(Duration::from_secs(10))),
        ..Config::for_url(url.clone())
    };

    let db = Database::new(config.clone());
    let report = db.startup().await.unwrap().unwrap();
    assert_eq!(report.applied, vec![0, 1]);
    assert!(report.data_loaded);
    let outcomes = db.take_background().unwrap().join().await;
    assert!(outcomes.iter().all(|(_, o)| o.is_completed()));

    let conn = db.connection().await.unwrap();
    let untagged = conn
        .fetch_val("SELECT COUNT(*) FROM notes WHERE tag IS NULL", ())
        .await
        .unwrap();
    assert_eq!(untagged, Some(Value::Integer(0)));
    conn.release().await;
    db.shutdown().await;
    db.shutdown().await;

    // A restart applies nothing and loads nothing
    let db = Database::new(config);
    let report = db.startup().await.unwrap().unwrap();
    assert!(report.applied.is_empty());
    assert_eq!(report.already_applied, 2);
    assert!(!report.data_loaded);
    assert!(db.take_background().is_none());
    db.shutdown().await;
}

#[tokio::test]
async fn test_database_with_migrations_disabled() {
    let (url, _dir) = sqlite_url();
    let config = Config {
        migrations: "disabled".to_string(),
        ..Config::for_url(url)
    };
    let db = Database::new(config);
    assert!(db.startup().await.unwrap().is_none());
    let conn = db.connection().await.unwrap();
    assert!(conn.fetch_val("SELECT 1", ()).await.unwrap().is_some());
    conn.release().await;
    db.shutdown().await;
    assert!(matches!(db.connection().await, Err(DbError::PoolClosed)));
}

/// Position of the first entry satisfying `pred`.
fn position(entries: &[String], pred: impl Fn(&str) -> bool) -> usize {
    entries
        .iter()
        .position(|e| pred(e.as_str()))
        .unwrap_or_else(|| panic!("no matching entry in {entries:?}"))
}

#[tokio::test]
async fn test_lock_taken_before_state_table_and_released() {
    let (url, _dir) = sqlite_url();
    let (pool, log) = locking_pool(&url);

    let report = Migrator::new(MigrationSet::new().with(CreateTable))
        .run(&pool)
        .await
        .unwrap();
    assert_eq!(report.applied, vec![0]);

    let entries = log.entries();
    let lock = position(&entries, |e| e.starts_with("LOCK"));
    let state = position(&entries, |e| e.contains("schema_migration"));
    let unlock = position(&entries, |e| e.starts_with("UNLOCK"));
    assert_eq!(lock, 0);
    assert!(lock < state);
    assert!(state < unlock);
    assert_eq!(unlock, entries.len() - 1);
    assert!(!log.is_locked());
}

#[tokio::test]
async fn test_lock_released_after_failed_unit() {
    let (url, _dir) = sqlite_url();
    let (pool, log) = locking_pool(&url);

    let err = Migrator::new(MigrationSet::new().with(CreateTable).with(Failing))
        .run(&pool)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::MigrationFailed { sequence: 1, .. }));

    let calls = log.lock_calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].starts_with("LOCK"));
    assert!(calls[1].starts_with("UNLOCK"));
    assert!(!log.is_locked());

    // The failed unit's rollback precedes the unlock
    let entries = log.entries();
    let rollback = entries.iter().rposition(|e| e == "ROLLBACK").unwrap();
    assert!(rollback < entries.len() - 1);
}

#[tokio::test]
async fn test_lock_released_after_timeout() {
    let (url, _dir) = sqlite_url();
    let (pool, log) = locking_pool(&url);

    let err = Migrator::new(MigrationSet::new().with(Slow(Duration::from_millis(500))))
        .with_timeout(Some(Duration::from_millis(50)))
        .run(&pool)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::MigrationTimeout { .. }));
    assert!(!log.is_locked());
    assert_eq!(
        log.lock_calls().last().map(|e| e.starts_with("UNLOCK")),
        Some(true)
    );

    // The lock is free for the next run
    let report = Migrator::new(MigrationSet::new().with(CreateTable))
        .with_timeout(Some(Duration::from_secs(5)))
        .run(&pool)
        .await
        .unwrap();
    assert_eq!(report.applied, vec![0]);
}

#[tokio::test]
async fn test_concurrent_runs_apply_each_unit_once() {
    let (url, _dir) = sqlite_url();
    let (pool, log) = locking_pool(&url);
    let runs = Arc::new(AtomicUsize::new(0));
    let migrator = Migrator::new(MigrationSet::new().with(Counted(Arc::clone(&runs))));

    let (a, b) = tokio::join!(migrator.run(&pool), migrator.run(&pool));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let mut applied_by = vec![a.applied.clone(), b.applied.clone()];
    applied_by.sort();
    assert_eq!(applied_by, vec![vec![], vec![0]]);
    assert_eq!(a.already_applied + b.already_applied, 1);

    // Lock holders never overlap
    let calls = log.lock_calls();
    assert_eq!(calls.len(), 4);
    for pair in calls.chunks(2) {
        assert!(pair[0].starts_with("LOCK"));
        assert!(pair[1].starts_with("UNLOCK"));
    }
    assert!(!log.is_locked());
}
