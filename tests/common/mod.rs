//! In-memory backend for tests that need to observe what reaches the engine.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use pooled_db::PoolOptions;
use pooled_db::db::backend::{Capabilities, Driver, RawConnection, SqliteDriver};
use pooled_db::db::{Connection, ConnectionContext, ConverterRegistry, PlaceholderStyle, Pool};
use pooled_db::error::{DbError, DbResult};
use pooled_db::models::{BackendKind, Column, Row, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Shared record of everything the fake links saw.
#[derive(Debug, Default)]
pub struct Recorder {
    statements: Mutex<Vec<String>>,
    stored: Mutex<Vec<Value>>,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub fail_ping: AtomicBool,
}

impl Recorder {
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    pub fn stored(&self) -> Vec<Value> {
        self.stored.lock().unwrap().clone()
    }

    fn record(&self, sql: &str) {
        self.statements.lock().unwrap().push(sql.to_string());
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A driver whose links keep rows in memory.
///
/// `INSERT` statements store their first argument; every fetch returns one
/// row per stored value, in a single column reported as `column_type`.
#[derive(Debug)]
pub struct FakeDriver {
    pub recorder: Arc<Recorder>,
    pub column_type: String,
    pub delay: Duration,
    pub begin_delay: Duration,
    pub style: PlaceholderStyle,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            recorder: Arc::new(Recorder::default()),
            column_type: "text".to_string(),
            delay: Duration::ZERO,
            begin_delay: Duration::ZERO,
            style: PlaceholderStyle::Dollar,
        }
    }

    pub fn with_column_type(mut self, type_name: &str) -> Self {
        self.column_type = type_name.to_string();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make `BEGIN` take `delay` after the server has opened the transaction.
    pub fn with_begin_delay(mut self, delay: Duration) -> Self {
        self.begin_delay = delay;
        self
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn backend(&self) -> BackendKind {
        BackendKind::PostgreSQL
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            advisory_locks: false,
            savepoints: true,
            for_update: false,
        }
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        self.style
    }

    async fn connect(&self) -> DbResult<Box<dyn RawConnection>> {
        self.recorder.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeLink {
            recorder: Arc::clone(&self.recorder),
            columns: vec![Column::new("value", self.column_type.clone())].into(),
            delay: self.delay,
            begin_delay: self.begin_delay,
        }))
    }
}

struct FakeLink {
    recorder: Arc<Recorder>,
    columns: Arc<[Column]>,
    delay: Duration,
    begin_delay: Duration,
}

impl FakeLink {
    fn rows(&self) -> Vec<Row> {
        self.recorder
            .stored()
            .into_iter()
            .map(|value| Row::new(Arc::clone(&self.columns), vec![value]))
            .collect()
    }
}

#[async_trait]
impl RawConnection for FakeLink {
    async fn execute(&mut self, sql: &str, args: &[Value]) -> DbResult<u64> {
        self.recorder.enter();
        self.recorder.record(sql);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if sql.starts_with("INSERT") {
            if let Some(value) = args.first() {
                self.recorder.stored.lock().unwrap().push(value.clone());
            }
        }
        self.recorder.exit();
        Ok(1)
    }

    async fn execute_script(&mut self, sql: &str) -> DbResult<()> {
        self.recorder.record(sql);
        Ok(())
    }

    async fn fetch_all(&mut self, sql: &str, _args: &[Value]) -> DbResult<Vec<Row>> {
        self.recorder.record(sql);
        Ok(self.rows())
    }

    fn fetch_stream<'a>(
        &'a mut self,
        sql: &'a str,
        _args: &'a [Value],
    ) -> BoxStream<'a, DbResult<Row>> {
        self.recorder.record(sql);
        futures_util::stream::iter(self.rows().into_iter().map(Ok)).boxed()
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.recorder.record("BEGIN");
        if !self.begin_delay.is_zero() {
            tokio::time::sleep(self.begin_delay).await;
        }
        Ok(())
    }

    async fn ping(&mut self) -> DbResult<()> {
        if self.recorder.fail_ping.load(Ordering::SeqCst) {
            return Err(DbError::connection("link reset", "reconnect"));
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        self.recorder.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Ordered log of statements and advisory lock calls, shared by every link
/// of one [`LockingDriver`].
#[derive(Debug)]
pub struct LockLog {
    entries: Mutex<Vec<String>>,
    lock: Arc<Semaphore>,
}

impl LockLog {
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    /// Lock and unlock calls only.
    pub fn lock_calls(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.starts_with("LOCK") || e.starts_with("UNLOCK"))
            .collect()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.available_permits() == 0
    }

    fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }
}

/// A real SQLite driver with a process-local advisory lock bolted on, so the
/// locked foreground path runs against a real state table.
#[derive(Debug)]
pub struct LockingDriver {
    inner: SqliteDriver,
    pub log: Arc<LockLog>,
}

impl LockingDriver {
    pub fn new(url: &str) -> Self {
        Self {
            inner: SqliteDriver::new(url).unwrap(),
            log: Arc::new(LockLog {
                entries: Mutex::new(Vec::new()),
                lock: Arc::new(Semaphore::new(1)),
            }),
        }
    }
}

#[async_trait]
impl Driver for LockingDriver {
    fn backend(&self) -> BackendKind {
        self.inner.backend()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            advisory_locks: true,
            ..self.inner.capabilities()
        }
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        self.inner.placeholder_style()
    }

    async fn connect(&self) -> DbResult<Box<dyn RawConnection>> {
        Ok(Box::new(LockingLink {
            inner: self.inner.connect().await?,
            log: Arc::clone(&self.log),
            held: None,
        }))
    }
}

struct LockingLink {
    inner: Box<dyn RawConnection>,
    log: Arc<LockLog>,
    held: Option<OwnedSemaphorePermit>,
}

#[async_trait]
impl RawConnection for LockingLink {
    async fn execute(&mut self, sql: &str, args: &[Value]) -> DbResult<u64> {
        self.log.push(sql);
        self.inner.execute(sql, args).await
    }

    async fn execute_script(&mut self, sql: &str) -> DbResult<()> {
        self.log.push(sql);
        self.inner.execute_script(sql).await
    }

    async fn fetch_all(&mut self, sql: &str, args: &[Value]) -> DbResult<Vec<Row>> {
        self.log.push(sql);
        self.inner.fetch_all(sql, args).await
    }

    fn fetch_stream<'a>(
        &'a mut self,
        sql: &'a str,
        args: &'a [Value],
    ) -> BoxStream<'a, DbResult<Row>> {
        self.log.push(sql);
        self.inner.fetch_stream(sql, args)
    }

    async fn ping(&mut self) -> DbResult<()> {
        self.inner.ping().await
    }

    async fn advisory_lock(&mut self, key: i64) -> DbResult<()> {
        let permit = Arc::clone(&self.log.lock)
            .acquire_owned()
            .await
            .map_err(|_| DbError::internal("lock closed"))?;
        self.held = Some(permit);
        self.log.push(format!("LOCK {key}"));
        Ok(())
    }

    async fn advisory_unlock(&mut self, key: i64) -> DbResult<()> {
        match self.held.take() {
            Some(_) => {
                self.log.push(format!("UNLOCK {key}"));
                Ok(())
            }
            None => Err(DbError::internal("advisory lock not held")),
        }
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        // Session locks go with the session
        let LockingLink { inner, .. } = *self;
        inner.close().await
    }
}

/// A pool of two locking SQLite connections.
pub fn locking_pool(url: &str) -> (Pool, Arc<LockLog>) {
    let driver = LockingDriver::new(url);
    let log = Arc::clone(&driver.log);
    let options = PoolOptions {
        max_connections: Some(2),
        min_connections: Some(0),
        ..PoolOptions::default()
    };
    let pool = Pool::with_driver(
        Arc::new(driver),
        Arc::new(ConverterRegistry::with_defaults()),
        options,
    )
    .unwrap();
    (pool, log)
}

/// A standalone connection over a fake driver.
pub async fn fake_connection(driver: FakeDriver) -> (Connection, Arc<Recorder>) {
    let recorder = Arc::clone(&driver.recorder);
    let context = ConnectionContext::new(Arc::new(driver), Arc::new(ConverterRegistry::empty()));
    let conn = Connection::open(Arc::new(context)).await.unwrap();
    (conn, recorder)
}

/// A pool of `max` fake connections that opens nothing eagerly.
pub fn fake_pool(max: u32) -> (Pool, Arc<Recorder>) {
    fake_pool_with(FakeDriver::new(), max)
}

pub fn fake_pool_with(driver: FakeDriver, max: u32) -> (Pool, Arc<Recorder>) {
    let recorder = Arc::clone(&driver.recorder);
    let options = PoolOptions {
        max_connections: Some(max),
        min_connections: Some(0),
        acquire_timeout_secs: Some(5),
        ..PoolOptions::default()
    };
    let pool = Pool::with_driver(
        Arc::new(driver),
        Arc::new(ConverterRegistry::empty()),
        options,
    )
    .unwrap();
    (pool, recorder)
}

/// A fresh SQLite database file, removed when the guard drops.
pub fn sqlite_url() -> (String, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("test.db").display());
    (url, dir)
}

/// Poll `check` until it holds, yielding to spawned release tasks.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
