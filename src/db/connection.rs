//! Connections.
//!
//! A [`Connection`] wraps one physical link and serializes every operation on
//! it through an async mutex: callers may share a `&Connection` between tasks,
//! but statements on the same link never interleave. Parameter binding and
//! converter encoding happen before the guard is taken, so a statement that
//! fails to bind never reaches the engine.
//!
//! Transactions abandoned without commit or rollback leave a pending-rollback
//! marker that the connection settles before running its next statement.

use crate::db::backend::{Capabilities, Driver, RawConnection};
use crate::db::bind::bind;
use crate::db::converters::ConverterRegistry;
use crate::db::transaction::Transaction;
use crate::error::{Cardinality, DbError, DbResult};
use crate::models::{BackendKind, Params, Row, Value};
use async_stream::try_stream;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Marker for "no rollback pending".
const NO_PENDING: usize = usize::MAX;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Everything the connections of one pool share.
#[derive(Debug)]
pub struct ConnectionContext {
    pub driver: Arc<dyn Driver>,
    pub registry: Arc<ConverterRegistry>,
    /// Mark the connection broken on connection-level errors.
    pub close_on_fatal: bool,
}

impl ConnectionContext {
    pub fn new(driver: Arc<dyn Driver>, registry: Arc<ConverterRegistry>) -> Self {
        Self {
            driver,
            registry,
            close_on_fatal: false,
        }
    }
}

/// Flags readable without taking the guard.
#[derive(Debug)]
pub(crate) struct LinkState {
    /// Depth to roll back to before the next statement, or `NO_PENDING`.
    pending_rollback: AtomicUsize,
    broken: AtomicBool,
}

impl LinkState {
    /// Record that everything above `depth` must be rolled back.
    pub(crate) fn request_rollback_to(&self, depth: usize) {
        self.pending_rollback.fetch_min(depth, Ordering::SeqCst);
    }

    pub(crate) fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

/// The guarded part of a connection.
pub(crate) struct Link {
    raw: Option<Box<dyn RawConnection>>,
    /// Open transaction scopes (0 = none).
    pub(crate) depth: usize,
    /// Savepoint names for scopes 2..=depth.
    pub(crate) savepoints: Vec<String>,
}

impl Link {
    pub(crate) fn raw(&mut self) -> DbResult<&mut Box<dyn RawConnection>> {
        self.raw
            .as_mut()
            .ok_or_else(|| DbError::transaction("connection is closed"))
    }

    /// Apply any rollback left behind by an abandoned transaction.
    pub(crate) async fn settle(&mut self, state: &LinkState) -> DbResult<()> {
        let target = state.pending_rollback.load(Ordering::SeqCst);
        if target == NO_PENDING {
            return Ok(());
        }
        if target < self.depth {
            debug!(from = self.depth, to = target, "Rolling back abandoned transaction");
            if let Err(e) = self.rollback_to(target, state).await {
                state.mark_broken();
                return Err(e);
            }
        }
        // A lower target requested meanwhile stays pending
        let _ = state.pending_rollback.compare_exchange(
            target,
            NO_PENDING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        Ok(())
    }

    /// Roll back every scope above `target`.
    pub(crate) async fn rollback_to(&mut self, target: usize, state: &LinkState) -> DbResult<()> {
        let in_flight = InFlight::new(state);
        while self.depth > target {
            if target == 0 {
                self.raw()?.rollback().await?;
                self.depth = 0;
                self.savepoints.clear();
            } else {
                if let Some(name) = self.savepoints.last().cloned() {
                    let raw = self.raw()?;
                    raw.rollback_to_savepoint(&name).await?;
                    raw.release_savepoint(&name).await?;
                    self.savepoints.pop();
                }
                self.depth -= 1;
            }
        }
        in_flight.done();
        Ok(())
    }
}

/// Armed while a transaction-control statement is in flight.
///
/// If the future driving the statement is dropped first, the server-side
/// transaction state is unknown and the link is marked broken so the pool
/// discards it instead of handing it out again.
pub(crate) struct InFlight<'a> {
    state: &'a LinkState,
    armed: bool,
}

impl<'a> InFlight<'a> {
    pub(crate) fn new(state: &'a LinkState) -> Self {
        Self { state, armed: true }
    }

    pub(crate) fn done(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Transaction control statement interrupted, connection marked broken");
            self.state.mark_broken();
        }
    }
}

/// Record a connection-level failure when the pool discards such links.
pub(crate) fn observe<T>(state: &LinkState, close_on_fatal: bool, result: DbResult<T>) -> DbResult<T> {
    if let Err(e) = &result {
        if close_on_fatal && e.is_fatal() {
            warn!(error = %e, "Connection marked broken");
            state.mark_broken();
        }
    }
    result
}

/// Per-statement decode plan: which columns have a converter.
fn decode_plan(registry: &ConverterRegistry, row: &Row) -> Vec<bool> {
    row.columns()
        .iter()
        .map(|col| registry.has_decoder(&col.type_name))
        .collect()
}

fn apply_decoders(registry: &ConverterRegistry, plan: &[bool], row: Row) -> DbResult<Row> {
    if !plan.iter().any(|&has| has) {
        return Ok(row);
    }
    let (columns, values) = row.into_parts();
    let values = values
        .into_iter()
        .zip(plan)
        .zip(columns.iter())
        .map(|((value, &has), col)| {
            if has {
                registry.decode(&col.type_name, value)
            } else {
                Ok(value)
            }
        })
        .collect::<DbResult<Vec<_>>>()?;
    Ok(Row::new(columns, values))
}

/// One database connection.
pub struct Connection {
    id: u64,
    link: Arc<Mutex<Link>>,
    state: Arc<LinkState>,
    context: Arc<ConnectionContext>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("backend", &self.context.driver.backend())
            .field("broken", &self.is_broken())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a new physical link.
    pub async fn open(context: Arc<ConnectionContext>) -> DbResult<Self> {
        let raw = context.driver.connect().await?;
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = id, backend = %context.driver.backend(), "Connection opened");
        Ok(Self {
            id,
            link: Arc::new(Mutex::new(Link {
                raw: Some(raw),
                depth: 0,
                savepoints: Vec::new(),
            })),
            state: Arc::new(LinkState {
                pending_rollback: AtomicUsize::new(NO_PENDING),
                broken: AtomicBool::new(false),
            }),
            context,
        })
    }

    /// Process-unique identifier of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn backend(&self) -> BackendKind {
        self.context.driver.backend()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.context.driver.capabilities()
    }

    /// Whether the engine supports `SELECT ... FOR UPDATE`.
    pub fn supports_for_update(&self) -> bool {
        self.capabilities().for_update
    }

    /// Whether a connection-level failure has made this link unusable.
    pub fn is_broken(&self) -> bool {
        self.state.broken.load(Ordering::SeqCst)
    }

    /// Number of open transaction scopes.
    pub async fn transaction_depth(&self) -> usize {
        self.link.lock().await.depth
    }

    pub(crate) fn link(&self) -> &Arc<Mutex<Link>> {
        &self.link
    }

    pub(crate) fn state(&self) -> &Arc<LinkState> {
        &self.state
    }

    pub(crate) fn close_on_fatal(&self) -> bool {
        self.context.close_on_fatal
    }

    /// Rewrite `sql` to native placeholders and encode its arguments.
    fn prepare(&self, sql: &str, params: &Params) -> DbResult<(String, Vec<Value>)> {
        prepare(&self.context, sql, params)
    }

    /// Execute a statement, returning the number of affected rows.
    pub async fn execute(&self, sql: &str, params: impl Into<Params>) -> DbResult<u64> {
        let (sql, args) = self.prepare(sql, &params.into())?;
        let mut link = self.link.lock().await;
        link.settle(&self.state).await?;
        let result = link.raw()?.execute(&sql, &args).await;
        observe(&self.state, self.close_on_fatal(), result)
    }

    /// Execute a statement once per parameter set. An empty list is a no-op.
    pub async fn execute_many<P: Into<Params>>(
        &self,
        sql: &str,
        params: impl IntoIterator<Item = P>,
    ) -> DbResult<u64> {
        let prepared = params
            .into_iter()
            .map(|p| self.prepare(sql, &p.into()))
            .collect::<DbResult<Vec<_>>>()?;
        if prepared.is_empty() {
            return Ok(0);
        }

        let mut link = self.link.lock().await;
        link.settle(&self.state).await?;
        let mut affected = 0;
        for (sql, args) in &prepared {
            let result = link.raw()?.execute(sql, args).await;
            affected += observe(&self.state, self.close_on_fatal(), result)?;
        }
        Ok(affected)
    }

    /// Run unprepared SQL, possibly containing several statements.
    pub async fn execute_script(&self, sql: &str) -> DbResult<()> {
        let mut link = self.link.lock().await;
        link.settle(&self.state).await?;
        let result = link.raw()?.execute_script(sql).await;
        observe(&self.state, self.close_on_fatal(), result)
    }

    /// Fetch every row.
    pub async fn fetch_all(&self, sql: &str, params: impl Into<Params>) -> DbResult<Vec<Row>> {
        let (sql, args) = self.prepare(sql, &params.into())?;
        let rows = {
            let mut link = self.link.lock().await;
            link.settle(&self.state).await?;
            let result = link.raw()?.fetch_all(&sql, &args).await;
            observe(&self.state, self.close_on_fatal(), result)?
        };

        let Some(first) = rows.first() else {
            return Ok(rows);
        };
        let registry = &self.context.registry;
        let plan = decode_plan(registry, first);
        rows.into_iter()
            .map(|row| apply_decoders(registry, &plan, row))
            .collect()
    }

    /// Fetch the first row, if any.
    pub async fn fetch_first(&self, sql: &str, params: impl Into<Params>) -> DbResult<Option<Row>> {
        let mut rows = self.iterate(sql, params);
        rows.next().await.transpose()
    }

    /// Fetch the first row, if any. Same as [`Connection::fetch_first`].
    pub async fn fetch_one(&self, sql: &str, params: impl Into<Params>) -> DbResult<Option<Row>> {
        self.fetch_first(sql, params).await
    }

    /// Fetch exactly one row.
    ///
    /// Fails with a cardinality error when the statement returns no rows or
    /// more than one.
    pub async fn fetch_sole(&self, sql: &str, params: impl Into<Params>) -> DbResult<Row> {
        let mut rows = self.iterate(sql, params);
        let first = rows
            .next()
            .await
            .transpose()?
            .ok_or_else(|| DbError::cardinality(Cardinality::NoRows))?;
        if rows.next().await.transpose()?.is_some() {
            return Err(DbError::cardinality(Cardinality::MultipleRows));
        }
        Ok(first)
    }

    /// Fetch the first column of the first row, if any.
    pub async fn fetch_val(&self, sql: &str, params: impl Into<Params>) -> DbResult<Option<Value>> {
        Ok(self
            .fetch_first(sql, params)
            .await?
            .and_then(Row::into_first))
    }

    /// Stream rows lazily.
    ///
    /// The connection's guard is taken when the stream is first polled and
    /// held until it is exhausted or dropped; other operations on this
    /// connection wait until then.
    pub fn iterate(&self, sql: &str, params: impl Into<Params>) -> BoxStream<'static, DbResult<Row>> {
        let prepared = self.prepare(sql, &params.into());
        let link = Arc::clone(&self.link);
        let state = Arc::clone(&self.state);
        let context = Arc::clone(&self.context);

        Box::pin(try_stream! {
            let (sql, args) = prepared?;
            let mut guard = link.lock_owned().await;
            guard.settle(&state).await?;
            let raw = guard.raw()?;
            let mut rows = raw.fetch_stream(&sql, &args);
            let mut plan: Option<Vec<bool>> = None;
            while let Some(row) = rows.next().await {
                let row = observe(&state, context.close_on_fatal, row)?;
                let plan = plan.get_or_insert_with(|| decode_plan(&context.registry, &row));
                yield apply_decoders(&context.registry, plan, row)?;
            }
        })
    }

    /// Begin a transaction.
    pub async fn transaction(&self) -> DbResult<Transaction<'_>> {
        Transaction::begin(self, false).await
    }

    /// Begin a transaction, optionally forcing rollback on commit.
    pub async fn transaction_with(&self, force_rollback: bool) -> DbResult<Transaction<'_>> {
        Transaction::begin(self, force_rollback).await
    }

    /// Check the link is alive.
    pub async fn ping(&self) -> DbResult<()> {
        let mut link = self.link.lock().await;
        let result = link.raw()?.ping().await;
        observe(&self.state, self.close_on_fatal(), result)
    }

    /// Take the engine's advisory lock `key`, blocking until it is granted.
    pub async fn advisory_lock(&self, key: i64) -> DbResult<()> {
        let mut link = self.link.lock().await;
        let result = link.raw()?.advisory_lock(key).await;
        observe(&self.state, self.close_on_fatal(), result)
    }

    pub async fn advisory_unlock(&self, key: i64) -> DbResult<()> {
        let mut link = self.link.lock().await;
        let result = link.raw()?.advisory_unlock(key).await;
        observe(&self.state, self.close_on_fatal(), result)
    }

    /// Bring the connection back to idle: settle pending rollbacks and roll
    /// back any open transaction.
    ///
    /// Returns false when the connection must not be reused.
    pub(crate) async fn reset(&self) -> bool {
        if self.is_broken() {
            return false;
        }
        let mut link = self.link.lock().await;
        if link.settle(&self.state).await.is_err() {
            return false;
        }
        if link.depth > 0 {
            warn!(connection_id = self.id, depth = link.depth, "Connection released inside a transaction, rolling back");
            if let Err(e) = link.rollback_to(0, &self.state).await {
                warn!(connection_id = self.id, error = %e, "Rollback on release failed");
                self.state.mark_broken();
                return false;
            }
        }
        link.raw.is_some()
    }

    /// Close the physical link.
    pub async fn close(self) -> DbResult<()> {
        let raw = self.link.lock().await.raw.take();
        debug!(connection_id = self.id, "Connection closed");
        match raw {
            Some(raw) => raw.close().await,
            None => Ok(()),
        }
    }
}

pub(crate) fn prepare(
    context: &ConnectionContext,
    sql: &str,
    params: &Params,
) -> DbResult<(String, Vec<Value>)> {
    let driver = &context.driver;
    let bound = bind(
        sql,
        params,
        driver.placeholder_style(),
        driver.casts_typed_params(),
    )?;
    let args = bound
        .args
        .iter()
        .map(|param| context.registry.encode(param))
        .collect::<DbResult<Vec<_>>>()?;
    Ok((bound.sql, args))
}
