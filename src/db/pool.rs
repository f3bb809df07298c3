//! Connection pool management.
//!
//! This module provides a bounded pool of [`Connection`]s over any
//! [`Driver`]. Capacity is a fair semaphore, so waiters are served in FIFO
//! order and a waiter that times out or is cancelled leaves no trace. Links
//! are opened lazily; `min_connections` of them are opened eagerly on
//! [`Pool::connect`].
//!
//! The free and in-use sets live under one mutex that is never held across
//! an await. A connection only re-enters the free set after its transaction
//! state has been reset; broken connections are closed instead.

use crate::config::PoolOptions;
use crate::db::backend::{Driver, driver_for_url};
use crate::db::connection::{Connection, ConnectionContext};
use crate::db::converters::ConverterRegistry;
use crate::error::{DbError, DbResult};
use crate::models::{BackendKind, ConnectionUrl};
use std::collections::{HashSet, VecDeque};
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Point-in-time view of the pool, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStatus {
    /// Live physical links (idle + in use + opening).
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Callers blocked in `acquire`.
    pub waiting: usize,
    pub max_size: usize,
}

struct IdleConnection {
    conn: Connection,
    since: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleConnection>,
    in_use: HashSet<u64>,
    size: usize,
    closed: bool,
}

struct PoolShared {
    context: Arc<ConnectionContext>,
    options: PoolOptions,
    max_size: usize,
    state: Mutex<PoolState>,
    permits: Arc<Semaphore>,
    waiting: AtomicUsize,
    released: Notify,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Poisoning only happens if a holder panicked; the state is still consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status(&self) -> PoolStatus {
        let state = self.lock();
        PoolStatus {
            size: state.size,
            idle: state.idle.len(),
            in_use: state.in_use.len(),
            waiting: self.waiting.load(Ordering::SeqCst),
            max_size: self.max_size,
        }
    }

    /// Return a checked-out connection. A no-op for unknown ids.
    async fn release(&self, conn: Connection, permit: OwnedSemaphorePermit) {
        let id = conn.id();
        let healthy = conn.reset().await;

        let to_close = {
            let mut state = self.lock();
            if !state.in_use.remove(&id) {
                debug!(connection_id = id, "Connection already released");
                return;
            }
            if healthy && !state.closed {
                state.idle.push_back(IdleConnection {
                    conn,
                    since: Instant::now(),
                });
                None
            } else {
                state.size -= 1;
                Some(conn)
            }
        };
        drop(permit);
        self.released.notify_waiters();

        if let Some(conn) = to_close {
            debug!(connection_id = id, healthy, "Closing released connection");
            if let Err(e) = conn.close().await {
                warn!(connection_id = id, error = %e, "Failed to close connection");
            }
        }
    }

    /// Synchronous bookkeeping when no runtime is available to release on.
    fn forget(&self, id: u64) {
        let mut state = self.lock();
        if state.in_use.remove(&id) {
            state.size -= 1;
        }
        drop(state);
        self.released.notify_waiters();
    }
}

/// Holds one unit of pool size while a connection is being found.
///
/// Dropped unarmed when the acquire completes; dropping it armed (error or
/// cancellation) gives the unit back.
struct SizeSlot<'a> {
    shared: &'a PoolShared,
    armed: bool,
}

impl Drop for SizeSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.lock().size -= 1;
        }
    }
}

/// Counts a caller as waiting for as long as it lives.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A bounded pool of connections.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("backend", &self.backend())
            .field("status", &self.status())
            .finish()
    }
}

impl Pool {
    /// Create a pool for a connection URL and open `min_connections` links.
    ///
    /// Pool options are read from the URL's query string and removed before
    /// the URL reaches the driver.
    pub async fn connect(url: &str, registry: Arc<ConverterRegistry>) -> DbResult<Self> {
        let (driver_url, options) = PoolOptions::from_url(url)?;
        let url = ConnectionUrl::parse(&driver_url)?;
        let driver = driver_for_url(&url)?;
        info!(backend = %url.backend, url = %url.masked(), "Creating connection pool");
        let pool = Self::with_driver(driver, registry, options)?;
        pool.open_min_connections().await?;
        Ok(pool)
    }

    /// Create a pool over an explicit driver. No links are opened.
    pub fn with_driver(
        driver: Arc<dyn Driver>,
        registry: Arc<ConverterRegistry>,
        options: PoolOptions,
    ) -> DbResult<Self> {
        options.validate().map_err(DbError::configuration)?;
        let is_sqlite = driver.backend() == BackendKind::SQLite;
        let max_size = options.max_connections_or_default(is_sqlite) as usize;
        let context = ConnectionContext {
            driver,
            registry,
            close_on_fatal: options.close_on_fatal_or_default(),
        };
        Ok(Self {
            shared: Arc::new(PoolShared {
                context: Arc::new(context),
                options,
                max_size,
                state: Mutex::new(PoolState::default()),
                permits: Arc::new(Semaphore::new(max_size)),
                waiting: AtomicUsize::new(0),
                released: Notify::new(),
            }),
        })
    }

    /// Open links until `min_connections` are live.
    pub async fn open_min_connections(&self) -> DbResult<()> {
        let min = (self.shared.options.min_connections_or_default() as usize)
            .min(self.shared.max_size);
        loop {
            {
                let mut state = self.shared.lock();
                if state.closed || state.size >= min {
                    return Ok(());
                }
                state.size += 1;
            }
            let mut slot = SizeSlot {
                shared: &self.shared,
                armed: true,
            };
            let conn = Connection::open(Arc::clone(&self.shared.context)).await?;
            slot.armed = false;
            self.shared.lock().idle.push_back(IdleConnection {
                conn,
                since: Instant::now(),
            });
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.shared.context.driver.backend()
    }

    pub fn registry(&self) -> &Arc<ConverterRegistry> {
        &self.shared.context.registry
    }

    pub fn options(&self) -> &PoolOptions {
        &self.shared.options
    }

    pub fn status(&self) -> PoolStatus {
        self.shared.status()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Acquire a connection, waiting up to the configured acquire timeout.
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        self.acquire_timeout(self.shared.options.acquire_timeout_or_default())
            .await
    }

    /// Acquire a connection, waiting up to `timeout` for one to free up.
    pub async fn acquire_timeout(&self, timeout: Duration) -> DbResult<PooledConnection> {
        let started = Instant::now();
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }

        let permit = {
            let _waiting = WaitingGuard::new(&self.shared.waiting);
            let permits = Arc::clone(&self.shared.permits);
            match tokio::time::timeout(timeout, permits.acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(DbError::PoolClosed),
                Err(_) => {
                    debug!(waited_ms = started.elapsed().as_millis() as u64, "Acquire timed out");
                    return Err(DbError::pool_exhausted(started.elapsed()));
                }
            }
        };

        let conn = self.checkout().await?;
        Ok(PooledConnection {
            conn: Some(conn),
            permit: Some(permit),
            pool: Arc::clone(&self.shared),
        })
    }

    /// Find or open a connection. The caller holds a permit.
    async fn checkout(&self) -> DbResult<Connection> {
        let shared = &self.shared;
        let idle_timeout = shared.options.idle_timeout_or_default();
        let test_before_acquire = shared.options.test_before_acquire_or_default();

        loop {
            let candidate = {
                let mut state = shared.lock();
                if state.closed {
                    return Err(DbError::PoolClosed);
                }
                let candidate = state.idle.pop_back();
                if candidate.is_none() {
                    state.size += 1;
                }
                candidate
            };
            let mut slot = SizeSlot {
                shared,
                armed: true,
            };

            let conn = match candidate {
                Some(idle) if idle.since.elapsed() > idle_timeout => {
                    debug!(connection_id = idle.conn.id(), "Evicting idle connection");
                    close_quietly(idle.conn).await;
                    continue;
                }
                Some(idle) => {
                    if test_before_acquire {
                        if let Err(e) = idle.conn.ping().await {
                            warn!(connection_id = idle.conn.id(), error = %e, "Ping failed, discarding connection");
                            close_quietly(idle.conn).await;
                            continue;
                        }
                    }
                    idle.conn
                }
                None => Connection::open(Arc::clone(&shared.context)).await?,
            };

            slot.armed = false;
            shared.lock().in_use.insert(conn.id());
            return Ok(conn);
        }
    }

    /// Return a connection to the pool.
    ///
    /// The handle is consumed, so a connection cannot be used after release.
    pub async fn release(&self, conn: PooledConnection) {
        conn.release().await;
    }

    /// Stop handing out connections, wait up to `grace` for in-use
    /// connections to come back, then close every link.
    ///
    /// A second call is a no-op.
    pub async fn disconnect(&self, grace: Duration) {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.shared.permits.close();
        info!(grace_ms = grace.as_millis() as u64, "Draining connection pool");

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.shared.released.notified();
            if self.shared.lock().in_use.is_empty() {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let in_use = self.shared.lock().in_use.len();
                warn!(in_use, "Grace period elapsed with connections still in use");
                break;
            }
        }

        let idle: Vec<IdleConnection> = {
            let mut state = self.shared.lock();
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.size -= idle.len();
            idle
        };
        for entry in idle {
            close_quietly(entry.conn).await;
        }
        info!("Connection pool closed");
    }
}

async fn close_quietly(conn: Connection) {
    let id = conn.id();
    if let Err(e) = conn.close().await {
        warn!(connection_id = id, error = %e, "Failed to close connection");
    }
}

/// RAII handle for a checked-out connection.
///
/// Dereferences to [`Connection`]. The connection returns to its pool when the
/// handle is released or dropped.
///
/// # Runtime Shutdown Behavior
///
/// The `Drop` implementation spawns a tokio task to reset and return the
/// connection. Without a runtime the connection is closed in place.
/// For critical cleanup paths, always use `release().await` explicitly.
pub struct PooledConnection {
    conn: Option<Connection>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolShared>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("released", &self.conn.is_none())
            .finish()
    }
}

impl PooledConnection {
    /// Return the connection to the pool now.
    pub async fn release(mut self) {
        self.release_now().await;
    }

    async fn release_now(&mut self) {
        if let (Some(conn), Some(permit)) = (self.conn.take(), self.permit.take()) {
            self.pool.release(conn, permit).await;
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `release_now` and `Drop` take the connection, and both consume the handle
        match &self.conn {
            Some(conn) => conn,
            None => panic!("PooledConnection used after release"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let (Some(conn), Some(permit)) = (self.conn.take(), self.permit.take()) else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.release(conn, permit).await;
                });
            }
            Err(_) => {
                pool.forget(conn.id());
                drop(permit);
            }
        }
    }
}
