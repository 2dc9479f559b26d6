//! A lightweight pool of exclusive connections to one endpoint.
//!
//! The pool bounds the number of live connections with a fair semaphore
//! (waiters are served in FIFO order), keeps released connections on a
//! LIFO idle stack, health-checks candidates on acquisition, and discards
//! broken or expired connections instead of recycling them. Handles carry
//! an exclusive loan; dropping the handle releases the connection, so a
//! double release cannot be expressed.
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::io::{ClickHouseRead, ClickHouseWrite};
use crate::{Error, Result};

/// Produces a ready, handshaken connection. See [`crate::connect`] for the
/// TCP implementation.
pub type DialFn<R, W> =
    Box<dyn Fn() -> BoxFuture<'static, Result<Connection<R, W>>> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Maximum concurrent live connections (idle + checked out).
    pub max_connections: usize,
    /// How long an acquisition may wait for a free slot.
    pub acquire_timeout: Option<Duration>,
    /// Idle connections older than this are discarded on acquisition.
    pub max_idle_time:   Option<Duration>,
    /// Connections older than this are discarded instead of pooled.
    pub max_lifetime:    Option<Duration>,
    /// Ping idle candidates before handing them out.
    pub ping_on_acquire: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            max_connections: 8,
            acquire_timeout: Some(Duration::from_secs(30)),
            max_idle_time:   Some(Duration::from_secs(10 * 60)),
            max_lifetime:    None,
            ping_on_acquire: false,
        }
    }
}

/// Live/idle counters for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle:   usize,
    pub in_use: usize,
}

struct Idle<R, W> {
    conn:       Connection<R, W>,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolInner<R, W> {
    dial:      DialFn<R, W>,
    options:   PoolOptions,
    semaphore: Arc<Semaphore>,
    idle:      Mutex<Vec<Idle<R, W>>>,
    closed:    AtomicBool,
}

/// A bounded set of idle connections keyed to one endpoint.
pub struct ConnectionPool<R, W> {
    inner: Arc<PoolInner<R, W>>,
}

impl<R, W> Clone for ConnectionPool<R, W> {
    fn clone(&self) -> Self { ConnectionPool { inner: Arc::clone(&self.inner) } }
}

impl<R: ClickHouseRead + 'static, W: ClickHouseWrite + 'static> ConnectionPool<R, W> {
    pub fn new(dial: DialFn<R, W>, options: PoolOptions) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                dial,
                semaphore: Arc::new(Semaphore::new(options.max_connections)),
                options,
                idle: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Lease an exclusive, healthy connection.
    ///
    /// Pops an idle connection if one passes its health check, dials a
    /// fresh one while under the live limit, and otherwise waits in FIFO
    /// order for a release, failing once the configured acquire deadline
    /// elapses.
    pub async fn acquire(&self) -> Result<PooledConnection<R, W>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let semaphore = Arc::clone(&self.inner.semaphore);
        let permit = match self.inner.options.acquire_timeout {
            Some(deadline) => {
                tokio::time::timeout(deadline, semaphore.acquire_owned())
                    .await
                    .map_err(|_| Error::Canceled {
                        reason: "pool acquire deadline exceeded",
                        flush:  None,
                    })?
            }
            None => semaphore.acquire_owned().await,
        }
        .map_err(|_| Error::Closed)?;

        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        loop {
            // The guard must not be held across the health check.
            let candidate = { self.inner.idle.lock().pop() };
            let Some(idle) = candidate else { break };
            if let Some(checked) = self.vet(idle).await {
                trace!("reusing idle connection");
                return Ok(PooledConnection {
                    conn:       Some(checked.conn),
                    created_at: checked.created_at,
                    pool:       Arc::clone(&self.inner),
                    _permit:    permit,
                });
            }
        }

        let conn = (self.inner.dial)().await?;
        debug!("dialed fresh connection");
        Ok(PooledConnection {
            conn:       Some(conn),
            created_at: Instant::now(),
            pool:       Arc::clone(&self.inner),
            _permit:    permit,
        })
    }

    /// Health-check an idle candidate, discarding it on failure.
    async fn vet(&self, mut idle: Idle<R, W>) -> Option<Idle<R, W>> {
        let options = &self.inner.options;
        if idle.conn.is_closed() {
            debug!("discarding closed idle connection");
            return None;
        }
        if options.max_idle_time.is_some_and(|d| idle.idle_since.elapsed() >= d) {
            debug!("discarding connection past max idle time");
            return None;
        }
        if options.max_lifetime.is_some_and(|d| idle.created_at.elapsed() >= d) {
            debug!("discarding connection past max lifetime");
            return None;
        }
        if options.ping_on_acquire && idle.conn.ping().await.is_err() {
            debug!("discarding connection that failed ping");
            return None;
        }
        Some(idle)
    }

    /// Close the pool: refuse new acquisitions, wake waiters with an
    /// error, close all idle connections, and mark outstanding handles so
    /// their release discards.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.semaphore.close();
        let drained: Vec<Idle<R, W>> = std::mem::take(&mut *self.inner.idle.lock());
        for mut idle in drained {
            let _ = idle.conn.close().await;
        }
    }

    pub fn status(&self) -> PoolStatus {
        let idle = self.inner.idle.lock().len();
        let available = self.inner.semaphore.available_permits();
        let in_use = self.inner.options.max_connections.saturating_sub(available);
        PoolStatus { idle, in_use }
    }
}

/// An exclusive loan of one connection. Dropping it returns the
/// connection to the pool, or discards it when the connection is broken,
/// expired, or the pool has closed.
pub struct PooledConnection<R, W> {
    conn:       Option<Connection<R, W>>,
    created_at: Instant,
    pool:       Arc<PoolInner<R, W>>,
    _permit:    OwnedSemaphorePermit,
}

impl<R, W> std::fmt::Debug for PooledConnection<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl<R, W> Deref for PooledConnection<R, W> {
    type Target = Connection<R, W>;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<R, W> DerefMut for PooledConnection<R, W> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<R, W> Drop for PooledConnection<R, W> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };
        let expired =
            self.pool.options.max_lifetime.is_some_and(|d| self.created_at.elapsed() >= d);
        if self.pool.closed.load(Ordering::Acquire) || conn.is_closed() || expired {
            // The permit drops with the handle, freeing the slot.
            trace!("discarding connection on release");
            return;
        }
        self.pool.idle.lock().push(Idle {
            conn,
            created_at: self.created_at,
            idle_since: Instant::now(),
        });
    }
}
