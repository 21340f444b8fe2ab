//! Bounded pool of backend sessions.
//!
//! Capacity is a FIFO semaphore with one permit per checkout; idle sessions
//! sit in a stack guarded by a plain mutex that is never held across an
//! `.await`. A checkout is returned by dropping its [`PoolConnection`], so the
//! return runs on every exit path, cancellation included.

use crate::config::{ConnectParams, PoolOptions};
use crate::error::DbError;
use crate::udbc::connection::Connection;
use crate::udbc::driver::Driver;
use crate::udbc::error::DriverError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("timed out after {0:?} waiting for a connection")]
    Timeout(Duration),
    #[error("pool is closed")]
    Closed,
    #[error("failed to connect: {0}")]
    Connect(#[source] DriverError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Live sessions, idle or checked out.
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max_size: usize,
    pub closed: bool,
}

struct IdleConnection {
    conn: Box<dyn Connection>,
    created_at: Instant,
}

struct PoolShared {
    id: u64,
    driver: Arc<dyn Driver>,
    params: ConnectParams,
    options: Mutex<PoolOptions>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection>>,
    size: AtomicUsize,
    in_use: AtomicUsize,
    closed: AtomicBool,
}

/// Cheap handle; clones share the same pool.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.shared.id)
            .field("status", &self.status())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Pool {
    pub fn new(driver: Arc<dyn Driver>, params: ConnectParams, options: PoolOptions) -> Self {
        let max = options.max_size;
        Self {
            shared: Arc::new(PoolShared {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                driver,
                params,
                options: Mutex::new(options),
                semaphore: Arc::new(Semaphore::new(max)),
                idle: Mutex::new(VecDeque::new()),
                size: AtomicUsize::new(0),
                in_use: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// A new, unopened pool with the same driver, parameters and options.
    pub fn recreate(&self) -> Self {
        Pool::new(
            self.shared.driver.clone(),
            self.shared.params.clone(),
            self.options(),
        )
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn params(&self) -> &ConnectParams {
        &self.shared.params
    }

    pub fn options(&self) -> PoolOptions {
        lock(&self.shared.options).clone()
    }

    pub fn status(&self) -> PoolStatus {
        let idle = lock(&self.shared.idle).len();
        PoolStatus {
            size: self.shared.size.load(Ordering::SeqCst),
            idle,
            in_use: self.shared.in_use.load(Ordering::SeqCst),
            max_size: lock(&self.shared.options).max_size,
            closed: self.shared.closed.load(Ordering::SeqCst),
        }
    }

    /// Establishes `min_size` sessions (none when the pool is lazy), probing
    /// each. On failure everything opened so far is closed again.
    pub async fn open(&self) -> Result<(), PoolError> {
        let options = self.options();
        if options.lazy {
            debug!(pool = self.shared.id, "Opened lazy connection pool");
            return Ok(());
        }
        let mut opened = Vec::with_capacity(options.min_size);
        for _ in 0..options.min_size {
            match self.shared.connect_probed().await {
                Ok(conn) => opened.push(conn),
                Err(e) => {
                    for idle in opened {
                        self.shared.size.fetch_sub(1, Ordering::SeqCst);
                        let _ = idle.conn.close().await;
                    }
                    return Err(e);
                }
            }
        }
        lock(&self.shared.idle).extend(opened);
        debug!(
            pool = self.shared.id,
            min_size = options.min_size,
            max_size = options.max_size,
            "Opened connection pool"
        );
        Ok(())
    }

    /// Checks out a session, waiting at most the configured timeout.
    pub async fn acquire(&self) -> Result<PoolConnection, PoolError> {
        let timeout = lock(&self.shared.options).timeout;
        match tokio::time::timeout(timeout, self.acquire_inner()).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Timeout(timeout)),
        }
    }

    async fn acquire_inner(&self) -> Result<PoolConnection, PoolError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }
        let permit = self
            .shared
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        // Waiters queued before close() still get permits; turn them away.
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }

        let max_lifetime = lock(&self.shared.options).max_lifetime;
        loop {
            let candidate = lock(&self.shared.idle).pop_back();
            match candidate {
                Some(idle) if expired(idle.created_at, max_lifetime) => {
                    self.shared.discard(idle.conn, "lifetime exceeded");
                }
                Some(idle) => return Ok(self.checkout(idle, permit)),
                None => break,
            }
        }

        let fresh = self.shared.connect().await?;
        Ok(self.checkout(fresh, permit))
    }

    fn checkout(&self, idle: IdleConnection, permit: OwnedSemaphorePermit) -> PoolConnection {
        self.shared.in_use.fetch_add(1, Ordering::SeqCst);
        PoolConnection {
            conn: Some(idle.conn),
            created_at: idle.created_at,
            discard: false,
            in_flight: false,
            shared: self.shared.clone(),
            permit: Some(permit),
        }
    }

    /// Changes the pool bounds. Growing takes effect immediately; shrinking
    /// waits until enough checkouts have come back.
    pub async fn resize(&self, min_size: usize, max_size: usize) -> Result<(), DbError> {
        let mut options = self.options();
        let old_max = options.max_size;
        options.min_size = min_size;
        options.max_size = max_size;
        let options = options.validate()?;

        if max_size > old_max {
            self.shared.semaphore.add_permits(max_size - old_max);
        } else if max_size < old_max {
            let surplus = (old_max - max_size) as u32;
            let permits = self
                .shared
                .semaphore
                .acquire_many(surplus)
                .await
                .map_err(|_| crate::translate::translate_pool(PoolError::Closed))?;
            permits.forget();
            let trimmed: Vec<IdleConnection> = {
                let mut idle = lock(&self.shared.idle);
                let surplus = idle.len() - max_size.min(idle.len());
                idle.drain(..surplus).collect()
            };
            for conn in trimmed {
                self.shared.discard(conn.conn, "pool resized");
            }
        }
        *lock(&self.shared.options) = options;
        info!(pool = self.shared.id, min_size, max_size, "Resized connection pool");
        Ok(())
    }

    /// Stops new checkouts, waits up to `timeout` for outstanding ones and
    /// closes every session. Idempotent.
    pub async fn close(&self, timeout: Duration) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let max = lock(&self.shared.options).max_size as u32;
        let drained = tokio::time::timeout(
            timeout,
            self.shared.semaphore.clone().acquire_many_owned(max),
        )
        .await;
        if drained.is_err() {
            warn!(
                pool = self.shared.id,
                in_use = self.shared.in_use.load(Ordering::SeqCst),
                "Closing pool with connections still checked out; they are closed on return"
            );
        }
        // Wakes every suspended acquire with an error.
        self.shared.semaphore.close();

        let idle: Vec<IdleConnection> = lock(&self.shared.idle).drain(..).collect();
        for conn in idle {
            self.shared.size.fetch_sub(1, Ordering::SeqCst);
            if let Err(e) = conn.conn.close().await {
                debug!(pool = self.shared.id, error = %e, "Error closing connection");
            }
        }
        debug!(pool = self.shared.id, "Closed connection pool");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

fn expired(created_at: Instant, max_lifetime: Option<Duration>) -> bool {
    max_lifetime.is_some_and(|lifetime| created_at.elapsed() >= lifetime)
}

/// Keeps `size` honest if a connect is cancelled half-way.
struct SizeReservation<'a> {
    size: &'a AtomicUsize,
    armed: bool,
}

impl Drop for SizeReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl PoolShared {
    async fn connect(&self) -> Result<IdleConnection, PoolError> {
        self.size.fetch_add(1, Ordering::SeqCst);
        let mut reservation = SizeReservation {
            size: &self.size,
            armed: true,
        };
        let conn = self
            .driver
            .connect(&self.params)
            .await
            .map_err(PoolError::Connect)?;
        reservation.armed = false;
        debug!(pool = self.id, host = %self.params.host, "Opened new connection");
        Ok(IdleConnection {
            conn,
            created_at: Instant::now(),
        })
    }

    async fn connect_probed(&self) -> Result<IdleConnection, PoolError> {
        let mut idle = self.connect().await?;
        if let Err(e) = idle.conn.ping().await {
            self.size.fetch_sub(1, Ordering::SeqCst);
            let _ = idle.conn.close().await;
            return Err(PoolError::Connect(e));
        }
        Ok(idle)
    }

    fn discard(&self, conn: Box<dyn Connection>, reason: &'static str) {
        self.size.fetch_sub(1, Ordering::SeqCst);
        debug!(pool = self.id, reason, "Discarding connection");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = conn.close().await;
            });
        }
    }

    fn release(&self, conn: Box<dyn Connection>, created_at: Instant, discard: bool) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.discard(conn, "pool closed");
        } else if discard || conn.is_broken() {
            warn!(pool = self.id, "Connection broken; a replacement opens on demand");
            self.discard(conn, "broken");
        } else if expired(created_at, lock(&self.options).max_lifetime) {
            self.discard(conn, "lifetime exceeded");
        } else {
            lock(&self.idle).push_back(IdleConnection { conn, created_at });
        }
    }
}

/// A checked-out session. Dropping it returns the session to its pool.
pub struct PoolConnection {
    conn: Option<Box<dyn Connection>>,
    created_at: Instant,
    discard: bool,
    /// Set while a driver call is awaited; still set on drop means the call
    /// was cancelled half-way and the session state is unknown.
    in_flight: bool,
    shared: Arc<PoolShared>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PoolConnection {
    pub fn pool_id(&self) -> u64 {
        self.shared.id
    }

    /// Marks the session so it is closed instead of reused on return.
    pub fn discard(&mut self) {
        self.discard = true;
    }

    pub(crate) fn set_in_flight(&mut self, in_flight: bool) {
        self.in_flight = in_flight;
    }

    pub fn connection(&mut self) -> &mut dyn Connection {
        // Only `Drop` takes the box out.
        match self.conn.as_mut() {
            Some(conn) => conn.as_mut(),
            None => unreachable!("connection used after release"),
        }
    }
}

impl Drop for PoolConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.in_flight {
                debug!(pool = self.shared.id, "Connection returned mid-call");
            }
            self.shared
                .release(conn, self.created_at, self.discard || self.in_flight);
        }
        // The session is back in the idle set before its slot frees up.
        drop(self.permit.take());
    }
}
