//! Bounded connection pool for a single address.
//!
//! A [`Pool`] hands out [`PooledConnection`]s. Each connection is either idle
//! (owned by the pool) or checked out (owned by exactly one handle). The live
//! count (idle + checked out) never exceeds `max_size`:
//!
//! - A slot is reserved under the pool lock *before* dialing, and the
//!   reservation is returned if dialing fails, times out, is cancelled, or
//!   the acquiring future is dropped.
//! - Dropping a handle releases the connection back to the idle set, or
//!   closes it if the pool is closed or the connection outlived
//!   `max_lifetime`.
//! - Expired idle connections are evicted lazily on acquire and eagerly by
//!   [`Pool::sweep`], so an expired connection is never handed out.
//!
//! Waiting acquirers park on a [`Notify`]. Every freed slot or returned
//! connection wakes one waiter; a waiter that goes away after being woken
//! passes the wakeup on, so no slot is stranded.

use super::{
    config::{PoolConfig, PoolTarget},
    connection::Connection,
    dialer::{BoxError, Connector},
    error::{ConnectTimeout, Error, Result},
};
use crate::{context::Context, logger, telemetry};
use core::{
    fmt,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU64, Ordering},
};
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};
use tokio::{sync::Notify, time::Instant};

/// Point-in-time view of a pool's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle plus checked-out connections.
    pub live: usize,
    pub idle: usize,
    /// Acquirers currently parked waiting for capacity.
    pub waiters: usize,
    pub closed: bool,
}

struct State<T> {
    idle: VecDeque<Connection<T>>,
    live: usize,
    waiters: usize,
    closed: bool,
}

enum Step<T> {
    Reuse(Connection<T>),
    Create,
    Wait,
}

pub struct Pool<T> {
    address: String,
    config: PoolConfig,
    connector: Box<dyn Connector<T>>,
    state: Mutex<State<T>>,
    available: Notify,
    next_id: AtomicU64,
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("address", &self.address)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T: Send + 'static> Pool<T> {
    /// Builds a pool for `target` and eagerly opens `init_size` connections.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if the target's config is rejected.
    /// - [`Error::CreationFailure`], [`Error::Timeout`] or
    ///   [`Error::Cancelled`] if an initial connection cannot be opened. Any
    ///   connection opened before the failure is closed.
    pub async fn build(
        ctx: &Context,
        target: PoolTarget,
        connector: impl Connector<T>,
    ) -> Result<Arc<Self>> {
        target.config.validate()?;

        let pool = Arc::new(Self {
            address: target.address,
            config: target.config,
            connector: Box::new(connector),
            state: Mutex::new(State {
                idle: VecDeque::new(),
                live: 0,
                waiters: 0,
                closed: false,
            }),
            available: Notify::new(),
            next_id: AtomicU64::new(0),
        });

        for _ in 0..pool.config.init_size {
            pool.state.lock().live += 1;
            let reservation = Reservation::new(&pool);
            match pool.connect(ctx).await.and_then(|conn| reservation.commit(conn)) {
                Ok(conn) => pool.state.lock().idle.push_back(conn),
                Err(err) => {
                    pool.close();
                    return Err(err);
                }
            }
        }

        tracing::debug!(
            parent: &logger::span(ctx),
            server = %pool.address,
            init_size = pool.config.init_size,
            max_size = pool.config.max_size,
            "connection pool built"
        );
        Ok(pool)
    }

    /// Checks out a connection.
    ///
    /// Reuses the most recently returned idle connection that has not
    /// expired, otherwise dials a new one if the pool is below `max_size`,
    /// otherwise waits for a connection to be released.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolClosed`] if the pool is or becomes closed.
    /// - [`Error::CreationFailure`] if dialing fails or exceeds the create
    ///   timeout.
    /// - [`Error::Timeout`] / [`Error::Cancelled`] if `ctx` expires or is
    ///   cancelled while waiting or dialing.
    pub async fn acquire(self: &Arc<Self>, ctx: &Context) -> Result<PooledConnection<T>> {
        let started = Instant::now();

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);

            let mut evicted = Vec::new();
            let step = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(self.closed_error());
                }

                let mut reusable = None;
                while let Some(conn) = state.idle.pop_back() {
                    if conn.is_expired(&self.config) {
                        state.live -= 1;
                        evicted.push(conn);
                    } else {
                        reusable = Some(conn);
                        break;
                    }
                }

                match reusable {
                    Some(conn) => Step::Reuse(conn),
                    None if state.live < self.config.max_size => {
                        state.live += 1;
                        Step::Create
                    }
                    None => {
                        // Register interest before releasing the lock so a
                        // release in between cannot be missed.
                        notified.as_mut().enable();
                        state.waiters += 1;
                        Step::Wait
                    }
                }
            };
            self.closed_evicted(evicted);

            match step {
                Step::Reuse(conn) => {
                    telemetry::record_pool_acquire_wait(started.elapsed().as_secs_f64() * 1000.0);
                    return Ok(PooledConnection::new(Arc::clone(self), conn));
                }
                Step::Create => {
                    let reservation = Reservation::new(self);
                    let conn = self.connect(ctx).await?;
                    let conn = reservation.commit(conn)?;
                    telemetry::record_pool_acquire_wait(started.elapsed().as_secs_f64() * 1000.0);
                    return Ok(PooledConnection::new(Arc::clone(self), conn));
                }
                Step::Wait => {
                    let _waiter = WaiterGuard { pool: self };
                    ctx.run(notified)
                        .await
                        .map_err(|err| Error::from_context(err, &self.address))?;
                }
            }
        }
    }

    /// Dials one connection, bounded by the create timeout and `ctx`.
    ///
    /// The caller owns the slot reservation.
    async fn connect(&self, ctx: &Context) -> Result<Connection<T>> {
        tracing::debug!(parent: &logger::span(ctx), server = %self.address, "creating connection");

        match ctx.run(self.connect_bounded()).await {
            Ok(Ok(inner)) => {
                telemetry::add_pooled_connections(1);
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                Ok(Connection::new(id, inner))
            }
            Ok(Err(source)) => {
                tracing::debug!(
                    parent: &logger::span(ctx),
                    server = %self.address,
                    error = %source,
                    "failed to create connection"
                );
                Err(Error::CreationFailure {
                    address: self.address.clone(),
                    source,
                })
            }
            Err(err) => Err(Error::from_context(err, &self.address)),
        }
    }

    async fn connect_bounded(&self) -> core::result::Result<T, BoxError> {
        let connect = self.connector.connect();
        let limit = self.config.create_timeout;
        if limit.is_zero() {
            return connect.await;
        }
        match tokio::time::timeout(limit, connect).await {
            Ok(res) => res,
            Err(_) => Err(Box::new(ConnectTimeout(limit))),
        }
    }
}

impl<T> Pool<T> {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            live: state.live,
            idle: state.idle.len(),
            waiters: state.waiters,
            closed: state.closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Closes every idle connection and fails all current and future
    /// acquirers with [`Error::PoolClosed`].
    ///
    /// Checked-out connections stay open until their handles are released or
    /// discarded, at which point they are closed. Calling this more than once
    /// has no further effect.
    pub fn close(&self) {
        let idle = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle = core::mem::take(&mut state.idle);
            state.live -= idle.len();
            idle
        };

        tracing::debug!(server = %self.address, closed_idle = idle.len(), "closing connection pool");
        telemetry::add_pooled_connections(-(idle.len() as i64));
        drop(idle);
        self.available.notify_waiters();
    }

    /// Evicts idle connections past their idle timeout or max lifetime.
    ///
    /// Returns the number of connections closed.
    pub fn sweep(&self) -> usize {
        let expired = {
            let mut state = self.state.lock();
            let (keep, expired): (VecDeque<_>, VecDeque<_>) = core::mem::take(&mut state.idle)
                .into_iter()
                .partition(|conn| !conn.is_expired(&self.config));
            state.idle = keep;
            state.live -= expired.len();
            Vec::from(expired)
        };
        let evicted = expired.len();
        self.closed_evicted(expired);
        evicted
    }

    /// Returns a checked-out connection to the idle set, or closes it if the
    /// pool is closed or the connection is past its max lifetime.
    fn put_back(&self, mut conn: Connection<T>) {
        let retired = {
            let mut state = self.state.lock();
            if state.closed || conn.is_past_lifetime(&self.config) {
                state.live -= 1;
                Some(conn)
            } else {
                conn.touch();
                state.idle.push_back(conn);
                None
            }
        };

        if let Some(conn) = retired {
            tracing::trace!(server = %self.address, id = conn.id(), "retiring connection");
            telemetry::add_pooled_connections(-1);
            drop(conn);
        }
        self.available.notify_one();
    }

    fn discard_conn(&self, conn: Connection<T>) {
        self.state.lock().live -= 1;
        tracing::trace!(server = %self.address, id = conn.id(), "discarding connection");
        telemetry::add_pooled_connections(-1);
        drop(conn);
        self.available.notify_one();
    }

    fn free_slot(&self) {
        self.state.lock().live -= 1;
        self.available.notify_one();
    }

    // Close connections evicted under the lock, then wake one waiter per
    // freed slot.
    fn closed_evicted(&self, evicted: Vec<Connection<T>>) {
        if evicted.is_empty() {
            return;
        }
        tracing::trace!(server = %self.address, evicted = evicted.len(), "evicted expired connections");
        telemetry::add_pooled_connections(-(evicted.len() as i64));
        let freed = evicted.len();
        drop(evicted);
        for _ in 0..freed {
            self.available.notify_one();
        }
    }

    fn closed_error(&self) -> Error {
        Error::PoolClosed {
            address: self.address.clone(),
        }
    }
}

/// A slot counted in `live` while its connection is being dialed.
///
/// Dropping an uncommitted reservation returns the slot.
struct Reservation<'a, T> {
    pool: &'a Pool<T>,
    armed: bool,
}

impl<'a, T> Reservation<'a, T> {
    const fn new(pool: &'a Pool<T>) -> Self {
        Self { pool, armed: true }
    }

    /// Accounts `conn` to its slot, unless the pool was closed while it was
    /// being dialed. In that case the connection is closed and the slot
    /// freed.
    fn commit(mut self, conn: Connection<T>) -> Result<Connection<T>> {
        self.armed = false;
        let closed = {
            let mut state = self.pool.state.lock();
            if state.closed {
                state.live -= 1;
            }
            state.closed
        };
        if !closed {
            return Ok(conn);
        }

        tracing::debug!(server = %self.pool.address, "pool closed while dialing");
        telemetry::add_pooled_connections(-1);
        drop(conn);
        self.pool.available.notify_one();
        Err(self.pool.closed_error())
    }
}

impl<T> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.free_slot();
        }
    }
}

struct WaiterGuard<'a, T> {
    pool: &'a Pool<T>,
}

impl<T> Drop for WaiterGuard<'_, T> {
    fn drop(&mut self) {
        self.pool.state.lock().waiters -= 1;
    }
}

/// A checked-out connection.
///
/// Dereferences to the transport handle. Dropping the handle releases the
/// connection back to its pool; call [`PooledConnection::discard`] instead
/// after a transport error so the broken connection is closed.
pub struct PooledConnection<T> {
    pool: Arc<Pool<T>>,
    conn: Option<Connection<T>>,
}

impl<T> PooledConnection<T> {
    const fn new(pool: Arc<Pool<T>>, conn: Connection<T>) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }

    fn conn(&self) -> &Connection<T> {
        // Only emptied by `release`, `discard` and `drop`, which consume or
        // destroy the handle.
        self.conn.as_ref().unwrap_or_else(|| unreachable!("connection taken"))
    }

    pub fn connection(&self) -> &Connection<T> {
        self.conn()
    }

    pub fn id(&self) -> u64 {
        self.conn().id()
    }

    /// Address of the owning pool.
    pub fn address(&self) -> &str {
        self.pool.address()
    }

    /// Returns the connection to its pool. Equivalent to dropping the handle.
    pub fn release(self) {
        drop(self);
    }

    /// Closes the connection instead of returning it, freeing its slot.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard_conn(conn);
        }
    }
}

impl<T> Deref for PooledConnection<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.conn().get_ref()
    }
}

impl<T> DerefMut for PooledConnection<T> {
    fn deref_mut(&mut self) -> &mut T {
        match self.conn.as_mut() {
            Some(conn) => conn.get_mut(),
            None => unreachable!("connection taken"),
        }
    }
}

impl<T> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PooledConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("address", &self.pool.address)
            .field("conn", &self.conn)
            .finish()
    }
}
