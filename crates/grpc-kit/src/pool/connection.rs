use super::config::PoolConfig;
use core::time::Duration;
use tokio::time::Instant;

/// One pooled transport handle plus the timestamps eviction is based on.
///
/// Dropping a `Connection` closes the underlying transport.
#[derive(Debug)]
pub struct Connection<T> {
    id: u64,
    inner: T,
    created_at: Instant,
    last_used: Instant,
}

impl<T> Connection<T> {
    pub(crate) fn new(id: u64, inner: T) -> Self {
        let now = Instant::now();
        Self {
            id,
            inner,
            created_at: now,
            last_used: now,
        }
    }

    /// Identifier unique within the owning pool.
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    pub const fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub const fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub(crate) fn is_past_lifetime(&self, config: &PoolConfig) -> bool {
        !config.max_lifetime.is_zero() && self.age() >= config.max_lifetime
    }

    // Checked when handing out an idle connection.
    pub(crate) fn is_expired(&self, config: &PoolConfig) -> bool {
        self.is_past_lifetime(config)
            || (!config.idle_timeout.is_zero() && self.idle_for() > config.idle_timeout)
    }
}
