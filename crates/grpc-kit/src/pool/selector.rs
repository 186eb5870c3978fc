use super::{
    config::{PoolConfig, PoolTarget},
    creator::{PoolCreator, Registration},
    dialer::Dialer,
    engine::{Pool, PooledConnection},
    error::{Error, Result},
};
use crate::{context::Context, interceptor::InterceptorChain, logger};
use core::{fmt, time::Duration};
use parking_lot::RwLock;
use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{Arc, Weak},
};
use tokio::task::JoinHandle;

/// Registry of connection pools keyed by server address.
///
/// Lookups take a read lock; registration takes the write lock only to
/// commit a pool that was already built. Once [`PoolSelector::close`] runs,
/// every pool is closed and all further lookups and registrations fail with
/// [`Error::SelectorClosed`].
pub struct PoolSelector<T> {
    // `None` once closed.
    pools: RwLock<Option<HashMap<String, Arc<Pool<T>>>>>,
    default_config: RwLock<PoolConfig>,
    default_interceptors: InterceptorChain,
    dialer: Arc<dyn Dialer<T>>,
}

impl<T> fmt::Debug for PoolSelector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSelector")
            .field("addresses", &self.addresses())
            .field("default_config", &*self.default_config.read())
            .field("default_interceptors", &self.default_interceptors)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> PoolSelector<T> {
    /// An empty selector. Pools are created through `dialer` with
    /// `default_interceptors` installed on every connection.
    pub fn new(dialer: impl Dialer<T>, default_interceptors: InterceptorChain) -> Self {
        Self {
            pools: RwLock::new(Some(HashMap::new())),
            default_config: RwLock::new(PoolConfig::default()),
            default_interceptors,
            dialer: Arc::new(dialer),
        }
    }

    /// A selector pre-populated from `creators`.
    ///
    /// Creators run in order without overwriting, so the first creator for a
    /// given address wins. A creator that fails is logged and skipped; the
    /// address it named is created on demand later.
    pub async fn with_creators(
        ctx: &Context,
        dialer: impl Dialer<T>,
        default_interceptors: InterceptorChain,
        creators: &[PoolCreator],
    ) -> Self {
        let selector = Self::new(dialer, default_interceptors);
        for creator in creators {
            if let Err(err) = creator.register(ctx, &selector, false).await {
                tracing::error!(
                    parent: &logger::span(ctx),
                    server = %creator.target().address,
                    error = %err,
                    "failed to create connection pool"
                );
            }
        }
        selector
    }

    /// Checks out a connection to `address`.
    ///
    /// Delegates to [`Pool::acquire`] on the pool returned by
    /// [`PoolSelector::get_pool`]; the handle releases back to that pool on
    /// drop.
    ///
    /// # Errors
    ///
    /// Any error from [`PoolSelector::get_pool`] or [`Pool::acquire`].
    pub async fn get(
        &self,
        ctx: &Context,
        address: &str,
        create_if_missing: bool,
    ) -> Result<PooledConnection<T>> {
        self.get_pool(ctx, address, create_if_missing)
            .await?
            .acquire(ctx)
            .await
    }

    /// Returns the pool for `address`.
    ///
    /// When no pool exists and `create_if_missing` is set, one is built from
    /// the default config and the default interceptors. Concurrent callers
    /// racing to create the same address all end up with the single pool that
    /// was committed first.
    ///
    /// # Errors
    ///
    /// - [`Error::SelectorClosed`] after [`PoolSelector::close`].
    /// - [`Error::NotInitialized`] if the pool is missing and
    ///   `create_if_missing` is false.
    /// - Any error from building the pool.
    pub async fn get_pool(
        &self,
        ctx: &Context,
        address: &str,
        create_if_missing: bool,
    ) -> Result<Arc<Pool<T>>> {
        if let Some(pool) = self.lookup(address)? {
            return Ok(pool);
        }
        if !create_if_missing {
            return Err(Error::NotInitialized {
                address: address.to_string(),
            });
        }

        let target = PoolTarget::new(address, self.default_config());
        self.set_pool(ctx, target, InterceptorChain::default(), false)
            .await?;

        self.lookup(address)?.ok_or_else(|| Error::Internal {
            context: format!("pool for {address} missing after creation"),
        })
    }

    /// Builds and registers a pool for `target`, with `extra` interceptors
    /// appended after the defaults.
    ///
    /// With `allow_overwrite` an existing pool is replaced and closed;
    /// without it the new pool is discarded and the existing one kept.
    ///
    /// # Errors
    ///
    /// Fails if the selector is closed or the pool cannot be built.
    pub async fn set_pool(
        &self,
        ctx: &Context,
        target: PoolTarget,
        extra: InterceptorChain,
        allow_overwrite: bool,
    ) -> Result<Registration> {
        PoolCreator::new(target, extra)
            .register(ctx, self, allow_overwrite)
            .await
    }

    /// Commits a built pool under the write lock.
    ///
    /// The pool that loses (the new one when not overwriting, the old one
    /// when overwriting, or the new one if the selector closed meanwhile) is
    /// closed after the lock is released.
    pub(crate) fn commit(
        &self,
        address: &str,
        pool: Arc<Pool<T>>,
        allow_overwrite: bool,
    ) -> Result<Registration> {
        let (registration, loser) = {
            let mut guard = self.pools.write();
            let Some(pools) = guard.as_mut() else {
                drop(guard);
                pool.close();
                return Err(Error::SelectorClosed);
            };

            match pools.entry(address.to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(pool);
                    (Registration::Inserted, None)
                }
                Entry::Occupied(_) if !allow_overwrite => (Registration::Discarded, Some(pool)),
                Entry::Occupied(mut slot) => {
                    let old = slot.insert(pool);
                    (Registration::Replaced, Some(old))
                }
            }
        };

        if let Some(loser) = loser {
            loser.close();
        }
        Ok(registration)
    }

    /// Spawns a task that sweeps expired idle connections every `period`.
    ///
    /// The task stops once the selector is closed or dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let selector: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(selector) = selector.upgrade() else {
                    break;
                };
                if selector.is_closed() {
                    break;
                }
                let evicted = selector.sweep();
                if evicted > 0 {
                    tracing::debug!(evicted, "swept expired connections");
                }
            }
        })
    }

    pub(crate) fn dialer(&self) -> Arc<dyn Dialer<T>> {
        Arc::clone(&self.dialer)
    }
}

impl<T> PoolSelector<T> {
    fn lookup(&self, address: &str) -> Result<Option<Arc<Pool<T>>>> {
        let guard = self.pools.read();
        let pools = guard.as_ref().ok_or(Error::SelectorClosed)?;
        Ok(pools.get(address).cloned())
    }

    /// The registered pool for `address`, if any.
    pub fn pool(&self, address: &str) -> Option<Arc<Pool<T>>> {
        self.lookup(address).ok().flatten()
    }

    /// Registered addresses, sorted.
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self
            .pools
            .read()
            .as_ref()
            .map(|pools| pools.keys().cloned().collect())
            .unwrap_or_default();
        addresses.sort_unstable();
        addresses
    }

    pub fn default_config(&self) -> PoolConfig {
        self.default_config.read().clone()
    }

    /// Replaces the config used for pools created on demand. Existing pools
    /// keep theirs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] and keeps the previous config if
    /// `config` does not validate.
    pub fn set_default_config(&self, config: PoolConfig) -> Result<()> {
        config.validate()?;
        *self.default_config.write() = config;
        Ok(())
    }

    pub const fn default_interceptors(&self) -> &InterceptorChain {
        &self.default_interceptors
    }

    /// Sweeps every registered pool, returning the total number of evicted
    /// connections.
    pub fn sweep(&self) -> usize {
        let pools: Vec<_> = match self.pools.read().as_ref() {
            Some(pools) => pools.values().cloned().collect(),
            None => return 0,
        };
        pools.iter().map(|pool| pool.sweep()).sum()
    }

    pub fn is_closed(&self) -> bool {
        self.pools.read().is_none()
    }

    /// Closes every pool and rejects all further use. Idempotent.
    pub fn close(&self) {
        let Some(pools) = self.pools.write().take() else {
            return;
        };
        tracing::info!(pools = pools.len(), "closing connection pools");
        for pool in pools.into_values() {
            pool.close();
        }
    }
}
