use super::{
    config::PoolTarget,
    dialer::ConnectFuture,
    engine::Pool,
    error::Result,
    selector::PoolSelector,
};
use crate::{context::Context, interceptor::InterceptorChain, logger};
use std::sync::Arc;

/// Outcome of committing a freshly built pool to a [`PoolSelector`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// No pool existed for the address; the new one was stored.
    Inserted,
    /// A pool already existed and overwriting was not allowed; the new pool
    /// was closed.
    Discarded,
    /// The existing pool was replaced and closed.
    Replaced,
}

/// Recipe for one address's pool: its target plus interceptors appended to
/// the selector defaults.
#[derive(Clone, Debug)]
pub struct PoolCreator {
    target: PoolTarget,
    extra: InterceptorChain,
}

impl PoolCreator {
    pub const fn new(target: PoolTarget, extra: InterceptorChain) -> Self {
        Self { target, extra }
    }

    pub const fn target(&self) -> &PoolTarget {
        &self.target
    }

    pub const fn interceptors(&self) -> &InterceptorChain {
        &self.extra
    }

    /// Builds the pool (dialing `init_size` connections) without holding the
    /// selector lock, then commits it.
    ///
    /// # Errors
    ///
    /// Returns the build error, or [`Error::SelectorClosed`] if the selector
    /// closed while the pool was being built.
    ///
    /// [`Error::SelectorClosed`]: super::Error::SelectorClosed
    pub async fn register<T: Send + 'static>(
        &self,
        ctx: &Context,
        selector: &PoolSelector<T>,
        allow_overwrite: bool,
    ) -> Result<Registration> {
        let chain = selector.default_interceptors().extended(&self.extra);
        let dialer = selector.dialer();
        let target = self.target.clone();
        let connector = move || -> ConnectFuture<T> { dialer.dial(&target, &chain) };

        let pool: Arc<Pool<T>> = Pool::build(ctx, self.target.clone(), connector).await?;
        let registration = selector.commit(&self.target.address, pool, allow_overwrite)?;

        tracing::debug!(
            parent: &logger::span(ctx),
            server = %self.target.address,
            ?registration,
            "registered connection pool"
        );
        Ok(registration)
    }
}
