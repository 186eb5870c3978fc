use super::config::PoolTarget;
use crate::interceptor::InterceptorChain;
use futures::future::BoxFuture;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Future resolving to one freshly established connection.
pub type ConnectFuture<T> = BoxFuture<'static, Result<T, BoxError>>;

/// Establishes connections to the single address a [`Pool`] is bound to.
///
/// The pool bounds each attempt with its create timeout and the caller's
/// context, so implementations don't need their own deadline.
///
/// [`Pool`]: super::Pool
pub trait Connector<T>: Send + Sync + 'static {
    fn connect(&self) -> ConnectFuture<T>;
}

impl<T, F> Connector<T> for F
where
    F: Fn() -> ConnectFuture<T> + Send + Sync + 'static,
{
    fn connect(&self) -> ConnectFuture<T> {
        self()
    }
}

/// Transport factory used by a [`PoolSelector`].
///
/// Given the target of a pool and the interceptor chain its calls should run
/// through, returns one live connection. [`PoolCreator`] turns a dialer into
/// the per-pool [`Connector`].
///
/// [`PoolSelector`]: super::PoolSelector
/// [`PoolCreator`]: super::PoolCreator
pub trait Dialer<T>: Send + Sync + 'static {
    fn dial(&self, target: &PoolTarget, interceptors: &InterceptorChain) -> ConnectFuture<T>;
}
