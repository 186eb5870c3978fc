//! Connection pools keyed by remote server address.
//!
//! This module owns the client-side connection management used by
//! [`crate::client::RpcClient`]. It is generic over the connection type so the
//! engine can be exercised without a network; the tonic channel dialer lives
//! in [`crate::client`].
//!
//! ## Structure
//!
//! - [`Pool`] - a bounded set of connections to one address, with idle
//!   timeout, max lifetime, blocking acquire and graceful close.
//! - [`PoolSelector`] - routes an address to its [`Pool`], creating pools on
//!   demand and tearing all of them down on shutdown.
//! - [`PoolCreator`] - builds a [`Pool`] for a [`PoolTarget`] outside the
//!   selector lock, then commits it under the lock. The first writer wins
//!   unless overwriting is requested; losers close themselves.
//! - [`Dialer`] / [`Connector`] - the transport seam: how a single connection
//!   is established.
//!
//! ## Locking
//!
//! The selector's address map sits behind one reader/writer lock. Each pool
//! guards its idle set and counters with its own mutex, so a caller blocked
//! in [`Pool::acquire`] never holds the selector lock. No lock is held across
//! an `.await`.

mod config;
mod connection;
mod creator;
mod dialer;
mod engine;
mod error;
mod selector;


pub use config::*;
pub use connection::Connection;
pub use creator::{PoolCreator, Registration};
pub use dialer::{BoxError, ConnectFuture, Connector, Dialer};
pub use engine::{Pool, PoolStats, PooledConnection};
pub use error::{ConnectTimeout, Error, Result};
pub use selector::PoolSelector;
