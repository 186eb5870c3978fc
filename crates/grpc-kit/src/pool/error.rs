//! Error kinds raised by pools and the selector.
//!
//! Every variant maps onto a [`CommonError`] code so callers across service
//! boundaries see a uniform code + message pair, and onto a [`Status`] for
//! handlers that forward pool failures to their own clients.

use super::dialer::BoxError;
use crate::context::ContextError;
use crate::error::{
    CommonError, ERR_CODE_CANCELLED, ERR_CODE_INVALID_CONFIG, ERR_CODE_POOL_CLOSED,
    ERR_CODE_POOL_CREATION, ERR_CODE_POOL_NOT_INITIALIZED, ERR_CODE_SELECTOR_CLOSED,
    ERR_CODE_SERVER, ERR_CODE_TIMEOUT,
};
use core::time::Duration;
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No pool is registered for the address and on-demand creation was not
    /// requested.
    #[error("pool not initialized for {address}")]
    NotInitialized { address: String },

    /// The dialer failed or exceeded the pool's create timeout.
    #[error("failed to create connection to {address}: {source}")]
    CreationFailure {
        address: String,
        #[source]
        source: BoxError,
    },

    /// The caller's deadline elapsed while waiting for or creating a
    /// connection.
    #[error("timed out acquiring connection to {address}")]
    Timeout { address: String },

    /// The caller's context was cancelled while waiting for or creating a
    /// connection.
    #[error("cancelled while acquiring connection to {address}")]
    Cancelled { address: String },

    #[error("connection pool for {address} is closed")]
    PoolClosed { address: String },

    #[error("pool selector is closed")]
    SelectorClosed,

    #[error("invalid pool config: {reason}")]
    InvalidConfig { reason: String },

    #[error("internal pool error: {context}")]
    Internal { context: String },
}

impl Error {
    pub(crate) fn from_context(err: ContextError, address: &str) -> Self {
        let address = address.to_string();
        match err {
            ContextError::Cancelled => Self::Cancelled { address },
            ContextError::DeadlineExceeded => Self::Timeout { address },
        }
    }

    /// The [`CommonError`] code this error is reported with.
    pub const fn code(&self) -> i32 {
        match self {
            Self::NotInitialized { .. } => ERR_CODE_POOL_NOT_INITIALIZED,
            Self::CreationFailure { .. } => ERR_CODE_POOL_CREATION,
            Self::Timeout { .. } => ERR_CODE_TIMEOUT,
            Self::Cancelled { .. } => ERR_CODE_CANCELLED,
            Self::PoolClosed { .. } => ERR_CODE_POOL_CLOSED,
            Self::SelectorClosed => ERR_CODE_SELECTOR_CLOSED,
            Self::InvalidConfig { .. } => ERR_CODE_INVALID_CONFIG,
            Self::Internal { .. } => ERR_CODE_SERVER,
        }
    }
}

impl From<Error> for CommonError {
    fn from(err: Error) -> Self {
        CommonError::with_code(err.code(), err.to_string())
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Timeout { .. } => Status::deadline_exceeded(err.to_string()),
            Error::Cancelled { .. } => Status::cancelled(err.to_string()),
            Error::NotInitialized { .. } => Status::failed_precondition(err.to_string()),
            Error::CreationFailure { .. } | Error::PoolClosed { .. } | Error::SelectorClosed => {
                Status::unavailable(err.to_string())
            }
            Error::InvalidConfig { .. } => Status::invalid_argument(err.to_string()),
            Error::Internal { .. } => Status::internal(err.to_string()),
        }
    }
}

/// Source of a [`Error::CreationFailure`] when the dialer outlived the pool's
/// create timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("connect timed out after {0:?}")]
pub struct ConnectTimeout(pub Duration);
