//! Error types shared by clients and servers.
//!
//! ## Submodules
//!
//! - [`codes`] - Numeric error codes carried by [`CommonError`].
//! - [`common`] - [`CommonError`], the code + message error reported across
//!   service boundaries, with conversions to and from [`tonic::Status`].
//! - [`typed`] - [`ErrorType`], package-scoped error kinds with wrapping
//!   semantics for in-process error chains.

pub mod codes;
pub mod common;
pub mod typed;

pub use codes::*;
pub use common::CommonError;
pub use typed::{ErrorType, TypedError};
