#![doc = include_str!("../README.md")]

pub mod client;
pub mod context;
pub mod error;
pub mod interceptor;
pub mod logger;
pub mod pool;
pub mod server;
pub mod signal;
pub mod telemetry;

pub use context::Context;
pub use error::CommonError;
