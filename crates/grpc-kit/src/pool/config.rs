use super::error::{Error, Result};
use core::time::Duration;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_INIT_SIZE: usize = 0;
pub const DEFAULT_MAX_SIZE: usize = 5;
pub const DEFAULT_SECURE: bool = false;

/// Sizing and timing policy of a single [`Pool`](super::Pool).
///
/// A zero duration disables the corresponding limit: connections never idle
/// out, never age out, or connect without a deadline of their own.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// How long a connection may sit unused in the pool before eviction.
    pub idle_timeout: Duration,
    /// Deadline for establishing one connection.
    pub create_timeout: Duration,
    /// Age after which a connection is retired regardless of use.
    pub max_lifetime: Duration,
    /// Connections created eagerly when the pool is built.
    pub init_size: usize,
    /// Upper bound on live (idle + checked out) connections.
    pub max_size: usize,
    /// Dial with TLS.
    pub secure: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            create_timeout: DEFAULT_CREATE_TIMEOUT,
            max_lifetime: DEFAULT_MAX_LIFETIME,
            init_size: DEFAULT_INIT_SIZE,
            max_size: DEFAULT_MAX_SIZE,
            secure: DEFAULT_SECURE,
        }
    }
}

impl PoolConfig {
    pub const fn new(
        idle_timeout: Duration,
        create_timeout: Duration,
        max_lifetime: Duration,
        init_size: usize,
        max_size: usize,
        secure: bool,
    ) -> Self {
        Self {
            idle_timeout,
            create_timeout,
            max_lifetime,
            init_size,
            max_size,
            secure,
        }
    }

    /// Checks `max_size >= 1` and `init_size <= max_size`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the violated bound.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::InvalidConfig {
                reason: "max_size must be greater than 0".to_string(),
            });
        }
        if self.init_size > self.max_size {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "init_size ({}) exceeds max_size ({})",
                    self.init_size, self.max_size
                ),
            });
        }
        Ok(())
    }
}

/// A [`PoolConfig`] bound to the `host:port` it dials.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolTarget {
    pub address: String,
    pub config: PoolConfig,
}

impl PoolTarget {
    pub fn new(address: impl Into<String>, config: PoolConfig) -> Self {
        Self {
            address: address.into(),
            config,
        }
    }

    pub fn with_defaults(address: impl Into<String>) -> Self {
        Self::new(address, PoolConfig::default())
    }
}
