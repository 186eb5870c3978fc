use crate::pool::{PoolConfig, PoolCreator};
use core::time::Duration;
use tonic::transport::ClientTlsConfig;

/// How often idle connections are swept by default.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub service_name: String,
    /// Config of pools created on demand by [`RpcClient::call`].
    ///
    /// [`RpcClient::call`]: super::RpcClient::call
    pub default_pool_config: PoolConfig,
    /// Pools built eagerly when the client starts.
    pub creators: Vec<PoolCreator>,
    /// Leave the metrics stage out of the interceptor chain.
    pub disable_metrics: bool,
    /// Background sweep of expired idle connections; `None` relies on lazy
    /// eviction at acquire time only.
    pub sweep_interval: Option<Duration>,
    /// TLS settings for `secure` pools. Defaults to the platform's native
    /// roots.
    pub tls: Option<ClientTlsConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_name: env!("CARGO_PKG_NAME").to_string(),
            default_pool_config: PoolConfig::default(),
            creators: Vec::new(),
            disable_metrics: false,
            sweep_interval: Some(DEFAULT_SWEEP_INTERVAL),
            tls: None,
        }
    }
}

impl ClientConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_default_pool_config(mut self, config: PoolConfig) -> Self {
        self.default_pool_config = config;
        self
    }

    #[must_use]
    pub fn with_creator(mut self, creator: PoolCreator) -> Self {
        self.creators.push(creator);
        self
    }

    #[must_use]
    pub const fn with_metrics_disabled(mut self, disable: bool) -> Self {
        self.disable_metrics = disable;
        self
    }

    #[must_use]
    pub const fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: ClientTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}
