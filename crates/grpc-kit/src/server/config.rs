use core::time::Duration;

/// Time to wait for a keepalive ping ack before closing the connection.
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
/// Interval between TCP keepalive segments on accepted connections.
pub const DEFAULT_TCP_KEEPALIVE: Duration = Duration::from_secs(5 * 60);
/// Interval between HTTP/2 keepalive pings.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:50051";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// `host:port` to listen on.
    pub addr: String,
    pub service_name: String,
    pub keepalive_timeout: Duration,
    /// `SO_KEEPALIVE` interval for accepted sockets. This does not close
    /// idle connections; dead peers are detected by the kernel.
    pub tcp_keepalive: Duration,
    pub keepalive_interval: Duration,
    /// Leave the metrics stage out of the interceptor chain.
    pub disable_metrics: bool,
    /// Per-request timeout applied on top of any client `grpc-timeout`.
    pub request_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_SERVER_ADDR.to_string(),
            service_name: env!("CARGO_PKG_NAME").to_string(),
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            tcp_keepalive: DEFAULT_TCP_KEEPALIVE,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            disable_metrics: false,
            request_timeout: None,
        }
    }
}

impl ServerConfig {
    /// Default keepalive settings for `addr`.
    pub fn new(addr: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            service_name: service_name.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_keeps_default_keepalive_settings() {
        let config = ServerConfig::new("127.0.0.1:7000", "orders");
        assert_eq!(config.addr, "127.0.0.1:7000");
        assert_eq!(config.service_name, "orders");
        assert_eq!(config.keepalive_timeout, DEFAULT_KEEPALIVE_TIMEOUT);
        assert_eq!(config.tcp_keepalive, DEFAULT_TCP_KEEPALIVE);
        assert_eq!(config.keepalive_interval, DEFAULT_KEEPALIVE_INTERVAL);
        assert_eq!(config.request_timeout, None);
    }
}
