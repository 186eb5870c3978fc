use crate::{
    interceptor::InterceptorChain,
    pool::{BoxError, ConnectFuture, Dialer, PoolTarget},
};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

/// A connected tonic channel plus the interceptors its calls run through.
#[derive(Clone, Debug)]
pub struct InterceptedChannel {
    channel: Channel,
    interceptors: InterceptorChain,
    address: String,
}

impl InterceptedChannel {
    pub const fn channel(&self) -> &Channel {
        &self.channel
    }

    pub const fn interceptors(&self) -> &InterceptorChain {
        &self.interceptors
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

/// Dials `http://host:port` (or `https://` for secure targets) and connects
/// eagerly, bounded by the target's create timeout.
#[derive(Clone, Debug, Default)]
pub struct ChannelDialer {
    tls: Option<ClientTlsConfig>,
}

impl ChannelDialer {
    pub const fn new(tls: Option<ClientTlsConfig>) -> Self {
        Self { tls }
    }
}

impl Dialer<InterceptedChannel> for ChannelDialer {
    fn dial(
        &self,
        target: &PoolTarget,
        interceptors: &InterceptorChain,
    ) -> ConnectFuture<InterceptedChannel> {
        Box::pin(connect(
            target.clone(),
            interceptors.clone(),
            self.tls.clone(),
        ))
    }
}

pub(crate) fn endpoint(
    target: &PoolTarget,
    tls: Option<ClientTlsConfig>,
) -> Result<Endpoint, BoxError> {
    let scheme = if target.config.secure { "https" } else { "http" };
    let mut endpoint = Endpoint::from_shared(format!("{scheme}://{}", target.address))?;
    if !target.config.create_timeout.is_zero() {
        endpoint = endpoint.connect_timeout(target.config.create_timeout);
    }
    if target.config.secure {
        endpoint = endpoint
            .tls_config(tls.unwrap_or_else(|| ClientTlsConfig::new().with_native_roots()))?;
    }
    Ok(endpoint)
}

async fn connect(
    target: PoolTarget,
    interceptors: InterceptorChain,
    tls: Option<ClientTlsConfig>,
) -> Result<InterceptedChannel, BoxError> {
    let channel = endpoint(&target, tls)?.connect().await?;
    tracing::trace!(server = %target.address, "channel connected");
    Ok(InterceptedChannel {
        channel,
        interceptors,
        address: target.address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use core::time::Duration;

    #[test]
    fn plaintext_targets_use_http() {
        let target = PoolTarget::with_defaults("127.0.0.1:50051");
        let endpoint = endpoint(&target, None).unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("http"));
        assert_eq!(endpoint.uri().authority().unwrap().as_str(), "127.0.0.1:50051");
    }

    #[test]
    fn secure_targets_use_https() {
        let target = PoolTarget::new(
            "example.com:443",
            PoolConfig {
                secure: true,
                create_timeout: Duration::ZERO,
                ..PoolConfig::default()
            },
        );
        let endpoint = endpoint(&target, None).unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("https"));
    }

    #[test]
    fn malformed_address_is_rejected() {
        let target = PoolTarget::with_defaults("not a host");
        assert!(endpoint(&target, None).is_err());
    }
}
