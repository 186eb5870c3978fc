//! Pooled unary gRPC client.
//!
//! [`RpcClient`] routes each call to the connection pool of its target
//! server, runs the interceptor chain around it and reports every failure as a
//! [`CommonError`].

mod config;
mod dialer;

pub use config::*;
pub use dialer::{ChannelDialer, InterceptedChannel};

use crate::{
    context::{Context, ContextError},
    error::{CommonError, ERR_CODE_GRPC, ERR_CODE_TIMEOUT},
    interceptor::{Call, default_client_interceptors},
    logger, pool,
    pool::{PoolSelector, PooledConnection},
    signal::{SHUTDOWN_GRACE_PERIOD, wait_for_signal},
    telemetry::Telemetry,
};
use std::sync::Arc;
use tonic::{
    Code, Status,
    codegen::http::uri::PathAndQuery,
    metadata::MetadataMap,
    transport::Channel,
};

/// Client side of the kit: pools, interceptors and shutdown handling.
#[derive(Clone, Debug)]
pub struct RpcClient {
    service_name: Arc<str>,
    pools: Arc<PoolSelector<InterceptedChannel>>,
    telemetry: Telemetry,
}

impl RpcClient {
    /// Builds the default interceptor chain and a pool selector over
    /// [`ChannelDialer`], then runs the configured pool creators.
    ///
    /// # Errors
    ///
    /// Returns [`pool::Error::InvalidConfig`] if the default pool config is
    /// rejected. Failing creators are logged and skipped.
    pub async fn new(
        ctx: &Context,
        config: ClientConfig,
        telemetry: Telemetry,
    ) -> pool::Result<Self> {
        config.default_pool_config.validate()?;

        let dialer = ChannelDialer::new(config.tls.clone());
        let interceptors = default_client_interceptors(config.disable_metrics);
        let pools = Arc::new(
            PoolSelector::with_creators(ctx, dialer, interceptors, &config.creators).await,
        );
        pools.set_default_config(config.default_pool_config)?;

        if let Some(period) = config.sweep_interval {
            pools.spawn_sweeper(period);
        }

        tracing::info!(
            parent: &logger::span(ctx),
            service = %config.service_name,
            pools = ?pools.addresses(),
            "grpc client started"
        );
        Ok(Self {
            service_name: config.service_name.into(),
            pools,
            telemetry,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub const fn pools(&self) -> &Arc<PoolSelector<InterceptedChannel>> {
        &self.pools
    }

    /// Invokes the unary method `full_method` (`/pkg.Service/Method`) on
    /// `server`, creating its pool on first use.
    ///
    /// The call is bounded by `ctx`: its deadline is sent as `grpc-timeout`
    /// and cancelling it aborts the call.
    ///
    /// # Errors
    ///
    /// - [`ERR_CODE_TIMEOUT`] if no connection could be obtained before the
    ///   deadline, otherwise [`ERR_CODE_GRPC`] for any pool failure.
    /// - The [`CommonError`] translation of the response status otherwise.
    pub async fn call<Req, Resp>(
        &self,
        ctx: &Context,
        server: &str,
        full_method: &str,
        request: Req,
    ) -> Result<Resp, CommonError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let path = PathAndQuery::try_from(full_method)
            .map_err(|err| CommonError::grpc(format!("invalid method {full_method}: {err}")))?;

        let conn = match self.checkout(ctx, server).await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::debug!(
                    parent: &logger::span(ctx),
                    server,
                    error = %err,
                    "failed to get pooled connection"
                );
                return Err(dial_error(server, &err));
            }
        };

        let mut call = Call::client(ctx.clone(), server, full_method);
        let channel = conn.channel().clone();
        let res = conn
            .interceptors()
            .intercept(&mut call, |metadata| async move {
                match ctx.run(unary(channel, path, metadata, request, ctx)).await {
                    Ok(res) => res,
                    Err(ContextError::DeadlineExceeded) => {
                        Err(Status::deadline_exceeded(ContextError::DeadlineExceeded.to_string()))
                    }
                    Err(ContextError::Cancelled) => {
                        Err(Status::cancelled(ContextError::Cancelled.to_string()))
                    }
                }
            })
            .await;

        match res {
            Ok(resp) => Ok(resp),
            Err(status) => {
                if is_transport_failure(&status) {
                    tracing::debug!(
                        parent: &logger::span(ctx),
                        server,
                        code = ?status.code(),
                        "discarding broken connection"
                    );
                    conn.discard();
                }
                Err(CommonError::from(status))
            }
        }
    }

    async fn checkout(
        &self,
        ctx: &Context,
        server: &str,
    ) -> pool::Result<PooledConnection<InterceptedChannel>> {
        self.pools.get(ctx, server, true).await
    }

    /// Waits for SIGINT, SIGTERM or SIGQUIT, then shuts the client down
    /// after a short grace period.
    pub async fn listen_signals(&self) {
        let signal = wait_for_signal().await;
        tracing::info!(signal, service = %self.service_name, "stopping grpc client");
        tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
        self.shutdown();
    }

    /// Shuts down telemetry providers, closes every pool, then flushes logs.
    pub fn shutdown(&self) {
        self.telemetry.shutdown_providers();
        self.pools.close();
        tracing::info!(service = %self.service_name, "all connections closed and grpc client stopped");
        self.telemetry.flush_logs();
    }
}

async fn unary<Req, Resp>(
    channel: Channel,
    path: PathAndQuery,
    metadata: MetadataMap,
    message: Req,
    ctx: &Context,
) -> Result<Resp, Status>
where
    Req: prost::Message + Send + Sync + 'static,
    Resp: prost::Message + Default + Send + Sync + 'static,
{
    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready()
        .await
        .map_err(|err| Status::unavailable(format!("service was not ready: {err}")))?;

    let mut request = tonic::Request::new(message);
    *request.metadata_mut() = metadata;
    if let Some(remaining) = ctx.remaining() {
        request.set_timeout(remaining);
    }

    let codec = tonic_prost::ProstCodec::<Req, Resp>::default();
    grpc.unary(request, path, codec)
        .await
        .map(tonic::Response::into_inner)
}

/// The error a caller sees when no connection could be obtained.
fn dial_error(server: &str, err: &pool::Error) -> CommonError {
    let code = match err {
        pool::Error::Timeout { .. } => ERR_CODE_TIMEOUT,
        _ => ERR_CODE_GRPC,
    };
    CommonError::with_code(
        code,
        format!("DialContext error, server = {server}, err = {err}"),
    )
}

/// Whether `status` means the connection itself is unusable.
fn is_transport_failure(status: &Status) -> bool {
    match status.code() {
        Code::Unavailable => true,
        Code::Unknown => std::error::Error::source(status).is_some(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeouts_map_to_timeout_code() {
        let err = pool::Error::Timeout {
            address: "10.0.0.1:9000".to_string(),
        };
        let common = dial_error("10.0.0.1:9000", &err);
        assert_eq!(common.code(), ERR_CODE_TIMEOUT);
        assert_eq!(
            common.msg(),
            "DialContext error, server = 10.0.0.1:9000, err = timed out acquiring connection to 10.0.0.1:9000"
        );
    }

    #[test]
    fn other_pool_errors_map_to_grpc_code() {
        for err in [
            pool::Error::SelectorClosed,
            pool::Error::Cancelled {
                address: "10.0.0.1:9000".to_string(),
            },
            pool::Error::CreationFailure {
                address: "10.0.0.1:9000".to_string(),
                source: "connection refused".into(),
            },
        ] {
            assert_eq!(dial_error("10.0.0.1:9000", &err).code(), ERR_CODE_GRPC);
        }
    }

    #[test]
    fn only_transport_failures_discard() {
        assert!(is_transport_failure(&Status::unavailable("connection reset")));
        assert!(!is_transport_failure(&Status::unknown("handler said so")));
        assert!(!is_transport_failure(&Status::invalid_argument("bad input")));
        assert!(!is_transport_failure(&Status::deadline_exceeded("slow")));
    }
}
