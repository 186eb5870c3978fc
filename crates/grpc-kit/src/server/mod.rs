//! gRPC server bootstrap.
//!
//! [`GrpcServer`] serves a set of tonic [`Routes`] behind the server
//! interceptor chain and a panic guard, with keepalive settings from
//! [`ServerConfig`], and stops gracefully on SIGINT, SIGTERM or SIGQUIT.
//!
//! Shutdown order after a signal:
//!
//! 1. the caller's hook runs (typically marking health checks not serving);
//! 2. a short grace period elapses;
//! 3. telemetry providers are flushed and shut down;
//! 4. the server stops accepting connections and drains in-flight calls;
//! 5. logs are flushed.

mod config;
mod layer;

pub use config::*;
pub use layer::{InterceptorLayer, InterceptorService, request_context};

use crate::{
    interceptor::{InterceptorChain, default_server_interceptors},
    signal::{SHUTDOWN_GRACE_PERIOD, wait_for_signal},
    telemetry::Telemetry,
};
use core::{any::Any, future::Future};
use futures::Stream;
use std::io;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{
    Status,
    codegen::http::Response,
    service::Routes,
    transport::{Server, server::Connected},
};
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
}

pub struct GrpcServer {
    config: ServerConfig,
    routes: Routes,
    interceptors: InterceptorChain,
    telemetry: Telemetry,
}

impl GrpcServer {
    /// A server for `routes` with the default server interceptor chain.
    pub fn new(config: ServerConfig, routes: Routes, telemetry: Telemetry) -> Self {
        let interceptors = default_server_interceptors(config.disable_metrics);
        Self {
            config,
            routes,
            interceptors,
            telemetry,
        }
    }

    /// Appends `extra` after the default interceptors.
    #[must_use]
    pub fn with_interceptors(mut self, extra: &InterceptorChain) -> Self {
        self.interceptors.extend(extra);
        self
    }

    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub const fn interceptors(&self) -> &InterceptorChain {
        &self.interceptors
    }

    /// Binds `config.addr` and serves until a shutdown signal.
    ///
    /// `on_signal` runs right after the signal is received.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound or the transport errors.
    pub async fn run_until_signal(
        self,
        on_signal: impl Future<Output = ()> + Send,
    ) -> Result<(), ServeError> {
        let listener = TcpListener::bind(&self.config.addr)
            .await
            .map_err(|source| ServeError::Bind {
                addr: self.config.addr.clone(),
                source,
            })?;
        let incoming = TcpListenerStream::new(listener);
        self.serve_with_incoming(incoming, on_signal).await
    }

    /// Serves connections from `incoming` until a shutdown signal.
    ///
    /// # Errors
    ///
    /// Returns the transport error that stopped the server.
    pub async fn serve_with_incoming<I, IO, IE>(
        self,
        incoming: I,
        on_signal: impl Future<Output = ()> + Send,
    ) -> Result<(), ServeError>
    where
        I: Stream<Item = Result<IO, IE>>,
        IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
        IE: Into<tower::BoxError>,
    {
        let telemetry = self.telemetry.clone();
        let service_name = self.config.service_name.clone();
        let shutdown = async move {
            let signal = wait_for_signal().await;
            tracing::info!(signal, service = %service_name, "stopping grpc server");
            on_signal.await;
            tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
            telemetry.shutdown_providers();
        };
        self.serve_with_shutdown(incoming, shutdown).await
    }

    /// Serves connections from `incoming` until `shutdown` resolves, then
    /// drains in-flight calls and flushes logs.
    ///
    /// # Errors
    ///
    /// Returns the transport error that stopped the server.
    pub async fn serve_with_shutdown<I, IO, IE>(
        self,
        incoming: I,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServeError>
    where
        I: Stream<Item = Result<IO, IE>>,
        IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
        IE: Into<tower::BoxError>,
    {
        let Self {
            config,
            routes,
            interceptors,
            telemetry,
        } = self;

        tracing::info!(
            service = %config.service_name,
            addr = %config.addr,
            interceptors = ?interceptors,
            "starting grpc server"
        );

        let mut builder = Server::builder()
            .http2_keepalive_interval(Some(config.keepalive_interval))
            .http2_keepalive_timeout(Some(config.keepalive_timeout))
            .tcp_keepalive(Some(config.tcp_keepalive));
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }

        let res = builder
            .layer(
                ServiceBuilder::new()
                    .layer(InterceptorLayer::new(interceptors))
                    .layer(CatchPanicLayer::custom(panic_response)),
            )
            .add_routes(routes)
            .serve_with_incoming_shutdown(incoming, shutdown)
            .await;

        match &res {
            Ok(()) => tracing::info!(service = %config.service_name, "grpc server stopped"),
            Err(err) => {
                tracing::error!(service = %config.service_name, error = %err, "grpc server failed");
            }
        }
        telemetry.flush_logs();
        Ok(res?)
    }
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response<tonic::body::Body> {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = detail, "handler panicked");
    Status::internal("internal server error").into_http()
}
