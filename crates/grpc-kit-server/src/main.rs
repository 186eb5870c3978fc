#![doc = include_str!("../README.md")]

mod config;

use clap::Parser;
use config::{AppConfig, CliArgs};
use grpc_kit::{server::GrpcServer, telemetry::Telemetry};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::service::Routes;
use tonic_health::{ServingStatus, server::HealthReporter};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = AppConfig::try_from(args)?;

    let telemetry = Telemetry::init(&config.telemetry)?;

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    let routes = Routes::new(health_service);
    let server = GrpcServer::new(config.server.clone(), routes, telemetry);
    let on_signal = mark_not_serving(health_reporter);

    if config.uds {
        #[cfg(unix)]
        {
            use tokio::net::UnixListener;
            use tokio_stream::wrappers::UnixListenerStream;
            let uds_path = config.server.addr.clone();
            let uds = UnixListener::bind(&uds_path)?;
            let incoming = UnixListenerStream::new(uds);
            log_startup_info(&config);
            let res = server.serve_with_incoming(incoming, on_signal).await;
            // A panic can still leave the socket file behind.
            let _ = std::fs::remove_file(&uds_path);
            Ok(res?)
        }
        #[cfg(not(unix))]
        {
            anyhow::bail!("Unix domain sockets are not supported on this platform");
        }
    } else {
        let tcp = TcpListener::bind(&config.server.addr).await?;
        let incoming = TcpListenerStream::new(tcp);
        log_startup_info(&config);
        Ok(server.serve_with_incoming(incoming, on_signal).await?)
    }
}

fn log_startup_info(config: &AppConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting {} on {} with full config: {:#?}",
            config.server.service_name,
            config.server.addr,
            config
        );
    } else {
        tracing::info!(
            "Starting {} on {}",
            config.server.service_name,
            config.server.addr
        );
    }
}

/// Health checks report `NOT_SERVING` as soon as shutdown begins so load
/// balancers drain the instance during the grace period.
async fn mark_not_serving(health_reporter: HealthReporter) {
    health_reporter
        .set_service_status("", ServingStatus::NotServing)
        .await;
    tracing::info!("health status set to NOT_SERVING");
}
