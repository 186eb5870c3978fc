use anyhow::{Context as _, bail};
use clap::Parser;
use core::time::Duration;
use grpc_kit::{
    logger::{LOG_FILENAME, LogConfig},
    server::{
        DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_KEEPALIVE_TIMEOUT, DEFAULT_TCP_KEEPALIVE,
        DEFAULT_SERVER_ADDR, ServerConfig,
    },
    telemetry::TelemetryConfig,
};
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;

/// Runtime configuration for the `grpc-kit-server` binary.
///
/// Every flag falls back to an environment variable, and a `.env` file in
/// the working directory is loaded before parsing.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "grpc-kit-server",
    version,
    about = "A gRPC server with health checks, telemetry and graceful shutdown"
)]
pub struct CliArgs {
    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:50051" or "/tmp/grpc-kit.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from(DEFAULT_SERVER_ADDR))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,

    /// Name reported in logs and as the OpenTelemetry `service.name`.
    ///
    /// Environment variable: `SERVICE_NAME`
    #[arg(long, env = "SERVICE_NAME", default_value_t = String::from("grpc-kit-server"))]
    pub service_name: String,

    /// Seconds to wait for a keepalive ping ack before closing a connection.
    ///
    /// Environment variable: `KEEPALIVE_TIMEOUT_SECS`
    #[arg(long, env = "KEEPALIVE_TIMEOUT_SECS", default_value_t = DEFAULT_KEEPALIVE_TIMEOUT.as_secs())]
    pub keepalive_timeout_secs: u64,

    /// Seconds between HTTP/2 keepalive pings.
    ///
    /// Environment variable: `KEEPALIVE_INTERVAL_SECS`
    #[arg(long, env = "KEEPALIVE_INTERVAL_SECS", default_value_t = DEFAULT_KEEPALIVE_INTERVAL.as_secs())]
    pub keepalive_interval_secs: u64,

    /// Seconds between TCP keepalive segments on accepted connections.
    ///
    /// Environment variable: `TCP_KEEPALIVE_SECS`
    #[arg(long, env = "TCP_KEEPALIVE_SECS", default_value_t = DEFAULT_TCP_KEEPALIVE.as_secs())]
    pub tcp_keepalive_secs: u64,

    /// Per-request timeout in milliseconds. `0` leaves requests unbounded
    /// unless the client sends `grpc-timeout`.
    ///
    /// Environment variable: `REQUEST_TIMEOUT_MS`
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 0)]
    pub request_timeout_ms: u64,

    /// Leave the metrics interceptor out of the server chain.
    ///
    /// Environment variable: `DISABLE_METRICS`
    #[arg(long, env = "DISABLE_METRICS", default_value_t = false)]
    pub disable_metrics: bool,

    /// Default log level (`error`, `warn`, `info`, `debug`, `trace` or
    /// `off`). `RUST_LOG` takes precedence when set.
    ///
    /// Environment variable: `LOG_LEVEL`
    #[arg(long, env = "LOG_LEVEL", default_value_t = String::from("info"))]
    pub log_level: String,

    /// Append logs to this file instead of stderr. Pass `--log-to-file`
    /// without `LOG_FILE` to use `server.log`.
    ///
    /// Environment variable: `LOG_FILE`
    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Log to `server.log` when `LOG_FILE` is unset.
    #[arg(long, default_value_t = false)]
    pub log_to_file: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub uds: bool,
}

impl TryFrom<CliArgs> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.keepalive_timeout_secs == 0 {
            bail!("KEEPALIVE_TIMEOUT_SECS must be greater than 0");
        }
        if args.keepalive_interval_secs == 0 {
            bail!("KEEPALIVE_INTERVAL_SECS must be greater than 0");
        }
        if args.tcp_keepalive_secs == 0 {
            bail!("TCP_KEEPALIVE_SECS must be greater than 0");
        }
        if args.service_name.trim().is_empty() {
            bail!("SERVICE_NAME must not be empty");
        }

        let level: LevelFilter = args
            .log_level
            .parse()
            .with_context(|| format!("invalid LOG_LEVEL {:?}", args.log_level))?;
        let file = match (args.log_file, args.log_to_file) {
            (Some(path), _) => Some(path),
            (None, true) => Some(PathBuf::from(LOG_FILENAME)),
            (None, false) => None,
        };

        let server = ServerConfig {
            addr: args.server_addr,
            service_name: args.service_name.clone(),
            keepalive_timeout: Duration::from_secs(args.keepalive_timeout_secs),
            tcp_keepalive: Duration::from_secs(args.tcp_keepalive_secs),
            keepalive_interval: Duration::from_secs(args.keepalive_interval_secs),
            disable_metrics: args.disable_metrics,
            request_timeout: (args.request_timeout_ms > 0)
                .then(|| Duration::from_millis(args.request_timeout_ms)),
        };
        let telemetry = TelemetryConfig {
            service_name: args.service_name,
            log: LogConfig {
                level,
                file,
                ..LogConfig::default()
            },
        };

        Ok(Self {
            server,
            telemetry,
            uds: args.uds,
        })
    }
}
