//! Log output and context-aware spans.
//!
//! Logs go through `tracing`. [`LogHandle`] owns the destination (an
//! append-mode file, by default [`LOG_FILENAME`], or stderr) and builds the
//! `fmt` layer installed by [`crate::telemetry::Telemetry::init`].
//!
//! [`span`] turns a [`Context`] into a span carrying the default request
//! fields and the context's permanent fields. Library code emits events with
//! `parent: &logger::span(ctx)` so every line of a request shares them.

use crate::context::Context;
use std::{
    fs::{File, OpenOptions},
    io,
    path::PathBuf,
    sync::Arc,
};
use tracing::{Span, Subscriber, field};
use tracing_subscriber::{
    EnvFilter,
    filter::LevelFilter,
    fmt::{
        self,
        format::{DefaultFields, Format, Full},
        time::ChronoLocal,
        writer::BoxMakeWriter,
    },
    registry::LookupSpan,
};

pub const LOG_FILENAME: &str = "server.log";

pub const TRACE_TRACE_ID: &str = "trace.traceid";
pub const TRACE_SPAN_ID: &str = "trace.spanid";
pub const GRPC_REQUEST_SERVICE: &str = "grpc.request.service";
pub const GRPC_REQUEST_METHOD: &str = "grpc.request.method";

/// The `fmt` layer built by [`LogHandle::layer`].
pub type LogLayer<S> = fmt::Layer<S, DefaultFields, Format<Full, ChronoLocal>, BoxMakeWriter>;

/// Context tags promoted to span fields.
pub const DEFAULT_LOG_FIELDS: [&str; 4] = [
    TRACE_TRACE_ID,
    TRACE_SPAN_ID,
    GRPC_REQUEST_SERVICE,
    GRPC_REQUEST_METHOD,
];

#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Default level; `RUST_LOG` overrides it.
    pub level: LevelFilter,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
    /// Colorize stderr output. Files are never colorized.
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            file: None,
            ansi: true,
        }
    }
}

impl LogConfig {
    /// Logs to [`LOG_FILENAME`] in the working directory.
    pub fn to_default_file() -> Self {
        Self {
            file: Some(PathBuf::from(LOG_FILENAME)),
            ..Self::default()
        }
    }

    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(self.level.into())
            .from_env_lossy()
    }
}

/// The open log destination.
#[derive(Clone, Debug, Default)]
pub struct LogHandle {
    file: Option<Arc<File>>,
    ansi: bool,
}

impl LogHandle {
    /// Opens the configured log file, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be opened for appending.
    pub fn open(config: &LogConfig) -> io::Result<Self> {
        let file = match &config.file {
            Some(path) => Some(Arc::new(
                OpenOptions::new().create(true).append(true).open(path)?,
            )),
            None => None,
        };
        Ok(Self {
            file,
            ansi: config.ansi,
        })
    }

    /// The `fmt` layer writing to this destination.
    pub fn layer<S>(&self) -> LogLayer<S>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let (writer, ansi) = match &self.file {
            Some(file) => (BoxMakeWriter::new(Arc::clone(file)), false),
            None => (BoxMakeWriter::new(io::stderr), self.ansi),
        };

        fmt::layer()
            .with_thread_ids(true)
            .with_line_number(true)
            .with_target(false)
            .with_timer(ChronoLocal::rfc_3339())
            .with_file(true)
            .with_ansi(ansi)
            .with_writer(writer)
    }

    /// Flushes buffered log data to disk. A no-op for stderr.
    ///
    /// # Errors
    ///
    /// Returns the I/O error reported by the file system.
    pub fn sync(&self) -> io::Result<()> {
        match &self.file {
            Some(file) => file.sync_data(),
            None => Ok(()),
        }
    }
}

/// A span carrying `ctx`'s request fields.
///
/// The [`DEFAULT_LOG_FIELDS`] tags become span fields of the same name. All
/// other tags and the permanent fields are rendered together into `fields`.
pub fn span(ctx: &Context) -> Span {
    let span = tracing::info_span!(
        "ctx",
        trace.traceid = field::Empty,
        trace.spanid = field::Empty,
        grpc.request.service = field::Empty,
        grpc.request.method = field::Empty,
        fields = field::Empty,
    );

    let mut extra = Vec::new();
    for (key, value) in ctx.tags() {
        if DEFAULT_LOG_FIELDS.contains(&key.as_str()) {
            span.record(key.as_str(), value.as_str());
        } else {
            extra.push(format!("{key}={value}"));
        }
    }
    for (key, value) in ctx.permanent_fields() {
        extra.push(format!("{key}={value}"));
    }
    if !extra.is_empty() {
        span.record("fields", extra.join(" "));
    }
    span
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn temp_log(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("grpc-kit-{}-{name}.log", std::process::id()))
    }

    #[test]
    fn file_output_carries_context_fields() {
        let path = temp_log("fields");
        let config = LogConfig {
            level: LevelFilter::DEBUG,
            file: Some(path.clone()),
            ansi: true,
        };
        let handle = LogHandle::open(&config).unwrap();
        let subscriber = tracing_subscriber::registry().with(handle.layer());

        let ctx = Context::background()
            .with_tag(GRPC_REQUEST_METHOD, "Check")
            .with_tag("tenant", "acme");
        ctx.add_permanent_field("region", "eu-west-1");

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(parent: &span(&ctx), "handled");
        });
        handle.sync().unwrap();

        let out = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert!(out.contains("handled"));
        assert!(out.contains("grpc.request.method"));
        assert!(out.contains("Check"));
        assert!(out.contains("tenant=acme region=eu-west-1"));
        assert!(!out.contains("\u{1b}["), "file output must not be colorized");
    }

    #[test]
    fn stderr_handle_syncs_trivially() {
        let handle = LogHandle::open(&LogConfig::default()).unwrap();
        assert!(handle.sync().is_ok());
    }
}
