//! # Telemetry
//!
//! Logging is always on: [`Telemetry::init`] installs a `tracing-subscriber`
//! registry with an `EnvFilter` and the `fmt` layer from
//! [`LogHandle`](crate::logger::LogHandle). OpenTelemetry export is opt-in.
//!
//! ## Feature matrix
//!
//! - `trace`: OpenTelemetry tracer provider, `tracing-opentelemetry` layer and
//!   the W3C trace-context propagator used by
//!   [`TracingInterceptor`](crate::interceptor::TracingInterceptor).
//! - `metrics`: OpenTelemetry meter provider and the call and pool metrics
//!   recorded by the helper functions below.
//! - `honeycomb`: Honeycomb OTLP exporter (reads `HONEYCOMB_API_KEY`,
//!   `HONEYCOMB_DATASET`, `HONEYCOMB_ENDPOINT`, `HONEYCOMB_COMPRESSION`).
//! - `stdout`: stdout exporter.
//!
//! Exporters require at least one of `trace` or `metrics`. Without `metrics`
//! every metric helper compiles to a no-op.
//!
//! ## Shutdown
//!
//! [`Telemetry::shutdown_providers`] flushes and stops the providers and
//! [`Telemetry::flush_logs`] syncs the log file. Clients and servers call
//! them in that order around closing their own resources.

#[cfg(all(feature = "honeycomb", not(any(feature = "trace", feature = "metrics"))))]
compile_error!("The 'honeycomb' feature requires at least one of 'trace' or 'metrics' to be enabled.");

#[cfg(all(feature = "stdout", not(any(feature = "trace", feature = "metrics"))))]
compile_error!("The 'stdout' feature requires at least one of 'trace' or 'metrics' to be enabled.");

use crate::logger::{LogConfig, LogHandle};
use anyhow::Context as _;
use core::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "trace")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(all(feature = "honeycomb", feature = "metrics"))]
use opentelemetry_sdk::metrics::Temporality;
#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "trace")))]
use tonic::{metadata::MetadataMap, transport::ClientTlsConfig};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;

#[cfg(any(feature = "metrics", feature = "trace"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "trace"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "trace"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "trace")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "trace")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "trace")]
use opentelemetry_sdk::trace as sdktrace;

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Reported as the OpenTelemetry `service.name` resource attribute.
    pub service_name: String,
    pub log: LogConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: env!("CARGO_PKG_NAME").to_string(),
            log: LogConfig::default(),
        }
    }
}

static TELEMETRY: OnceLock<Telemetry> = OnceLock::new();
static INIT: Mutex<()> = Mutex::new(());

struct Inner {
    log: LogHandle,
    providers_down: AtomicBool,
    #[cfg(feature = "trace")]
    tracer_provider: Option<sdktrace::SdkTracerProvider>,
    #[cfg(feature = "metrics")]
    meter_provider: Option<sdkmetrics::SdkMeterProvider>,
}

/// Handle to the process-wide logging and OpenTelemetry state.
///
/// Cheap to clone; all clones share the same providers.
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Telemetry")
            .field("log", &self.inner.log)
            .field(
                "providers_down",
                &self.inner.providers_down.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl Telemetry {
    /// Installs the global subscriber and providers.
    ///
    /// Only the first call does any work; later calls return the same handle
    /// and ignore `config`.
    ///
    /// # Errors
    ///
    /// Fails if the log file cannot be opened, an exporter cannot be built,
    /// or another global `tracing` subscriber is already installed.
    pub fn init(config: &TelemetryConfig) -> anyhow::Result<Self> {
        if let Some(telemetry) = TELEMETRY.get() {
            return Ok(telemetry.clone());
        }
        let _init = INIT.lock();
        if let Some(telemetry) = TELEMETRY.get() {
            return Ok(telemetry.clone());
        }

        let telemetry = Self::install(config)?;
        Ok(TELEMETRY.get_or_init(|| telemetry).clone())
    }

    /// A handle that installs nothing and logs to stderr through whatever
    /// subscriber is already set. Shutting it down is a no-op.
    pub fn noop() -> Self {
        Self {
            inner: Arc::new(Inner {
                log: LogHandle::default(),
                providers_down: AtomicBool::new(false),
                #[cfg(feature = "trace")]
                tracer_provider: None,
                #[cfg(feature = "metrics")]
                meter_provider: None,
            }),
        }
    }

    fn install(config: &TelemetryConfig) -> anyhow::Result<Self> {
        let log = LogHandle::open(&config.log).context("failed to open log file")?;

        #[cfg(feature = "trace")]
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

        #[cfg(feature = "trace")]
        let tracer_provider = init_tracer(&config.service_name)?;

        #[cfg(feature = "metrics")]
        let meter_provider = init_metrics(&config.service_name)?;

        #[cfg(any(feature = "metrics", feature = "trace"))]
        let scope = InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(semvcns::SCHEMA_URL)
            .build();

        let registry = tracing_subscriber::registry()
            .with(config.log.env_filter())
            .with(log.layer());

        #[cfg(feature = "trace")]
        let registry = {
            opentelemetry::global::set_tracer_provider(tracer_provider.clone());
            registry.with(
                tracing_opentelemetry::layer()
                    .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                    .with_error_records_to_exceptions(true),
            )
        };

        #[cfg(feature = "metrics")]
        let registry = {
            opentelemetry::global::set_meter_provider(meter_provider.clone());
            let meter = opentelemetry::global::meter_with_scope(scope);
            init_metric_handles(&meter);

            registry.with(tracing_opentelemetry::MetricsLayer::new(
                meter_provider.clone(),
            ))
        };

        registry
            .try_init()
            .context("a global tracing subscriber is already installed")?;

        Ok(Self {
            inner: Arc::new(Inner {
                log,
                providers_down: AtomicBool::new(false),
                #[cfg(feature = "trace")]
                tracer_provider: Some(tracer_provider),
                #[cfg(feature = "metrics")]
                meter_provider: Some(meter_provider),
            }),
        })
    }

    pub fn log(&self) -> &LogHandle {
        &self.inner.log
    }

    /// Flushes and shuts down the tracer and meter providers. Idempotent.
    pub fn shutdown_providers(&self) {
        if self.inner.providers_down.swap(true, Ordering::AcqRel) {
            return;
        }

        #[cfg(feature = "trace")]
        if let Some(provider) = &self.inner.tracer_provider {
            if let Err(err) = provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        if let Some(provider) = &self.inner.meter_provider {
            if let Err(err) = provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }

    /// Syncs the log file to disk.
    pub fn flush_logs(&self) {
        if let Err(err) = self.inner.log.sync() {
            eprintln!("Error flushing logs: {err}");
        }
    }
}

#[cfg(feature = "honeycomb")]
struct HoneycombSettings {
    metadata: MetadataMap,
    endpoint: String,
    compression: Compression,
}

#[cfg(feature = "honeycomb")]
impl HoneycombSettings {
    fn from_env() -> anyhow::Result<Self> {
        use std::str::FromStr;

        let api_key = std::env::var("HONEYCOMB_API_KEY").context("missing `HONEYCOMB_API_KEY`")?;
        let dataset = std::env::var("HONEYCOMB_DATASET").context("missing `HONEYCOMB_DATASET`")?;
        let endpoint =
            std::env::var("HONEYCOMB_ENDPOINT").context("missing `HONEYCOMB_ENDPOINT`")?;
        let compression = std::env::var("HONEYCOMB_COMPRESSION")
            .context("missing `HONEYCOMB_COMPRESSION`")?
            .to_ascii_lowercase();

        let mut metadata = MetadataMap::new();
        metadata.insert(
            "x-honeycomb-team",
            api_key.parse().context("invalid API key")?,
        );
        metadata.insert(
            "x-honeycomb-dataset",
            dataset.parse().context("invalid dataset")?,
        );

        Ok(Self {
            metadata,
            endpoint,
            compression: Compression::from_str(&compression)?,
        })
    }
}

#[cfg(any(feature = "metrics", feature = "trace"))]
fn resource(service_name: &str) -> Resource {
    Resource::builder()
        .with_service_name(service_name.to_string())
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics(service_name: &str) -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource(service_name));

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    #[cfg(feature = "honeycomb")]
    let builder = {
        let settings = HoneycombSettings::from_env()?;
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(settings.metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(settings.compression)
            .with_endpoint(settings.endpoint)
            .with_protocol(Protocol::Grpc)
            .with_temporality(Temporality::Delta)
            .build()
            .context("failed to build metrics exporter")?;

        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "trace")]
fn init_tracer(service_name: &str) -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource(service_name));

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        builder.with_span_processor(batch_processor(SpanExporter::default()))
    };

    #[cfg(feature = "honeycomb")]
    let builder = {
        let settings = HoneycombSettings::from_env()?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(settings.metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(settings.compression)
            .with_endpoint(settings.endpoint)
            .with_protocol(Protocol::Grpc)
            .build()
            .context("failed to build tracer exporter")?;

        builder.with_span_processor(batch_processor(exporter))
    };

    Ok(builder.build())
}

#[cfg(all(feature = "trace", any(feature = "stdout", feature = "honeycomb")))]
fn batch_processor<E>(exporter: E) -> sdktrace::BatchSpanProcessor
where
    E: opentelemetry_sdk::trace::SpanExporter + 'static,
{
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(std::time::Duration::from_secs(5))
                .with_max_queue_size(2048)
                .build(),
        )
        .build()
}

#[cfg(feature = "metrics")]
static CALLS_STARTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static CALLS_HANDLED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static CALL_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static POOLED_CONNECTIONS: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static POOL_ACQUIRE_WAIT_MS: OnceLock<Histogram<f64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: &Meter) {
    let _ = CALLS_STARTED.set(
        meter
            .u64_counter("grpc_calls_started")
            .with_description("RPCs started, by side")
            .build(),
    );

    let _ = CALLS_HANDLED.set(
        meter
            .u64_counter("grpc_calls_handled")
            .with_description("RPCs completed, by side and status code")
            .build(),
    );

    let _ = CALL_DURATION_MS.set(
        meter
            .f64_histogram("grpc_call_duration")
            .with_unit("ms")
            .with_description("End-to-end RPC duration")
            .build(),
    );

    let _ = POOLED_CONNECTIONS.set(
        meter
            .i64_up_down_counter("pooled_connections")
            .with_description("Live pooled client connections")
            .build(),
    );

    let _ = POOL_ACQUIRE_WAIT_MS.set(
        meter
            .f64_histogram("pool_acquire_wait")
            .with_unit("ms")
            .with_description("Time spent acquiring a pooled connection")
            .build(),
    );
}

#[cfg(feature = "metrics")]
pub fn increment_calls_started(kind: &'static str) {
    if let Some(counter) = CALLS_STARTED.get() {
        counter.add(1, &[KeyValue::new("kind", kind)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_calls_started(_kind: &'static str) {}

#[cfg(feature = "metrics")]
pub fn increment_calls_handled(kind: &'static str, code: i32) {
    if let Some(counter) = CALLS_HANDLED.get() {
        counter.add(
            1,
            &[
                KeyValue::new("kind", kind),
                KeyValue::new("code", i64::from(code)),
            ],
        );
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_calls_handled(_kind: &'static str, _code: i32) {}

#[cfg(feature = "metrics")]
pub fn record_call_duration(duration_ms: f64) {
    if let Some(histogram) = CALL_DURATION_MS.get() {
        histogram.record(duration_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_call_duration(_duration_ms: f64) {}

#[cfg(feature = "metrics")]
pub fn add_pooled_connections(delta: i64) {
    if let Some(counter) = POOLED_CONNECTIONS.get() {
        counter.add(delta, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn add_pooled_connections(_delta: i64) {}

#[cfg(feature = "metrics")]
pub fn record_pool_acquire_wait(wait_ms: f64) {
    if let Some(histogram) = POOL_ACQUIRE_WAIT_MS.get() {
        histogram.record(wait_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_pool_acquire_wait(_wait_ms: f64) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_shutdown_is_idempotent() {
        let telemetry = Telemetry::noop();
        telemetry.shutdown_providers();
        telemetry.shutdown_providers();
        telemetry.flush_logs();

        let clone = telemetry.clone();
        assert!(clone.inner.providers_down.load(Ordering::Acquire));
    }
}
