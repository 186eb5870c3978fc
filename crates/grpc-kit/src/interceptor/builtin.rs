use super::{Call, Interceptor};
use crate::{
    logger::{self, GRPC_REQUEST_METHOD, GRPC_REQUEST_SERVICE},
    telemetry,
};
use tonic::{Code, Status};

/// Logs the start of every call at `debug` and its end at `info` (success)
/// or `warn` (failure), inside the call context's span.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn before_call(&self, call: &mut Call) -> Result<(), Status> {
        tracing::debug!(
            parent: &logger::span(call.context()),
            kind = call.kind().as_str(),
            grpc.service = call.service(),
            grpc.method = call.method(),
            peer = call.peer().unwrap_or("-"),
            "started call"
        );
        Ok(())
    }

    fn after_call(&self, call: &Call, outcome: Result<(), &Status>) {
        let span = logger::span(call.context());
        let duration_ms = call.elapsed().as_secs_f64() * 1000.0;
        match outcome {
            Ok(()) => tracing::info!(
                parent: &span,
                kind = call.kind().as_str(),
                grpc.service = call.service(),
                grpc.method = call.method(),
                grpc.code = ?Code::Ok,
                duration_ms,
                "finished call"
            ),
            Err(status) => tracing::warn!(
                parent: &span,
                kind = call.kind().as_str(),
                grpc.service = call.service(),
                grpc.method = call.method(),
                grpc.code = ?status.code(),
                error = status.message(),
                duration_ms,
                "finished call"
            ),
        }
    }
}

/// Counts started and handled calls and records their duration.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsInterceptor;

impl Interceptor for MetricsInterceptor {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn before_call(&self, call: &mut Call) -> Result<(), Status> {
        telemetry::increment_calls_started(call.kind().as_str());
        Ok(())
    }

    fn after_call(&self, call: &Call, outcome: Result<(), &Status>) {
        let code = outcome.map_or_else(|status| status.code(), |()| Code::Ok);
        telemetry::increment_calls_handled(call.kind().as_str(), code as i32);
        telemetry::record_call_duration(call.elapsed().as_secs_f64() * 1000.0);
    }
}

/// Tags the call context with `grpc.request.service` and
/// `grpc.request.method` taken from the full method name.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestFieldsInterceptor;

impl Interceptor for RequestFieldsInterceptor {
    fn name(&self) -> &'static str {
        "request_fields"
    }

    fn before_call(&self, call: &mut Call) -> Result<(), Status> {
        let service = call.service().to_string();
        let method = call.method().to_string();
        if !service.is_empty() {
            call.tag(GRPC_REQUEST_SERVICE, service);
        }
        call.tag(GRPC_REQUEST_METHOD, method);
        Ok(())
    }
}
