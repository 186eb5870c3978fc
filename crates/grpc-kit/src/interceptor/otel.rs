use super::{Call, CallKind, Interceptor};
use crate::logger::{TRACE_SPAN_ID, TRACE_TRACE_ID};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    trace::TraceContextExt,
};
use tonic::{
    Status,
    metadata::{Ascii, KeyRef, MetadataKey, MetadataMap, MetadataValue},
};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Writes propagation headers into outgoing request metadata.
pub struct MetadataInjector<'a>(pub &'a mut MetadataMap);

impl Injector for MetadataInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if let (Ok(key), Ok(value)) = (
            MetadataKey::<Ascii>::from_bytes(key.as_bytes()),
            value.parse::<MetadataValue<Ascii>>(),
        ) {
            self.0.insert(key, value);
        }
    }
}

/// Reads propagation headers from incoming request metadata.
pub struct MetadataExtractor<'a>(pub &'a MetadataMap);

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0
            .keys()
            .map(|key| match key {
                KeyRef::Ascii(key) => key.as_str(),
                KeyRef::Binary(key) => key.as_str(),
            })
            .collect()
    }
}

/// Extracts the remote OpenTelemetry context carried by `metadata`.
pub(crate) fn extract(metadata: &MetadataMap) -> opentelemetry::Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&MetadataExtractor(metadata)))
}

/// Propagates the current span's OpenTelemetry context.
///
/// Client side it injects the context into the outgoing metadata. Server
/// side it tags the call context with `trace.traceid` and `trace.spanid` of
/// the request span, so every log line of the call carries them.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingInterceptor;

impl Interceptor for TracingInterceptor {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn before_call(&self, call: &mut Call) -> Result<(), Status> {
        let cx = tracing::Span::current().context();
        match call.kind() {
            CallKind::Client => global::get_text_map_propagator(|propagator| {
                propagator.inject_context(&cx, &mut MetadataInjector(call.metadata_mut()));
            }),
            CallKind::Server => {
                let span = cx.span();
                let span_cx = span.span_context();
                if span_cx.is_valid() {
                    let trace_id = span_cx.trace_id().to_string();
                    let span_id = span_cx.span_id().to_string();
                    call.tag(TRACE_TRACE_ID, trace_id);
                    call.tag(TRACE_SPAN_ID, span_id);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injector_skips_invalid_values() {
        let mut metadata = MetadataMap::new();
        let mut injector = MetadataInjector(&mut metadata);
        injector.set("traceparent", "00-abc-def-01".to_string());
        injector.set("bad key", "value".to_string());

        assert_eq!(metadata.len(), 1);
        assert_eq!(
            MetadataExtractor(&metadata).get("traceparent"),
            Some("00-abc-def-01")
        );
    }
}
