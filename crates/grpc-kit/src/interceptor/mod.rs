//! Interceptor pipeline shared by the client and the server.
//!
//! An [`InterceptorChain`] is an ordered list of [`Interceptor`] stages.
//! `before_call` hooks run in chain order before the RPC is invoked and
//! `after_call` hooks run in reverse order once it completes, so the first
//! stage wraps every other stage.
//!
//! The built-in stages cover logging, metrics, request field tagging and (with
//! the `trace` feature) OpenTelemetry context propagation. The metrics stage
//! is always inserted at [`METRICS_INTERCEPTOR_INDEX`] so it measures the full
//! pipeline.

mod builtin;
#[cfg(feature = "trace")]
mod otel;

pub use builtin::{LoggingInterceptor, MetricsInterceptor, RequestFieldsInterceptor};
#[cfg(feature = "trace")]
pub(crate) use otel::extract as otel_extract;
#[cfg(feature = "trace")]
pub use otel::{MetadataExtractor, MetadataInjector, TracingInterceptor};

use crate::context::Context;
use core::{fmt, future::Future, time::Duration};
use std::sync::Arc;
use tokio::time::Instant;
use tonic::{Status, metadata::MetadataMap};

/// Position the metrics stage is inserted at in the default chains.
pub const METRICS_INTERCEPTOR_INDEX: usize = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    Client,
    Server,
}

impl CallKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

/// Splits `/pkg.Service/Method` into `("pkg.Service", "Method")`.
///
/// A name without a `/` is treated as a bare method with no service.
pub fn split_method(full_method: &str) -> (&str, &str) {
    match full_method.rfind('/') {
        Some(idx) => {
            let service = &full_method[..idx];
            (
                service.strip_prefix('/').unwrap_or(service),
                &full_method[idx + 1..],
            )
        }
        None => ("", full_method),
    }
}

/// One RPC as seen by the interceptor chain.
#[derive(Debug)]
pub struct Call {
    full_method: String,
    kind: CallKind,
    peer: Option<String>,
    metadata: MetadataMap,
    started: Instant,
    ctx: Context,
}

impl Call {
    /// An outgoing call to `peer`. Stages may add request metadata.
    pub fn client(ctx: Context, peer: impl Into<String>, full_method: impl Into<String>) -> Self {
        Self {
            full_method: full_method.into(),
            kind: CallKind::Client,
            peer: Some(peer.into()),
            metadata: MetadataMap::new(),
            started: Instant::now(),
            ctx,
        }
    }

    /// An incoming call carrying the request metadata.
    pub fn server(
        ctx: Context,
        full_method: impl Into<String>,
        metadata: MetadataMap,
        peer: Option<String>,
    ) -> Self {
        Self {
            full_method: full_method.into(),
            kind: CallKind::Server,
            peer,
            metadata,
            started: Instant::now(),
            ctx,
        }
    }

    pub fn full_method(&self) -> &str {
        &self.full_method
    }

    pub fn service(&self) -> &str {
        split_method(&self.full_method).0
    }

    pub fn method(&self) -> &str {
        split_method(&self.full_method).1
    }

    pub const fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub const fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.metadata
    }

    pub const fn context(&self) -> &Context {
        &self.ctx
    }

    /// Adds a logging tag to the call's context.
    pub fn tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.ctx = self.ctx.with_tag(key, value);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// A pipeline stage run around every call.
pub trait Interceptor: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Runs before the call is invoked. Returning an error aborts the call;
    /// the stages that already ran still see `after_call`.
    fn before_call(&self, _call: &mut Call) -> Result<(), Status> {
        Ok(())
    }

    fn after_call(&self, _call: &Call, _outcome: Result<(), &Status>) {}
}

#[derive(Clone, Default)]
pub struct InterceptorChain {
    stages: Vec<Arc<dyn Interceptor>>,
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `stage`, builder style.
    #[must_use]
    pub fn with(mut self, stage: impl Interceptor) -> Self {
        self.push(stage);
        self
    }

    pub fn push(&mut self, stage: impl Interceptor) -> &mut Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Inserts `stage` at `index`, or at the end if `index` is past it.
    pub fn insert(&mut self, index: usize, stage: impl Interceptor) -> &mut Self {
        let index = index.min(self.stages.len());
        self.stages.insert(index, Arc::new(stage));
        self
    }

    pub fn extend(&mut self, other: &Self) -> &mut Self {
        self.stages.extend(other.stages.iter().cloned());
        self
    }

    /// A copy of this chain with `other`'s stages appended.
    #[must_use]
    pub fn extended(&self, other: &Self) -> Self {
        let mut chain = self.clone();
        chain.extend(other);
        chain
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs every `before_call` in order.
    ///
    /// # Errors
    ///
    /// Returns the first stage's error after unwinding the stages that
    /// already ran.
    pub fn before(&self, call: &mut Call) -> Result<(), Status> {
        for (idx, stage) in self.stages.iter().enumerate() {
            if let Err(status) = stage.before_call(call) {
                for done in self.stages[..idx].iter().rev() {
                    done.after_call(call, Err(&status));
                }
                return Err(status);
            }
        }
        Ok(())
    }

    /// Runs every `after_call` in reverse order.
    pub fn after(&self, call: &Call, outcome: Result<(), &Status>) {
        for stage in self.stages.iter().rev() {
            stage.after_call(call, outcome);
        }
    }

    /// Runs the chain around `invoke`, which receives the request metadata
    /// assembled by the `before_call` hooks.
    ///
    /// # Errors
    ///
    /// Returns the error of a rejecting stage or of `invoke`.
    pub async fn intercept<R, F, Fut>(&self, call: &mut Call, invoke: F) -> Result<R, Status>
    where
        F: FnOnce(MetadataMap) -> Fut,
        Fut: Future<Output = Result<R, Status>>,
    {
        self.before(call)?;
        let res = invoke(call.metadata().clone()).await;
        self.after(call, res.as_ref().map(|_| ()));
        res
    }
}

/// `[metrics?, tracing?, logging]`.
pub fn default_client_interceptors(disable_metrics: bool) -> InterceptorChain {
    let mut chain = InterceptorChain::new();
    #[cfg(feature = "trace")]
    chain.push(TracingInterceptor);
    chain.push(LoggingInterceptor);
    if !disable_metrics {
        chain.insert(METRICS_INTERCEPTOR_INDEX, MetricsInterceptor);
    }
    chain
}

/// `[metrics?, request fields, tracing?, logging]`.
pub fn default_server_interceptors(disable_metrics: bool) -> InterceptorChain {
    let mut chain = InterceptorChain::new();
    chain.push(RequestFieldsInterceptor);
    #[cfg(feature = "trace")]
    chain.push(TracingInterceptor);
    chain.push(LoggingInterceptor);
    if !disable_metrics {
        chain.insert(METRICS_INTERCEPTOR_INDEX, MetricsInterceptor);
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Clone)]
    struct Record {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        reject: bool,
    }

    impl Interceptor for Record {
        fn name(&self) -> &'static str {
            self.name
        }

        fn before_call(&self, call: &mut Call) -> Result<(), Status> {
            self.log.lock().push(format!("before:{}", self.name));
            call.metadata_mut()
                .insert("x-stage", self.name.parse().unwrap());
            if self.reject {
                return Err(Status::permission_denied(self.name));
            }
            Ok(())
        }

        fn after_call(&self, _call: &Call, outcome: Result<(), &Status>) {
            let tag = if outcome.is_ok() { "ok" } else { "err" };
            self.log.lock().push(format!("after:{}:{tag}", self.name));
        }
    }

    fn stage(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Record {
        Record {
            name,
            log: Arc::clone(log),
            reject: false,
        }
    }

    fn call() -> Call {
        Call::client(Context::background(), "10.0.0.1:9000", "/pkg.Echo/Say")
    }

    #[test]
    fn splits_full_method_names() {
        assert_eq!(split_method("/pkg.Echo/Say"), ("pkg.Echo", "Say"));
        assert_eq!(
            split_method("/grpc.health.v1.Health/Check"),
            ("grpc.health.v1.Health", "Check")
        );
        assert_eq!(split_method("Say"), ("", "Say"));
        assert_eq!(split_method("/Say"), ("", "Say"));
    }

    #[tokio::test]
    async fn before_in_order_after_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = InterceptorChain::new()
            .with(stage("a", &log))
            .with(stage("b", &log));

        let mut call = call();
        let seen = chain
            .intercept(&mut call, |metadata| async move {
                Ok::<_, Status>(metadata.get("x-stage").cloned())
            })
            .await
            .unwrap();

        assert_eq!(seen.unwrap(), "b");
        assert_eq!(
            *log.lock(),
            vec!["before:a", "before:b", "after:b:ok", "after:a:ok"]
        );
    }

    #[tokio::test]
    async fn rejecting_stage_unwinds_earlier_stages() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = InterceptorChain::new()
            .with(stage("a", &log))
            .with(Record {
                reject: true,
                ..stage("b", &log)
            })
            .with(stage("c", &log));

        let mut call = call();
        let err = chain
            .intercept(&mut call, |_| async { Ok::<_, Status>(()) })
            .await
            .unwrap_err();

        assert_eq!(err.code(), tonic::Code::PermissionDenied);
        assert_eq!(*log.lock(), vec!["before:a", "before:b", "after:a:err"]);
    }

    #[test]
    fn insert_clamps_index() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = InterceptorChain::new().with(stage("a", &log));
        chain.insert(0, stage("first", &log));
        chain.insert(99, stage("last", &log));
        assert_eq!(chain.names(), vec!["first", "a", "last"]);
    }

    #[test]
    fn extended_appends_without_touching_the_original() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let base = InterceptorChain::new().with(stage("a", &log));
        let extra = InterceptorChain::new().with(stage("b", &log));

        let merged = base.extended(&extra);
        assert_eq!(merged.names(), vec!["a", "b"]);
        assert_eq!(base.len(), 1);
    }

    #[test]
    fn metrics_stage_leads_default_chains() {
        let client = default_client_interceptors(false);
        assert_eq!(client.names()[METRICS_INTERCEPTOR_INDEX], "metrics");
        assert_eq!(client.names().last(), Some(&"logging"));

        let server = default_server_interceptors(false);
        assert_eq!(server.names()[0], "metrics");
        assert_eq!(server.names()[1], "request_fields");

        assert!(!default_client_interceptors(true).names().contains(&"metrics"));
        assert!(!default_server_interceptors(true).names().contains(&"metrics"));
    }
}
