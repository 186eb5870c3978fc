//! Tower layer running the server interceptor chain around every request.

use crate::{
    context::Context,
    interceptor::{Call, InterceptorChain},
};
use core::{
    task::{Context as TaskContext, Poll},
    time::Duration,
};
use futures::future::BoxFuture;
use tonic::{
    Code, Status,
    codegen::http::{HeaderMap, Request, Response},
    metadata::MetadataMap,
    transport::server::TcpConnectInfo,
};
use tower::{Layer, Service};
use tracing::Instrument;

#[cfg(feature = "trace")]
use tracing_opentelemetry::OpenTelemetrySpanExt;

const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

#[derive(Clone, Debug)]
pub struct InterceptorLayer {
    chain: InterceptorChain,
}

impl InterceptorLayer {
    pub const fn new(chain: InterceptorChain) -> Self {
        Self { chain }
    }
}

impl<S> Layer<S> for InterceptorLayer {
    type Service = InterceptorService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InterceptorService {
            inner,
            chain: self.chain.clone(),
        }
    }
}

/// Runs `before_call` hooks, stores the request [`Context`] in the request
/// extensions, calls the inner service and runs `after_call` hooks with the
/// response status.
///
/// The outcome is read from the response headers, which carry `grpc-status`
/// for trailers-only responses (the form tonic uses for handler errors).
/// Statuses sent only in trailers are reported as success.
#[derive(Clone, Debug)]
pub struct InterceptorService<S> {
    inner: S,
    chain: InterceptorChain,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for InterceptorService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        // The readied service handles this request; the clone takes its place.
        let clone = self.inner.clone();
        let mut inner = core::mem::replace(&mut self.inner, clone);
        let chain = self.chain.clone();

        Box::pin(async move {
            let full_method = req.uri().path().to_string();
            let peer = req
                .extensions()
                .get::<TcpConnectInfo>()
                .and_then(TcpConnectInfo::remote_addr)
                .map(|addr| addr.to_string());

            let mut ctx = Context::background();
            if let Some(timeout) = grpc_timeout(req.headers()) {
                ctx = ctx.with_timeout(timeout);
            }

            let span = tracing::info_span!(
                "grpc.request",
                otel.kind = "server",
                rpc.system = "grpc",
                rpc.path = %full_method,
            );
            let mut call = Call::server(
                ctx,
                full_method,
                MetadataMap::from_headers(req.headers().clone()),
                peer,
            );

            #[cfg(feature = "trace")]
            if let Err(err) = span.set_parent(crate::interceptor::otel_extract(call.metadata())) {
                tracing::debug!(error = ?err, "failed to attach remote parent span");
            }

            if let Err(status) = span.in_scope(|| chain.before(&mut call)) {
                return Ok(status.into_http());
            }

            req.extensions_mut().insert(call.context().clone());
            let res = inner.call(req).instrument(span.clone()).await;

            span.in_scope(|| match &res {
                Ok(resp) => match Status::from_header_map(resp.headers()) {
                    Some(status) if status.code() != Code::Ok => chain.after(&call, Err(&status)),
                    _ => chain.after(&call, Ok(())),
                },
                Err(_) => chain.after(&call, Err(&Status::internal("service error"))),
            });
            res
        })
    }
}

/// Parses the `grpc-timeout` header (`<digits><unit>`, at most 8 digits).
pub(crate) fn grpc_timeout(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(GRPC_TIMEOUT_HEADER)?.to_str().ok()?;
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount.saturating_mul(60 * 60)),
        "M" => Duration::from_secs(amount.saturating_mul(60)),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

/// The [`Context`] the server stored for this request, or a background
/// context when the request did not pass through [`InterceptorLayer`].
pub fn request_context<T>(request: &tonic::Request<T>) -> Context {
    request
        .extensions()
        .get::<Context>()
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::Interceptor;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn headers(timeout: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(GRPC_TIMEOUT_HEADER, timeout.parse().unwrap());
        headers
    }

    #[test]
    fn parses_grpc_timeouts() {
        assert_eq!(grpc_timeout(&headers("100m")), Some(Duration::from_millis(100)));
        assert_eq!(grpc_timeout(&headers("3S")), Some(Duration::from_secs(3)));
        assert_eq!(grpc_timeout(&headers("2M")), Some(Duration::from_secs(120)));
        assert_eq!(grpc_timeout(&headers("1H")), Some(Duration::from_secs(3600)));
        assert_eq!(grpc_timeout(&headers("5u")), Some(Duration::from_micros(5)));
        assert_eq!(grpc_timeout(&headers("7n")), Some(Duration::from_nanos(7)));
    }

    #[test]
    fn rejects_malformed_grpc_timeouts() {
        assert_eq!(grpc_timeout(&HeaderMap::new()), None);
        assert_eq!(grpc_timeout(&headers("S")), None);
        assert_eq!(grpc_timeout(&headers("10x")), None);
        assert_eq!(grpc_timeout(&headers("123456789S")), None);
        assert_eq!(grpc_timeout(&headers("-1S")), None);
    }

    #[derive(Default)]
    struct Outcomes(Mutex<Vec<Option<Code>>>);

    struct Observe(Arc<Outcomes>, bool);

    impl Interceptor for Observe {
        fn name(&self) -> &'static str {
            "observe"
        }

        fn before_call(&self, _call: &mut Call) -> Result<(), Status> {
            if self.1 {
                return Err(Status::unauthenticated("no token"));
            }
            Ok(())
        }

        fn after_call(&self, _call: &Call, outcome: Result<(), &Status>) {
            self.0 .0.lock().push(outcome.err().map(Status::code));
        }
    }

    async fn echo_method(req: Request<()>) -> Result<Response<String>, std::convert::Infallible> {
        let ctx = req.extensions().get::<Context>().cloned();
        let mut resp = Response::new(String::new());
        if ctx.and_then(|ctx| ctx.deadline()).is_none() {
            resp.headers_mut()
                .insert("grpc-status", (Code::FailedPrecondition as i32).into());
        }
        Ok(resp)
    }

    fn request(timeout: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri("http://localhost/pkg.Echo/Say");
        if let Some(timeout) = timeout {
            builder = builder.header(GRPC_TIMEOUT_HEADER, timeout);
        }
        builder.body(()).unwrap()
    }

    #[tokio::test]
    async fn context_reaches_the_handler_and_outcome_is_reported() {
        let outcomes = Arc::new(Outcomes::default());
        let chain = InterceptorChain::new().with(Observe(Arc::clone(&outcomes), false));
        let svc = InterceptorLayer::new(chain).layer(tower::service_fn(echo_method));

        let resp = svc.clone().oneshot(request(Some("5S"))).await.unwrap();
        assert!(resp.headers().get("grpc-status").is_none());

        let resp = svc.oneshot(request(None)).await.unwrap();
        assert!(resp.headers().get("grpc-status").is_some());

        assert_eq!(
            *outcomes.0.lock(),
            vec![None, Some(Code::FailedPrecondition)]
        );
    }

    #[tokio::test]
    async fn rejected_requests_are_answered_by_the_layer() {
        let outcomes = Arc::new(Outcomes::default());
        let chain = InterceptorChain::new().with(Observe(Arc::clone(&outcomes), true));
        let svc = InterceptorLayer::new(chain).layer(tower::service_fn(echo_method));

        let resp = svc.oneshot(request(None)).await.unwrap();
        let status = Status::from_header_map(resp.headers()).unwrap();
        assert_eq!(status.code(), Code::Unauthenticated);
        assert!(outcomes.0.lock().is_empty());
    }

    #[cfg(feature = "trace")]
    #[tokio::test]
    async fn malformed_traceparent_does_not_reject_the_call() {
        let outcomes = Arc::new(Outcomes::default());
        let chain = InterceptorChain::new().with(Observe(Arc::clone(&outcomes), false));
        let svc = InterceptorLayer::new(chain).layer(tower::service_fn(echo_method));

        let mut req = request(Some("5S"));
        req.headers_mut()
            .insert("traceparent", "00-not-a-trace-01".parse().unwrap());
        let resp = svc.oneshot(req).await.unwrap();
        assert!(resp.headers().get("grpc-status").is_none());
        assert_eq!(*outcomes.0.lock(), vec![None]);
    }
}
