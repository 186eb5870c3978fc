use core::time::Duration;
use grpc_kit::{
    client::{ClientConfig, RpcClient},
    context::Context,
    error::{ERR_CODE_GRPC, ERR_CODE_TIMEOUT},
    interceptor::{Call, Interceptor, InterceptorChain},
    pool::{PoolConfig, PoolCreator, PoolTarget},
    server::{GrpcServer, ServerConfig},
    telemetry::Telemetry,
};
use std::net::SocketAddr;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Code, Status, service::Routes};
use tonic_health::pb::{
    HealthCheckRequest, HealthCheckResponse, health_check_response::ServingStatus,
};

const HEALTH_CHECK: &str = "/grpc.health.v1.Health/Check";
const TOKEN_KEY: &str = "x-token";

/// Client stage stamping every call with a token.
struct AddToken;

impl Interceptor for AddToken {
    fn name(&self) -> &'static str {
        "add_token"
    }

    fn before_call(&self, call: &mut Call) -> Result<(), Status> {
        call.metadata_mut()
            .insert(TOKEN_KEY, "letmein".parse().expect("valid metadata value"));
        Ok(())
    }
}

/// Server stage rejecting calls without the token.
struct RequireToken;

impl Interceptor for RequireToken {
    fn name(&self) -> &'static str {
        "require_token"
    }

    fn before_call(&self, call: &mut Call) -> Result<(), Status> {
        match call.metadata().get(TOKEN_KEY) {
            Some(token) if token == "letmein" => Ok(()),
            _ => Err(Status::unauthenticated("missing token")),
        }
    }
}

struct TestServer {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn start(extra: InterceptorChain) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_reporter, health) = tonic_health::server::health_reporter();

        let config = ServerConfig::new(addr.to_string(), "health-test");
        let server = GrpcServer::new(config, Routes::new(health), Telemetry::noop())
            .with_interceptors(&extra);
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .serve_with_shutdown(TcpListenerStream::new(listener), async {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
        });
        Self { addr, stop, handle }
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        self.handle.await.unwrap();
    }
}

fn client_config(creators: Vec<PoolCreator>) -> ClientConfig {
    let mut config = ClientConfig::new("health-client")
        .with_metrics_disabled(true)
        .with_sweep_interval(None);
    config.creators = creators;
    config
}

#[tokio::test]
async fn unary_call_through_the_pool() {
    let server = TestServer::start(InterceptorChain::new()).await;
    let ctx = Context::background();
    let client = RpcClient::new(&ctx, client_config(Vec::new()), Telemetry::noop())
        .await
        .unwrap();
    let address = server.addr.to_string();

    for _ in 0..3 {
        let ctx = ctx.with_timeout(Duration::from_secs(5));
        let resp: HealthCheckResponse = client
            .call(&ctx, &address, HEALTH_CHECK, HealthCheckRequest::default())
            .await
            .unwrap();
        assert_eq!(resp.status, ServingStatus::Serving as i32);
    }

    // Created on demand and reused across calls.
    let stats = client.pools().pool(&address).unwrap().stats();
    assert_eq!(stats.live, 1);
    assert_eq!(stats.idle, 1);

    client.shutdown();
    assert!(client.pools().is_closed());
    server.stop().await;
}

#[tokio::test]
async fn server_status_is_translated() {
    let server = TestServer::start(InterceptorChain::new()).await;
    let ctx = Context::background();
    let client = RpcClient::new(&ctx, client_config(Vec::new()), Telemetry::noop())
        .await
        .unwrap();

    let request = HealthCheckRequest {
        service: "no.such.Service".to_string(),
    };
    let err = client
        .call::<_, HealthCheckResponse>(&ctx, &server.addr.to_string(), HEALTH_CHECK, request)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound as i32);

    client.shutdown();
    server.stop().await;
}

#[tokio::test]
async fn interceptors_run_on_both_sides() {
    let server = TestServer::start(InterceptorChain::new().with(RequireToken)).await;
    let address = server.addr.to_string();
    let ctx = Context::background();

    // Pools created on demand carry only the default chain.
    let plain = RpcClient::new(&ctx, client_config(Vec::new()), Telemetry::noop())
        .await
        .unwrap();
    let err = plain
        .call::<_, HealthCheckResponse>(&ctx, &address, HEALTH_CHECK, HealthCheckRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated as i32);
    assert_eq!(err.msg(), "missing token");

    // A creator registered at startup appends its own stages.
    let creator = PoolCreator::new(
        PoolTarget::new(address.clone(), PoolConfig::default()),
        InterceptorChain::new().with(AddToken),
    );
    let authed = RpcClient::new(&ctx, client_config(vec![creator]), Telemetry::noop())
        .await
        .unwrap();
    assert_eq!(authed.pools().addresses(), vec![address.clone()]);
    let resp: HealthCheckResponse = authed
        .call(&ctx, &address, HEALTH_CHECK, HealthCheckRequest::default())
        .await
        .unwrap();
    assert_eq!(resp.status, ServingStatus::Serving as i32);

    plain.shutdown();
    authed.shutdown();
    server.stop().await;
}

#[tokio::test]
async fn unreachable_server_is_a_grpc_error() {
    // Grab a free port and release it so nothing is listening there.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let ctx = Context::background();
    let client = RpcClient::new(&ctx, client_config(Vec::new()), Telemetry::noop())
        .await
        .unwrap();

    let err = client
        .call::<_, HealthCheckResponse>(
            &ctx,
            &addr.to_string(),
            HEALTH_CHECK,
            HealthCheckRequest::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ERR_CODE_GRPC);
    assert!(err.msg().starts_with(&format!("DialContext error, server = {addr}")));

    client.shutdown();
}

#[tokio::test]
async fn exhausted_pool_times_out() {
    let server = TestServer::start(InterceptorChain::new()).await;
    let address = server.addr.to_string();
    let ctx = Context::background();
    let config = client_config(Vec::new()).with_default_pool_config(PoolConfig {
        max_size: 1,
        ..PoolConfig::default()
    });
    let client = RpcClient::new(&ctx, config, Telemetry::noop()).await.unwrap();

    let held = client.pools().get(&ctx, &address, true).await.unwrap();

    let short = ctx.with_timeout(Duration::from_millis(50));
    let err = client
        .call::<_, HealthCheckResponse>(&short, &address, HEALTH_CHECK, HealthCheckRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ERR_CODE_TIMEOUT);

    held.release();
    let resp: HealthCheckResponse = client
        .call(&ctx, &address, HEALTH_CHECK, HealthCheckRequest::default())
        .await
        .unwrap();
    assert_eq!(resp.status, ServingStatus::Serving as i32);

    client.shutdown();
    server.stop().await;
}
