use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::{StreamExt, stream::FuturesUnordered};
use grpc_kit::{
    context::Context,
    interceptor::InterceptorChain,
    pool::{ConnectFuture, Dialer, Pool, PoolConfig, PoolSelector, PoolTarget},
};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

fn connect_noop() -> ConnectFuture<u64> {
    Box::pin(async { Ok(0) })
}

struct NoopDialer;

impl Dialer<u64> for NoopDialer {
    fn dial(&self, _target: &PoolTarget, _interceptors: &InterceptorChain) -> ConnectFuture<u64> {
        connect_noop()
    }
}

fn runtime() -> Runtime {
    Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

fn target(max_size: usize) -> PoolTarget {
    PoolTarget::new(
        "127.0.0.1:50051",
        PoolConfig {
            init_size: max_size,
            max_size,
            ..PoolConfig::default()
        },
    )
}

fn bench_acquire_release(c: &mut Criterion) {
    let rt = runtime();
    let ctx = Context::background();
    let pool = rt
        .block_on(Pool::build(&ctx, target(4), connect_noop))
        .expect("failed to build pool");

    let mut group = c.benchmark_group("pool");
    group.throughput(Throughput::Elements(1));
    group.bench_function("acquire_release", |b| {
        b.to_async(&rt).iter(|| async {
            let conn = pool.acquire(&ctx).await.expect("acquire failed");
            black_box(*conn);
            conn.release();
        });
    });
    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let rt = runtime();
    let ctx = Context::background();

    let mut group = c.benchmark_group("pool_contended");
    for (max_size, tasks) in [(1, 16), (4, 16), (4, 64), (16, 64)] {
        let pool = rt
            .block_on(Pool::build(&ctx, target(max_size), connect_noop))
            .expect("failed to build pool");
        group.throughput(Throughput::Elements(tasks as u64));
        group.bench_function(format!("max_{max_size}/tasks_{tasks}"), |b| {
            b.to_async(&rt).iter(|| {
                let pool = Arc::clone(&pool);
                let ctx = ctx.clone();
                async move {
                    let mut running = (0..tasks)
                        .map(|_| {
                            let pool = Arc::clone(&pool);
                            let ctx = ctx.clone();
                            tokio::spawn(async move {
                                let conn = pool.acquire(&ctx).await.expect("acquire failed");
                                tokio::task::yield_now().await;
                                conn.release();
                            })
                        })
                        .collect::<FuturesUnordered<_>>();
                    while let Some(res) = running.next().await {
                        res.expect("task panicked");
                    }
                }
            });
        });
    }
    group.finish();
}

fn bench_selector_get(c: &mut Criterion) {
    let rt = runtime();
    let ctx = Context::background();
    let selector = PoolSelector::new(NoopDialer, InterceptorChain::new());
    rt.block_on(selector.set_pool(&ctx, target(4), InterceptorChain::new(), false))
        .expect("failed to register pool");

    let mut group = c.benchmark_group("selector");
    group.throughput(Throughput::Elements(1));
    group.bench_function("get_release", |b| {
        b.to_async(&rt).iter(|| async {
            let conn = selector
                .get(&ctx, "127.0.0.1:50051", false)
                .await
                .expect("pool missing");
            black_box(*conn);
            conn.release();
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_acquire_release,
    bench_contended,
    bench_selector_get
);
criterion_main!(benches);
