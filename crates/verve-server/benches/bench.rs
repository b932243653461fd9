use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::stream::{FuturesUnordered, StreamExt};
use std::{sync::Arc, time::Instant};
use tokio::runtime::Builder;
use verve_core::{publisher::MemoryPublisher, store::MemoryStore};
use verve_server::server::{
    config::ServerConfig, forward::client::HttpForwarder, service::handler::VerveService,
};

const REQUESTS_PER_TASK: usize = 1_000;

#[derive(Clone, Copy, Debug)]
struct DispatchBenchParams {
    shards: usize,
    concurrency: usize,
}

async fn start_service(shards: usize) -> VerveService {
    let config = ServerConfig {
        num_workers: shards,
        channel_buffer_size: 100_000,
        ..ServerConfig::default()
    };
    let forwarder = HttpForwarder::new(config.forward_method.clone(), config.forward_timeout)
        .expect("http client");
    VerveService::start(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryPublisher::new()),
        Arc::new(forwarder),
    )
    .await
    .expect("service start")
}

fn dispatch_bench(c: &mut Criterion) {
    let shard_cases = [1, 8, 64];
    let concurrency_cases = [1, 8, 32];

    let mut cases = Vec::new();
    for &shards in &shard_cases {
        for &concurrency in &concurrency_cases {
            cases.push(DispatchBenchParams {
                shards,
                concurrency,
            });
        }
    }
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();

    for params in &cases {
        let service = rt.block_on(start_service(params.shards));

        let mut group = c.benchmark_group("service/accept");
        group.throughput(Throughput::Elements(
            (REQUESTS_PER_TASK * params.concurrency) as u64,
        ));
        group.bench_function(
            format!("shards/{}/conc/{}", params.shards, params.concurrency),
            |b| {
                b.to_async(&rt).iter_custom(|iters| {
                    let service = service.clone();
                    async move {
                        let start = Instant::now();
                        for _ in 0..iters {
                            run_accept_bench(&service, params.concurrency).await;
                        }
                        start.elapsed()
                    }
                });
            },
        );
        group.finish();

        rt.block_on(service.shutdown()).unwrap();
    }
}

async fn run_accept_bench(service: &VerveService, concurrency: usize) {
    let mut tasks = FuturesUnordered::new();

    for task in 0..concurrency {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..REQUESTS_PER_TASK {
                let id = format!("{task}-{i}");
                black_box(service.accept(&id, None).await).ok();
            }
        }));
    }

    while let Some(res) = tasks.next().await {
        res.unwrap();
    }
}

criterion_group!(benches, dispatch_bench);
criterion_main!(benches);
