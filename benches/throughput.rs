//! Throughput Benchmark for FlashGate
//!
//! This benchmark measures the admission path: balancer picks across
//! workers, and a full accept / close / destroy cycle on one listener.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flashgate::config::{ConnectionLimit, ListenerConfig};
use flashgate::event::{Dispatcher, TaskReceiver};
use flashgate::network::{
    BalancedConnectionHandler, ConnectionBalancer, ConnectionEvent, ConnectionSocket,
    ExactConnectionBalancer, FilterChain, HandlerId, StaticFilterChainManager,
};
use flashgate::server::{ActiveTcpListener, TcpListenerHandle};
use flashgate::stats::HandlerCounters;
use std::net::SocketAddr;
use std::sync::Arc;

fn socket() -> ConnectionSocket {
    ConnectionSocket::detached(
        SocketAddr::from(([127, 0, 0, 1], 10000)),
        SocketAddr::from(([127, 0, 0, 1], 40000)),
    )
}

/// Benchmark exact balancer picks with a varying number of workers
fn bench_balancer_pick(c: &mut Criterion) {
    let mut group = c.benchmark_group("balancer_pick");
    group.throughput(Throughput::Elements(1));

    for workers in [2usize, 8, 32] {
        let balancer = ExactConnectionBalancer::new();
        let limit = Arc::new(ConnectionLimit::unlimited());
        let mut receivers: Vec<TaskReceiver> = Vec::new();
        let mut handlers: Vec<Arc<dyn BalancedConnectionHandler>> = Vec::new();

        for i in 0..workers {
            let (dispatcher, rx) = Dispatcher::new(format!("worker_{}", i));
            let handler: Arc<dyn BalancedConnectionHandler> = Arc::new(TcpListenerHandle::new(
                1,
                HandlerId::next(),
                Arc::clone(&limit),
                dispatcher.handle(),
            ));
            balancer.register_handler(Arc::clone(&handler));
            handlers.push(handler);
            receivers.push(rx);
        }

        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, _| {
            let current = Arc::clone(&handlers[0]);
            b.iter(|| {
                let target = balancer.pick_target_handler(black_box(&current));
                target.dec_num_connections();
                target
            });
        });
    }

    group.finish();
}

/// Benchmark accepting a socket and tearing the connection down again
fn bench_accept_cycle(c: &mut Criterion) {
    let (dispatcher, _rx) = Dispatcher::new("worker_0");
    let chain = Arc::new(FilterChain::new("default", vec!["sink".to_string()]));
    let config = Arc::new(
        ListenerConfig::builder("bench", SocketAddr::from(([127, 0, 0, 1], 10000)))
            .filter_chain_manager(Arc::new(StaticFilterChainManager::new(
                Vec::new(),
                Some(Arc::clone(&chain)),
            )))
            .build(),
    );
    let mut listener = ActiveTcpListener::new(
        config,
        dispatcher.clone(),
        Arc::new(HandlerCounters::new(None)),
        None,
    );

    let mut group = c.benchmark_group("accept_cycle");
    group.throughput(Throughput::Elements(1));

    group.bench_function("accept_close_destroy", |b| {
        b.iter(|| {
            listener.on_accept(socket());
            let handle = listener
                .connection_group(&chain)
                .and_then(|group| group.iter().next())
                .map(|connection| connection.handle());
            if let Some(handle) = handle {
                listener.on_connection_event(handle, ConnectionEvent::RemoteClose);
            }
            black_box(dispatcher.clear_deferred_delete_list())
        });
    });

    group.bench_function("accept_batch_100", |b| {
        b.iter(|| {
            for _ in 0..100 {
                listener.on_accept(socket());
            }
            let handles: Vec<_> = listener
                .connection_group(&chain)
                .map(|group| group.iter().map(|connection| connection.handle()).collect())
                .unwrap_or_default();
            for handle in handles {
                listener.on_connection_event(handle, ConnectionEvent::RemoteClose);
            }
            black_box(dispatcher.clear_deferred_delete_list())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_balancer_pick, bench_accept_cycle);
criterion_main!(benches);
