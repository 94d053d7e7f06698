use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::{json, Value};
use tokio::runtime::Runtime;

use busworker::{
    typed_handler, Dispatcher, Echo, HandlerError, InboundMessage, MemoryBroker, RequestEnvelope,
};

// ==========================
//   Benchmark Setup
// ==========================
fn request(reply: Option<&str>, params: Value) -> InboundMessage {
    let payload = RequestEnvelope::new(params).encode().expect("encode request");
    InboundMessage::new("inference.1", reply.map(str::to_string), payload)
}

fn echo_dispatcher() -> Dispatcher<Echo> {
    let broker = MemoryBroker::new();
    Dispatcher::new(Arc::new(Echo), Arc::new(broker.connect()))
}

// ==========================
//  The Benchmark Functions
// ==========================
fn bench_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let params = json!({"prompt": "hello", "max_tokens": 16});

    let mut group = c.benchmark_group("dispatch");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("echo without reply", |b| {
        let dispatcher = echo_dispatcher();
        b.iter_custom(|iterations| {
            let start = Instant::now();
            rt.block_on(async {
                for _ in 0..iterations {
                    let message = request(None, params.clone());
                    dispatcher.process_request(message).await.unwrap();
                }
            });
            start.elapsed()
        });
    });

    // Each batch gets a fresh broker so the reply journal stays small.
    group.bench_function("echo with reply", |b| {
        b.iter_custom(|iterations| {
            let dispatcher = echo_dispatcher();
            let start = Instant::now();
            rt.block_on(async {
                for _ in 0..iterations {
                    let message = request(Some("_INBOX.bench"), params.clone());
                    dispatcher.process_request(message).await.unwrap();
                }
            });
            start.elapsed()
        });
    });

    group.bench_function("typed handler", |b| {
        let handler = typed_handler(|params: Value| async move {
            Ok::<_, HandlerError>(params["prompt"].as_str().map(str::len))
        });
        let broker = MemoryBroker::new();
        let dispatcher = Dispatcher::new(Arc::new(handler), Arc::new(broker.connect()));
        b.iter_custom(|iterations| {
            let start = Instant::now();
            rt.block_on(async {
                for _ in 0..iterations {
                    let message = request(None, params.clone());
                    dispatcher.process_request(message).await.unwrap();
                }
            });
            start.elapsed()
        });
    });

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let payload = br#"{"params": {"prompt": "hello", "max_tokens": 16}, "metadata": {"trace": "abc"}}"#;
    c.bench_function("envelope decode", |b| {
        b.iter(|| RequestEnvelope::decode(payload).unwrap());
    });
}

criterion_group!(benches, bench_dispatch, bench_decode);
criterion_main!(benches);
