#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use busworker::{
    GpuDescriptor, InboundMessage, MemoryBroker, MessageStream, RequestHandler,
    ShutdownCoordinator, StaticGpus, Worker, WorkerConfig, WorkerError, STATUS_SUBJECT,
};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;

pub fn test_config() -> WorkerConfig {
    WorkerConfig::new("infer", "echo")
}

pub fn test_gpus() -> Vec<GpuDescriptor> {
    vec![GpuDescriptor {
        index: 0,
        name: "NVIDIA L4".into(),
        memory_total_mib: 23034,
        uuid: "GPU-0f1e".into(),
    }]
}

pub struct Harness {
    pub broker: MemoryBroker,
    pub client_id: String,
    pub status: MessageStream,
    pub shutdown: ShutdownCoordinator,
    pub handle: JoinHandle<Result<(), WorkerError>>,
}

impl Harness {
    pub fn request_subject(&self) -> String {
        format!("infer.{}", self.client_id)
    }

    /// Delivers a request and returns how many workers received it.
    pub fn send(&self, reply: Option<&str>, payload: &str) -> usize {
        self.broker
            .deliver(&self.request_subject(), reply, payload.to_string())
    }

    pub async fn stop(self) -> (MemoryBroker, Result<(), WorkerError>) {
        self.shutdown.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("worker did not stop")
            .expect("worker task panicked");
        (self.broker, result)
    }
}

/// Starts `handler` on a fresh in-memory broker and waits for the `connected` notice.
pub async fn start_worker<H: RequestHandler>(handler: H) -> Harness {
    start_worker_on(MemoryBroker::new(), test_config(), handler).await
}

pub async fn start_worker_on<H: RequestHandler>(
    broker: MemoryBroker,
    config: WorkerConfig,
    handler: H,
) -> Harness {
    let mut status = broker.observe(STATUS_SUBJECT);
    let connection = broker.connect();
    let client_id = busworker::Broker::client_id(&connection);

    let mut worker =
        Worker::new(config, handler).with_gpu_inventory(StaticGpus(test_gpus()));
    worker
        .connect_with(Arc::new(connection))
        .await
        .expect("attach broker");

    let shutdown = ShutdownCoordinator::new();
    let handle = tokio::spawn(worker.run(shutdown.clone()));

    let first = next_message(&mut status)
        .await
        .expect("no connected notice");
    assert_eq!(json(&first)["status"], "connected");

    Harness {
        broker,
        client_id,
        status,
        shutdown,
        handle,
    }
}

pub async fn next_message(stream: &mut MessageStream) -> Option<InboundMessage> {
    tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .ok()
        .flatten()
}

pub fn json(message: &InboundMessage) -> Value {
    serde_json::from_slice(&message.payload).expect("payload is JSON")
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
