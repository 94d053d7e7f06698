//! Worker side of a request/reply service on a NATS-style message bus.
//!
//! A [`Worker`] connects to a broker, queue-subscribes to
//! `<service_name>.<client_id>`, announces itself on `worker:status`, hands
//! every request's `params` to a [`RequestHandler`] and publishes the result
//! to the request's reply address. Shutdown cancels in-flight requests before
//! announcing the disconnect and closing the session.
//!
//! ```no_run
//! use busworker::{handler_fn, ShutdownCoordinator, Worker, WorkerConfig};
//!
//! # async fn run() -> Result<(), busworker::WorkerError> {
//! let config = WorkerConfig::new("infer", "llama-7b").apply_env()?;
//! let handler = handler_fn(|params| async move { Ok(params) });
//!
//! let shutdown = ShutdownCoordinator::new();
//! busworker::spawn_signal_listener(shutdown.clone());
//! Worker::new(config, handler).run(shutdown).await
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod gpu;
pub mod handler;
pub mod notice;
pub mod shutdown;
pub mod worker;

pub mod runtime {
    //! Runtime selection for the worker binary.
    use std::{env, io, thread};

    pub const WORKER_THREADS_ENV: &str = "BUSWORKER_THREADS";

    /// `BUSWORKER_THREADS` if it holds a positive count, else the host's parallelism.
    pub fn worker_threads() -> usize {
        threads_from(|key| env::var(key).ok())
    }

    fn threads_from<F>(lookup: F) -> usize
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup(WORKER_THREADS_ENV)
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .filter(|threads| *threads > 0)
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, |n| n.get()))
    }

    /// One thread gives a current-thread scheduler, where requests overlap
    /// only at their await points.
    pub fn build(threads: usize) -> io::Result<tokio::runtime::Runtime> {
        if threads <= 1 {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
        } else {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(threads)
                .enable_all()
                .build()
        }
    }

}

pub use broker::{Broker, InboundMessage, MemoryBroker, MemoryConnection, MessageStream, NatsBroker};
pub use config::{WorkerConfig, DEFAULT_BROKER_URL, DEFAULT_QUEUE_GROUP, STATUS_SUBJECT};
pub use envelope::RequestEnvelope;
pub use errors::WorkerError;
pub use gpu::{GpuDescriptor, GpuInventory, NvidiaSmi, StaticGpus};
pub use handler::{
    handler_fn, typed_handler, with_error_replies, Echo, HandlerError, RequestHandler,
};
pub use notice::{ConnectionNotice, ConnectionStatus};
pub use shutdown::{spawn_signal_listener, wait_for_signal, ShutdownCoordinator, ShutdownSignal};
pub use worker::{Dispatcher, Worker};
