use std::{process::ExitCode, time::Duration};

use busworker::{
    runtime, spawn_signal_listener, Echo, ShutdownCoordinator, Worker, WorkerConfig, WorkerError,
};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "busworker", version, about = "Echo worker for a NATS request/reply service")]
struct Cli {
    /// Subject prefix; the worker listens on `<service>.<client_id>`
    #[arg(long, env = "BUSWORKER_SERVICE", default_value = "inference")]
    service: String,

    /// Model name announced as `inference:<model>`
    #[arg(long, env = "BUSWORKER_MODEL", default_value = "echo")]
    model: String,

    #[arg(long, env = "BUSWORKER_BROKER_URL", default_value = busworker::DEFAULT_BROKER_URL)]
    broker_url: String,

    #[arg(long, env = "BUSWORKER_QUEUE_GROUP", default_value = busworker::DEFAULT_QUEUE_GROUP)]
    queue_group: String,

    /// Stop waiting for in-flight requests after this many seconds
    #[arg(
        long,
        env = "BUSWORKER_DRAIN_TIMEOUT_SECS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    drain_timeout_secs: Option<u64>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "BUSWORKER_LOG", default_value = "info")]
    log: String,
}

impl Cli {
    fn worker_config(&self) -> WorkerConfig {
        let mut config = WorkerConfig::new(&self.service, &self.model)
            .with_broker_url(&self.broker_url)
            .with_queue_group(&self.queue_group)
            .with_connection_name(format!("{}:{}", self.service, self.model));
        if let Some(secs) = self.drain_timeout_secs {
            config = config.with_drain_timeout(Duration::from_secs(secs));
        }
        config
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = match runtime::build(runtime::worker_threads()) {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(serve(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "worker exited");
            ExitCode::FAILURE
        }
    }
}

async fn serve(cli: Cli) -> Result<(), WorkerError> {
    let config = cli.worker_config();
    tracing::info!(model = %config.model_name, broker = %config.broker_url, "starting worker");

    let shutdown = ShutdownCoordinator::new();
    spawn_signal_listener(shutdown.clone());

    Worker::new(config, Echo).run(shutdown).await
}
