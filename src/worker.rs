use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use serde::Serialize;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    broker::{Broker, InboundMessage, MessageStream, NatsBroker},
    config::WorkerConfig,
    envelope::RequestEnvelope,
    gpu::{GpuInventory, NvidiaSmi},
    handler::RequestHandler,
    notice::{ConnectionNotice, ConnectionStatus},
    shutdown::{ShutdownCoordinator, ShutdownSignal},
    WorkerError,
};

/// Decode, handle and reply for a single message.
///
/// Each in-flight request owns a clone; clones share the handler and the
/// broker session, so replies are published concurrently.
pub struct Dispatcher<H> {
    handler: Arc<H>,
    broker: Arc<dyn Broker>,
}

impl<H> Clone for Dispatcher<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            broker: self.broker.clone(),
        }
    }
}

impl<H: RequestHandler> Dispatcher<H> {
    pub fn new(handler: Arc<H>, broker: Arc<dyn Broker>) -> Self {
        Self { handler, broker }
    }

    /// A payload that fails to decode never reaches the handler and gets no reply.
    pub async fn process_request(&self, message: InboundMessage) -> Result<(), WorkerError> {
        let envelope = RequestEnvelope::decode(&message.payload)?;

        match self.handler.handle_request(envelope.params).await {
            Ok(result) => self.reply(&message, &result).await,
            Err(err) => {
                if let Some(body) = self.handler.error_reply(&err) {
                    self.reply(&message, &body).await?;
                }
                Err(WorkerError::HandlerError(err))
            }
        }
    }

    /// Publishes `result` to the message's reply address; without one this is a no-op.
    pub async fn reply<T>(&self, message: &InboundMessage, result: &T) -> Result<(), WorkerError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let Some(reply_to) = message.reply.as_deref() else {
            debug!(subject = %message.subject, "no reply address, dropping result");
            return Ok(());
        };

        let payload = serde_json::to_vec(result)?;
        self.broker.publish(reply_to, Bytes::from(payload)).await
    }
}

/// Worker side of a request/reply service on a message bus.
pub struct Worker<H> {
    config: WorkerConfig,
    handler: Arc<H>,
    gpus: Arc<dyn GpuInventory>,
    broker: Option<Arc<dyn Broker>>,
    notice: Option<ConnectionNotice>,
    announced: Option<ConnectionStatus>,
    subscription: Option<String>,
    in_flight: TaskTracker,
    cancel: CancellationToken,
    stopped: bool,
}

impl<H: RequestHandler> Worker<H> {
    pub fn new(config: WorkerConfig, handler: H) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
            gpus: Arc::new(NvidiaSmi),
            broker: None,
            notice: None,
            announced: None,
            subscription: None,
            in_flight: TaskTracker::new(),
            cancel: CancellationToken::new(),
            stopped: false,
        }
    }

    pub fn with_gpu_inventory(mut self, gpus: impl GpuInventory + 'static) -> Self {
        self.gpus = Arc::new(gpus);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn notice(&self) -> Option<&ConnectionNotice> {
        self.notice.as_ref()
    }

    pub fn announced(&self) -> Option<ConnectionStatus> {
        self.announced
    }

    pub fn client_id(&self) -> Option<String> {
        self.broker.as_ref().map(|broker| broker.client_id())
    }

    /// Number of request tasks not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Connects to `config.broker_url` over NATS.
    pub async fn connect(&mut self) -> Result<(), WorkerError> {
        if self.broker.is_some() {
            return Err(WorkerError::AlreadyConnected);
        }
        self.config.validate()?;

        let broker = NatsBroker::connect(
            &self.config.broker_url,
            self.config.connection_name.as_deref(),
        )
        .await?;
        self.connect_with(Arc::new(broker)).await
    }

    /// Attaches an already established broker session.
    pub async fn connect_with(&mut self, broker: Arc<dyn Broker>) -> Result<(), WorkerError> {
        if self.broker.is_some() {
            return Err(WorkerError::AlreadyConnected);
        }
        self.config.validate()?;

        let gpus = match self.gpus.visible_gpus().await {
            Ok(gpus) => gpus,
            Err(e) => {
                warn!(error = %e, "GPU inventory unavailable, announcing none");
                Vec::new()
            }
        };

        let client_id = broker.client_id();
        info!(
            %client_id,
            model = %self.config.model_name,
            gpus = gpus.len(),
            "worker connected"
        );

        self.notice = Some(ConnectionNotice::new(&self.config.model_name, gpus, client_id));
        self.broker = Some(broker);
        Ok(())
    }

    fn session(&self) -> Result<Arc<dyn Broker>, WorkerError> {
        self.broker.clone().ok_or(WorkerError::NotConnected)
    }

    pub fn dispatcher(&self) -> Result<Dispatcher<H>, WorkerError> {
        Ok(Dispatcher::new(self.handler.clone(), self.session()?))
    }

    /// Queue-subscribes to `<service_name>.<client_id>`, at most once per worker.
    pub async fn subscribe(&mut self) -> Result<MessageStream, WorkerError> {
        let broker = self.session()?;
        if let Some(subject) = &self.subscription {
            return Err(WorkerError::AlreadySubscribed(subject.clone()));
        }

        let subject = self.config.request_subject(&broker.client_id());
        let messages = broker
            .queue_subscribe(&subject, &self.config.queue_group)
            .await?;

        debug!(%subject, queue_group = %self.config.queue_group, "subscribed");
        self.subscription = Some(subject);
        Ok(messages)
    }

    /// Publishes the connection notice with `status` on the status subject.
    ///
    /// `connected` is announced once, then `disconnected` once.
    pub async fn announce(&mut self, status: ConnectionStatus) -> Result<(), WorkerError> {
        let allowed = matches!(
            (self.announced, status),
            (None, ConnectionStatus::Connected)
                | (Some(ConnectionStatus::Connected), ConnectionStatus::Disconnected)
        );
        if !allowed {
            return Err(WorkerError::InvalidTransition {
                from: self.announced,
                to: status,
            });
        }

        let broker = self.session()?;
        let mut notice = self.notice.clone().ok_or(WorkerError::NotConnected)?;
        notice.status = status;
        let payload = notice.to_bytes()?;

        broker
            .publish(&self.config.status_subject, Bytes::from(payload))
            .await?;
        self.notice = Some(notice);
        self.announced = Some(status);

        debug!(%status, subject = %self.config.status_subject, "announced");
        Ok(())
    }

    pub async fn process_request(&self, message: InboundMessage) -> Result<(), WorkerError> {
        self.dispatcher()?.process_request(message).await
    }

    pub async fn reply<T>(&self, message: &InboundMessage, result: &T) -> Result<(), WorkerError>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.dispatcher()?.reply(message, result).await
    }

    fn spawn_request(&self, dispatcher: &Dispatcher<H>, message: InboundMessage) {
        let dispatcher = dispatcher.clone();
        let cancel = self.cancel.clone();

        self.in_flight.spawn(async move {
            let subject = message.subject.clone();
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(%subject, "request cancelled by shutdown");
                }
                outcome = dispatcher.process_request(message) => log_outcome(&subject, outcome),
            }
        });
    }

    /// Runs the worker until `shutdown` fires or the broker ends the subscription.
    ///
    /// Connects if needed, subscribes, announces `connected` and then spawns
    /// one task per inbound message. Startup failures are returned; per-message
    /// failures are logged and the loop keeps going.
    pub async fn run(mut self, shutdown: ShutdownCoordinator) -> Result<(), WorkerError> {
        if self.broker.is_none() {
            self.connect().await?;
        }
        let mut messages = self.subscribe().await?;
        self.announce(ConnectionStatus::Connected).await?;
        let dispatcher = self.dispatcher()?;

        info!(
            service = %self.config.service_name,
            subject = self.subscription.as_deref().unwrap_or_default(),
            queue_group = %self.config.queue_group,
            "worker ready"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = messages.next() => match next {
                    Some(message) => self.spawn_request(&dispatcher, message),
                    None => {
                        warn!("subscription ended by broker");
                        break;
                    }
                },
            }
        }

        drop(messages);
        drop(dispatcher);
        self.shutdown(shutdown.signal()).await;
        Ok(())
    }

    /// Cancels in-flight requests, waits for them, announces `disconnected`
    /// and closes the session, in that order. Never fails; later calls are no-ops.
    pub async fn shutdown(&mut self, signal: Option<ShutdownSignal>) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        info!(
            signal = signal.map(ShutdownSignal::name).unwrap_or("none"),
            model = %self.config.model_name,
            in_flight = self.in_flight.len(),
            "gracefully shutting down worker"
        );

        self.cancel.cancel();
        self.in_flight.close();
        match self.config.drain_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, self.in_flight.wait()).await.is_err() {
                    warn!(
                        timeout = ?limit,
                        remaining = self.in_flight.len(),
                        "in-flight requests did not drain in time"
                    );
                }
            }
            None => self.in_flight.wait().await,
        }

        if self.announced == Some(ConnectionStatus::Connected) {
            if let Err(e) = self.announce(ConnectionStatus::Disconnected).await {
                let e = WorkerError::ShutdownError(format!("announcing disconnect: {e}"));
                error!(error = %e, "continuing shutdown");
            }
        }

        if let Some(broker) = self.broker.take() {
            if let Err(e) = broker.close().await {
                let e = WorkerError::ShutdownError(format!("closing session: {e}"));
                error!(error = %e, "continuing shutdown");
            }
        }

        info!(model = %self.config.model_name, "worker stopped");
    }
}

fn log_outcome(subject: &str, outcome: Result<(), WorkerError>) {
    match outcome {
        Ok(()) => debug!(subject, "request handled"),
        Err(e) if e.is_per_message() => warn!(subject, error = %e, "request dropped"),
        Err(e) => error!(subject, error = %e, "request failed"),
    }
}
