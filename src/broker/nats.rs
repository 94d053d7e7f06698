use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tracing::debug;

use super::{Broker, InboundMessage, MessageStream};
use crate::WorkerError;

/// [`Broker`] backed by an `async-nats` client.
pub struct NatsBroker {
    client: async_nats::Client,
}

impl NatsBroker {
    /// Connects once; an unreachable server is reported, not retried.
    pub async fn connect(url: &str, connection_name: Option<&str>) -> Result<Self, WorkerError> {
        let mut options = async_nats::ConnectOptions::new();
        if let Some(name) = connection_name {
            options = options.name(name);
        }

        let client = options
            .connect(url)
            .await
            .map_err(|e| WorkerError::ConnectionError(format!("{url}: {e}")))?;

        debug!(url, client_id = client.server_info().client_id, "connected to broker");
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Broker for NatsBroker {
    fn client_id(&self) -> String {
        self.client.server_info().client_id.to_string()
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Result<MessageStream, WorkerError> {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), queue_group.to_string())
            .await
            .map_err(|e| WorkerError::SubscribeError(e.to_string()))?;

        let messages = subscriber.map(|message| InboundMessage {
            subject: message.subject.to_string(),
            reply: message.reply.map(|reply| reply.to_string()),
            payload: message.payload,
        });
        Ok(Box::pin(messages))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), WorkerError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| WorkerError::PublishError(e.to_string()))
    }

    /// Flushes pending publishes, then drains the connection. Every clone of
    /// the client fails afterwards, including ones held by unfinished requests.
    async fn close(&self) -> Result<(), WorkerError> {
        self.client
            .flush()
            .await
            .map_err(|e| WorkerError::ConnectionError(e.to_string()))?;
        self.client
            .drain()
            .await
            .map_err(|e| WorkerError::ConnectionError(format!("draining session: {e}")))
    }
}
