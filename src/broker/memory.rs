use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{subject_matches, Broker, InboundMessage, MessageStream};
use crate::WorkerError;

/// Something that happened on a [`MemoryConnection`], in order.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalEntry {
    Published {
        client_id: String,
        subject: String,
        payload: Bytes,
    },
    Closed {
        client_id: String,
    },
}

/// In-process broker with NATS-like subject and queue-group routing.
///
/// Cheap to clone; clones share the same routing table.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    next_client_id: u64,
    subscriptions: Vec<Subscription>,
    closed: HashSet<String>,
    cursors: HashMap<(String, String), usize>,
    journal: Vec<JournalEntry>,
}

struct Subscription {
    owner: Option<String>,
    pattern: String,
    queue_group: Option<String>,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

impl State {
    fn subscribe(
        &mut self,
        owner: Option<String>,
        pattern: &str,
        queue_group: Option<&str>,
    ) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.push(Subscription {
            owner,
            pattern: pattern.to_string(),
            queue_group: queue_group.map(str::to_string),
            tx,
        });
        Box::pin(UnboundedReceiverStream::new(rx))
    }

    fn route(&mut self, message: InboundMessage) -> usize {
        self.subscriptions.retain(|sub| !sub.tx.is_closed());

        let mut delivered = 0;
        let mut groups: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();

        for (idx, sub) in self.subscriptions.iter().enumerate() {
            if !subject_matches(&sub.pattern, &message.subject) {
                continue;
            }
            match &sub.queue_group {
                Some(group) => groups
                    .entry((sub.pattern.clone(), group.clone()))
                    .or_default()
                    .push(idx),
                None => {
                    if sub.tx.send(message.clone()).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }

        for (key, members) in groups {
            let cursor = self.cursors.entry(key).or_insert(0);
            let idx = members[*cursor % members.len()];
            *cursor += 1;
            if self.subscriptions[idx].tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }

        delivered
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a new session with its own client id.
    pub fn connect(&self) -> MemoryConnection {
        let client_id = {
            let mut state = self.lock();
            state.next_client_id += 1;
            state.next_client_id.to_string()
        };
        MemoryConnection {
            broker: self.clone(),
            client_id,
        }
    }

    /// Publishes as an outside client; returns how many subscribers received it.
    pub fn deliver(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: impl Into<Bytes>,
    ) -> usize {
        let message = InboundMessage::new(subject, reply.map(str::to_string), payload);
        self.lock().route(message)
    }

    /// Plain (non-queue) subscription, useful for watching replies and status.
    pub fn observe(&self, subject: &str) -> MessageStream {
        self.lock().subscribe(None, subject, None)
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.lock().journal.clone()
    }

    /// Payloads published on exactly `subject`, oldest first.
    pub fn published(&self, subject: &str) -> Vec<Bytes> {
        self.lock()
            .journal
            .iter()
            .filter_map(|entry| match entry {
                JournalEntry::Published {
                    subject: s,
                    payload,
                    ..
                } if s == subject => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// Live subscriptions whose pattern is exactly `subject`.
    pub fn subscription_count(&self, subject: &str) -> usize {
        self.lock()
            .subscriptions
            .iter()
            .filter(|sub| sub.pattern == subject && !sub.tx.is_closed())
            .count()
    }
}

/// A session on a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryConnection {
    broker: MemoryBroker,
    client_id: String,
}

impl MemoryConnection {
    pub fn is_closed(&self) -> bool {
        self.broker.lock().closed.contains(&self.client_id)
    }

    fn closed_error(&self) -> WorkerError {
        WorkerError::ConnectionError(format!("connection {} is closed", self.client_id))
    }
}

#[async_trait]
impl Broker for MemoryConnection {
    fn client_id(&self) -> String {
        self.client_id.clone()
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Result<MessageStream, WorkerError> {
        let mut state = self.broker.lock();
        if state.closed.contains(&self.client_id) {
            return Err(self.closed_error());
        }
        Ok(state.subscribe(Some(self.client_id.clone()), subject, Some(queue_group)))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), WorkerError> {
        let mut state = self.broker.lock();
        if state.closed.contains(&self.client_id) {
            return Err(self.closed_error());
        }
        state.journal.push(JournalEntry::Published {
            client_id: self.client_id.clone(),
            subject: subject.to_string(),
            payload: payload.clone(),
        });
        state.route(InboundMessage::new(subject, None, payload));
        Ok(())
    }

    async fn close(&self) -> Result<(), WorkerError> {
        let mut state = self.broker.lock();
        if !state.closed.insert(self.client_id.clone()) {
            return Ok(());
        }
        let client_id = Some(self.client_id.as_str());
        state
            .subscriptions
            .retain(|sub| sub.owner.as_deref() != client_id);
        state.journal.push(JournalEntry::Closed {
            client_id: self.client_id.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;

    async fn next(stream: &mut MessageStream) -> Option<InboundMessage> {
        tokio::time::timeout(Duration::from_millis(200), stream.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn connections_get_distinct_client_ids() {
        let broker = MemoryBroker::new();
        let a = broker.connect();
        let b = broker.connect();
        assert_eq!(a.client_id(), "1");
        assert_eq!(b.client_id(), "2");
    }

    #[tokio::test]
    async fn queue_group_delivers_to_one_member_round_robin() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let mut first = conn.queue_subscribe("infer.>", "workers").await.unwrap();
        let mut second = conn.queue_subscribe("infer.>", "workers").await.unwrap();

        assert_eq!(broker.deliver("infer.a", None, "1"), 1);
        assert_eq!(broker.deliver("infer.a", None, "2"), 1);

        assert_eq!(next(&mut first).await.unwrap().payload, Bytes::from("1"));
        assert_eq!(next(&mut second).await.unwrap().payload, Bytes::from("2"));
    }

    #[tokio::test]
    async fn plain_subscribers_all_receive() {
        let broker = MemoryBroker::new();
        let mut a = broker.observe("worker:status");
        let mut b = broker.observe("worker:status");
        let conn = broker.connect();

        conn.publish("worker:status", Bytes::from("up")).await.unwrap();

        assert_eq!(next(&mut a).await.unwrap().payload, Bytes::from("up"));
        assert_eq!(next(&mut b).await.unwrap().payload, Bytes::from("up"));
        assert_eq!(broker.published("worker:status"), vec![Bytes::from("up")]);
    }

    #[tokio::test]
    async fn deliver_carries_reply_address() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let mut sub = conn.queue_subscribe("infer.1", "workers").await.unwrap();

        broker.deliver("infer.1", Some("_INBOX.9"), "{}");

        let message = next(&mut sub).await.unwrap();
        assert_eq!(message.subject, "infer.1");
        assert_eq!(message.reply.as_deref(), Some("_INBOX.9"));
    }

    #[tokio::test]
    async fn close_ends_subscriptions_and_rejects_publish() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let mut sub = conn.queue_subscribe("infer.1", "workers").await.unwrap();
        assert_eq!(broker.subscription_count("infer.1"), 1);

        conn.close().await.unwrap();
        conn.close().await.unwrap();

        assert!(conn.is_closed());
        assert!(sub.next().await.is_none());
        assert_eq!(broker.subscription_count("infer.1"), 0);
        assert!(matches!(
            conn.publish("x", Bytes::new()).await,
            Err(WorkerError::ConnectionError(_))
        ));
        assert!(conn.queue_subscribe("infer.1", "workers").await.is_err());

        let closes = broker
            .journal()
            .into_iter()
            .filter(|entry| matches!(entry, JournalEntry::Closed { .. }))
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let sub = conn.queue_subscribe("infer.1", "workers").await.unwrap();
        drop(sub);

        assert_eq!(broker.deliver("infer.1", None, "x"), 0);
        assert_eq!(broker.subscription_count("infer.1"), 0);
    }
}
