//! Transport seam between the worker and a pub/sub broker.
//!
//! The worker only talks to [`Broker`]; [`NatsBroker`] is the production
//! adapter and [`MemoryBroker`] an in-process stand-in.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;

use crate::WorkerError;

mod memory;
mod nats;

pub use memory::{JournalEntry, MemoryBroker, MemoryConnection};
pub use nats::NatsBroker;

/// A message delivered on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub subject: String,
    /// Where the sender expects the reply, if anywhere.
    pub reply: Option<String>,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(subject: impl Into<String>, reply: Option<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply,
            payload: payload.into(),
        }
    }
}

pub type MessageStream = Pin<Box<dyn Stream<Item = InboundMessage> + Send>>;

/// One broker session.
///
/// `publish` may be called concurrently from independent tasks.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Connection identifier assigned by the broker.
    fn client_id(&self) -> String;

    async fn queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Result<MessageStream, WorkerError>;

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), WorkerError>;

    /// Flushes pending publishes and ends the session.
    async fn close(&self) -> Result<(), WorkerError>;
}

/// Matches a subject against a subscription pattern.
///
/// `*` matches exactly one token and a trailing `>` one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut tokens = subject.split('.');
    for expected in pattern.split('.') {
        match expected {
            ">" => return tokens.next().is_some(),
            "*" => {
                if tokens.next().is_none() {
                    return false;
                }
            }
            literal => {
                if tokens.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    tokens.next().is_none()
}
