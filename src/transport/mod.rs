//! Transport capability layer.
//!
//! The RPC engine is written against the [`OpensChannels`] and
//! [`MessageChannel`] traits rather than against a concrete broker client.
//! [`amqp`] implements them over lapin; [`memory`] implements them entirely
//! in-process for tests and local wiring.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

pub mod amqp;
pub mod memory;

/// An asynchronous failure notification from the transport, as opposed to a
/// synchronous error return.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct Fault {
    /// Broker reply code, when the failure carries one (e.g. 404).
    pub code: Option<u16>,
    pub message: String,
}

impl Fault {
    pub fn new(code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The fault RabbitMQ raises for operations on a missing queue.
    pub fn not_found(queue: &str) -> Self {
        Self::new(Some(404), format!("NOT_FOUND - no queue '{queue}'"))
    }

    /// The channel has already been invalidated; no further operations are
    /// possible on it.
    pub fn channel_unusable() -> Self {
        Self::new(None, "channel is closed")
    }

    /// The broker's specific "queue does not exist" condition: reply code
    /// 404 together with the `no queue` message pattern.
    pub fn is_not_found(&self) -> bool {
        self.code == Some(404) && self.message.contains("no queue")
    }
}

/// Terminal channel notifications. A channel emits at most one `Error`
/// followed by at most one `Closed`; nothing follows either.
#[derive(Clone, Debug)]
pub enum ChannelEvent {
    Error(Fault),
    Closed,
}

/// Envelope properties the RPC engine cares about.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
}

/// A message as delivered by the transport. Immutable once received.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub properties: MessageProperties,
    pub content: Vec<u8>,
}

impl Message {
    /// Decode a JSON payload into a typed value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.content)
    }
}

/// Declare options for a queue.
#[derive(Clone, Debug, Default)]
pub struct QueueOptions {
    /// Scope the queue to the declaring channel's connection.
    pub exclusive: bool,
    pub durable: bool,
    pub auto_delete: bool,
}

/// Consume options for a subscription.
#[derive(Clone, Debug, Default)]
pub struct ConsumeOptions {
    /// Deliver without requiring manual acknowledgement.
    pub no_ack: bool,
}

/// Deliveries from a subscription. A `None` item models the transport's
/// null delivery when the consumed queue is deleted out from under the
/// consumer.
pub type DeliveryReceiver = mpsc::UnboundedReceiver<Option<Message>>;

/// A broker session that can hand out multiplexed channels. The connection
/// outlives any number of operations and is never mutated by the engine.
#[async_trait]
pub trait OpensChannels: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn MessageChannel>, Fault>;
}

/// A logical link over a connection. Each RPC operation owns its channel
/// exclusively for its duration and closes it exactly once on every exit
/// path.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Assert a queue. An empty `name` requests a broker-generated one; the
    /// actual name is returned either way.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String, Fault>;

    /// Probe whether a queue exists. A missing queue yields the 404 fault
    /// and invalidates the channel, mirroring a passive declare on the
    /// wire; implementations also emit [`ChannelEvent::Error`] so armed
    /// guards observe the failure.
    async fn check_queue(&self, name: &str) -> Result<(), Fault>;

    async fn delete_queue(&self, name: &str) -> Result<(), Fault>;

    /// Register a consumer on `queue` and stream its deliveries.
    async fn consume(&self, queue: &str, options: ConsumeOptions)
        -> Result<DeliveryReceiver, Fault>;

    /// Publish to a queue via the default exchange. The returned bool is
    /// the transport's local backpressure signal.
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<bool, Fault>;

    async fn close(&self) -> Result<(), Fault>;

    /// Subscribe to the channel's terminal notifications. Non-exclusive:
    /// any number of observers may subscribe without stealing events from
    /// each other.
    fn events(&self) -> broadcast::Receiver<ChannelEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_requires_code_and_message_pattern() {
        assert!(Fault::not_found("jobs").is_not_found());
        assert!(!Fault::new(Some(404), "PRECONDITION_FAILED").is_not_found());
        assert!(!Fault::new(None, "no queue 'jobs'").is_not_found());
        assert!(!Fault::new(Some(406), "no queue 'jobs'").is_not_found());
    }

    #[test]
    fn decode_reads_json_payloads() {
        let message = Message {
            properties: MessageProperties::default(),
            content: b"{\"a\":10,\"b\":20}".to_vec(),
        };
        let value: serde_json::Value = message.decode().unwrap();
        assert_eq!(value["a"], 10);
        assert_eq!(value["b"], 20);
    }
}
