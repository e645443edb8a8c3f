//! lapin-backed implementation of the transport traits.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    ChannelEvent, ConsumeOptions, DeliveryReceiver, Fault, Message, MessageChannel,
    MessageProperties, OpensChannels, QueueOptions,
};

/// A lapin connection exposed through the capability traits.
pub struct AmqpConnection {
    inner: Connection,
}

impl AmqpConnection {
    /// Connect to the broker at `uri`.
    pub async fn connect(uri: &str) -> Result<Self, Fault> {
        debug!(uri, "connecting to broker");
        let inner = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(fault_from_lapin)?;
        Ok(Self { inner })
    }

    /// Wrap an already established lapin connection.
    pub fn from_lapin(inner: Connection) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl OpensChannels for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn MessageChannel>, Fault> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(fault_from_lapin)?;
        Ok(Arc::new(AmqpChannel::new(channel)))
    }
}

/// One lapin channel plus the broadcast its observers subscribe to.
pub struct AmqpChannel {
    inner: Channel,
    events: broadcast::Sender<ChannelEvent>,
}

impl AmqpChannel {
    pub fn new(inner: Channel) -> Self {
        let (events, _) = broadcast::channel(16);
        Self { inner, events }
    }

    fn emit(&self, event: ChannelEvent) {
        // no receivers just means nobody armed a guard
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl MessageChannel for AmqpChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String, Fault> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(fault_from_lapin)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn check_queue(&self, name: &str) -> Result<(), Fault> {
        let probe = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;
        match probe {
            Ok(_) => Ok(()),
            Err(err) => {
                // a failed passive declare is a channel error on the wire
                // and the broker has already closed the channel; surface it
                // to armed guards as well as to the probing caller
                let fault = fault_from_lapin(err);
                self.emit(ChannelEvent::Error(fault.clone()));
                Err(fault)
            }
        }
    }

    async fn delete_queue(&self, name: &str) -> Result<(), Fault> {
        self.inner
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(fault_from_lapin)
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryReceiver, Fault> {
        let tag = format!("rpc-{}", Uuid::new_v4());
        let mut consumer = self
            .inner
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(fault_from_lapin)?;

        let (deliveries, receiver) = mpsc::unbounded_channel();
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => {
                        let message = Message {
                            properties: MessageProperties {
                                correlation_id: delivery
                                    .properties
                                    .correlation_id()
                                    .as_ref()
                                    .map(|id| id.as_str().to_string()),
                                reply_to: delivery
                                    .properties
                                    .reply_to()
                                    .as_ref()
                                    .map(|q| q.as_str().to_string()),
                                content_type: delivery
                                    .properties
                                    .content_type()
                                    .as_ref()
                                    .map(|ct| ct.as_str().to_string()),
                            },
                            content: delivery.data,
                        };
                        if deliveries.send(Some(message)).is_err() {
                            // subscriber gone, stop pumping
                            break;
                        }
                    }
                    Err(err) => {
                        let fault = fault_from_lapin(err);
                        warn!(error = %fault, "consumer stream failed");
                        let _ = events.send(ChannelEvent::Error(fault));
                        break;
                    }
                }
            }
            // the stream only ends once the channel or consumer is gone
            let _ = events.send(ChannelEvent::Closed);
        });
        Ok(receiver)
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<bool, Fault> {
        let mut props = BasicProperties::default();
        if let Some(correlation_id) = properties.correlation_id {
            props = props.with_correlation_id(correlation_id.into());
        }
        if let Some(reply_to) = properties.reply_to {
            props = props.with_reply_to(reply_to.into());
        }
        if let Some(content_type) = properties.content_type {
            props = props.with_content_type(content_type.into());
        }
        self.inner
            .basic_publish("", queue, BasicPublishOptions::default(), payload, props)
            .await
            .map_err(fault_from_lapin)?;
        // lapin applies backpressure through its own futures; there is no
        // writable flag to report
        Ok(true)
    }

    async fn close(&self) -> Result<(), Fault> {
        let result = self
            .inner
            .close(0, "rpc channel done")
            .await
            .map_err(fault_from_lapin);
        self.emit(ChannelEvent::Closed);
        result
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}

fn fault_from_lapin(error: lapin::Error) -> Fault {
    // classify by the broker's reply text, the way RabbitMQ reports it:
    // "NOT_FOUND - no queue 'name' in vhost '/'"
    let message = error.to_string();
    let code = if message.contains("NOT_FOUND") || message.contains("no queue") {
        Some(404)
    } else {
        None
    };
    Fault { code, message }
}
