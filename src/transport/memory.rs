//! In-process broker implementing the transport traits.
//!
//! Mirrors the slice of AMQP semantics the RPC engine relies on: named
//! queues, server-named queue generation, silent drop of publishes to
//! unknown queues, 404 channel faults on probes of missing queues, and null
//! deliveries when a consumed queue is deleted. The test suite runs the
//! full request/reply flow against it; it is also handy for wiring RPC
//! flows in a single process without a broker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::{
    ChannelEvent, ConsumeOptions, DeliveryReceiver, Fault, Message, MessageChannel,
    MessageProperties, OpensChannels, QueueOptions,
};

/// A shared in-memory broker. Cloning yields another handle to the same
/// queues and channels.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    channels: Vec<ChannelHandle>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    consumers: Vec<mpsc::UnboundedSender<Option<Message>>>,
}

struct ChannelHandle {
    events: broadcast::Sender<ChannelEvent>,
    closed: Arc<AtomicBool>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the queues currently declared, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let state = self.lock();
        let mut names: Vec<_> = state.queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Channels opened on this broker that have not yet been closed.
    pub fn open_channel_count(&self) -> usize {
        self.lock()
            .channels
            .iter()
            .filter(|handle| !handle.closed.load(Ordering::SeqCst))
            .count()
    }

    /// Emit an `error` notification on every open channel and invalidate
    /// them, simulating a broker-side fault.
    pub fn fail_channels(&self, fault: Fault) {
        for handle in self.lock().channels.iter() {
            if !handle.closed.swap(true, Ordering::SeqCst) {
                let _ = handle.events.send(ChannelEvent::Error(fault.clone()));
            }
        }
    }

    /// Emit a `close` notification on every open channel, simulating a
    /// dropped connection.
    pub fn close_channels(&self) {
        for handle in self.lock().channels.iter() {
            if !handle.closed.swap(true, Ordering::SeqCst) {
                let _ = handle.events.send(ChannelEvent::Closed);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl OpensChannels for MemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn MessageChannel>, Fault> {
        let (events, _) = broadcast::channel(16);
        let closed = Arc::new(AtomicBool::new(false));
        let mut state = self.lock();
        // closed handles are dead weight; drop them before tracking another
        state
            .channels
            .retain(|handle| !handle.closed.load(Ordering::SeqCst));
        state.channels.push(ChannelHandle {
            events: events.clone(),
            closed: closed.clone(),
        });
        drop(state);
        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            events,
            closed,
        }))
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    events: broadcast::Sender<ChannelEvent>,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), Fault> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Fault::channel_unusable())
        } else {
            Ok(())
        }
    }

    /// A channel-level protocol error: notify observers and invalidate the
    /// channel, as the broker would.
    fn protocol_error(&self, fault: Fault) -> Fault {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.events.send(ChannelEvent::Error(fault.clone()));
        fault
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn declare_queue(&self, name: &str, _options: QueueOptions) -> Result<String, Fault> {
        self.ensure_open()?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            name.to_string()
        };
        self.broker.lock().queues.entry(name.clone()).or_default();
        Ok(name)
    }

    async fn check_queue(&self, name: &str) -> Result<(), Fault> {
        self.ensure_open()?;
        if self.broker.lock().queues.contains_key(name) {
            Ok(())
        } else {
            Err(self.protocol_error(Fault::not_found(name)))
        }
    }

    async fn delete_queue(&self, name: &str) -> Result<(), Fault> {
        self.ensure_open()?;
        if let Some(queue) = self.broker.lock().queues.remove(name) {
            for consumer in queue.consumers {
                // null delivery: the consumed queue disappeared
                let _ = consumer.send(None);
            }
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _options: ConsumeOptions,
    ) -> Result<DeliveryReceiver, Fault> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let Some(queue_state) = state.queues.get_mut(queue) else {
            drop(state);
            return Err(self.protocol_error(Fault::not_found(queue)));
        };
        let (deliveries, receiver) = mpsc::unbounded_channel();
        while let Some(message) = queue_state.ready.pop_front() {
            let _ = deliveries.send(Some(message));
        }
        queue_state.consumers.push(deliveries);
        Ok(receiver)
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<bool, Fault> {
        self.ensure_open()?;
        let message = Message {
            properties,
            content: payload.to_vec(),
        };
        let mut state = self.broker.lock();
        // unroutable messages are dropped, default-exchange style
        if let Some(queue_state) = state.queues.get_mut(queue) {
            queue_state
                .consumers
                .retain(|consumer| !consumer.is_closed());
            if let Some(consumer) = queue_state.consumers.first() {
                let _ = consumer.send(Some(message));
            } else {
                queue_state.ready.push_back(message);
            }
        }
        Ok(true)
    }

    async fn close(&self) -> Result<(), Fault> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(ChannelEvent::Closed);
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}
