use std::future;

use tokio::sync::broadcast;

use crate::transport::{ChannelEvent, Fault, MessageChannel};

/// How a guarded channel died.
#[derive(Clone, Debug)]
pub enum ChannelDeath {
    /// The channel emitted an `error` notification; it is already unusable.
    Errored(Fault),
    /// The channel emitted a `close` notification, possibly without an
    /// error.
    Closed,
}

/// Observes a channel's terminal notifications so they can be raced against
/// an in-flight operation.
///
/// The subscription is non-exclusive: other observers of the same channel
/// still see the events. Once any race branch wins, call [`cancel`] so late
/// notifications cannot mutate an already-decided outcome.
///
/// [`cancel`]: ChannelGuard::cancel
pub struct ChannelGuard {
    events: Option<broadcast::Receiver<ChannelEvent>>,
}

impl ChannelGuard {
    pub fn arm(channel: &dyn MessageChannel) -> Self {
        Self {
            events: Some(channel.events()),
        }
    }

    /// Resolves exactly once, when the channel emits its terminal `error`
    /// or `close` notification. After [`cancel`](Self::cancel) it stays
    /// pending forever.
    pub async fn died(&mut self) -> ChannelDeath {
        match self.events.as_mut() {
            Some(events) => loop {
                match events.recv().await {
                    Ok(ChannelEvent::Error(fault)) => return ChannelDeath::Errored(fault),
                    Ok(ChannelEvent::Closed) => return ChannelDeath::Closed,
                    // sender dropped without a terminal event: the channel
                    // object itself is gone
                    Err(broadcast::error::RecvError::Closed) => return ChannelDeath::Closed,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            },
            None => future::pending().await,
        }
    }

    /// Detach from the channel's notifications. Idempotent; safe before or
    /// after `died` has resolved.
    pub fn cancel(&mut self) {
        self.events = None;
    }

    pub fn is_armed(&self) -> bool {
        self.events.is_some()
    }
}
