use std::future;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::errors::{RequestContext, Result, RpcError};
use crate::guard::{ChannelDeath, ChannelGuard};
use crate::transport::{
    ConsumeOptions, Message, MessageChannel, MessageProperties, OpensChannels, QueueOptions,
};

/// Options for [`request`].
#[derive(Clone, Debug)]
pub struct RequestOptions {
    /// Wall-clock window for the reply, measured from the moment the
    /// request is published. `None` waits until the reply arrives or the
    /// channel dies.
    pub timeout: Option<Duration>,
    /// Properties for the request publish. `correlation_id` and `reply_to`
    /// are always overwritten by the engine.
    pub send: MessageProperties,
    /// Declare options for the ephemeral reply queue.
    pub queue: QueueOptions,
    /// Consume options for the reply queue.
    pub consume: ConsumeOptions,
    /// Use this reply queue name instead of a broker-generated one.
    pub reply_queue: Option<String>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            send: MessageProperties::default(),
            // exclusive scopes the reply queue to this invocation's channel
            queue: QueueOptions {
                exclusive: true,
                ..QueueOptions::default()
            },
            // replies need no manual acknowledgement
            consume: ConsumeOptions { no_ack: true },
            reply_queue: None,
        }
    }
}

impl RequestOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

/// Publish `content` to `queue` and await the single response correlated
/// with this invocation.
///
/// Opens a dedicated channel, declares an ephemeral reply queue, subscribes
/// to it, publishes the request tagged with a fresh correlation id and the
/// reply queue name, then races the matching reply against channel death
/// and the optional timeout. The reply queue is deleted and the channel
/// closed before this returns, whatever the outcome; when the outcome is
/// [`RpcError::ChannelClosed`] the redundant close is skipped.
pub async fn request(
    connection: &dyn OpensChannels,
    queue: &str,
    content: impl Into<Vec<u8>>,
    options: RequestOptions,
) -> Result<Message> {
    let content = content.into();
    let channel = connection.open_channel().await?;
    // armed before anything else so a failure in any later step is observed
    let mut guard = ChannelGuard::arm(channel.as_ref());

    let mut reply_queue = None;
    let outcome = exchange(
        channel.as_ref(),
        &mut guard,
        &mut reply_queue,
        queue,
        &content,
        &options,
    )
    .await;
    guard.cancel();

    // cleanup is best-effort and never overrides the outcome
    let channel_dead = matches!(&outcome, Err(RpcError::ChannelClosed { .. }));
    if let Some(reply_queue) = reply_queue {
        if let Err(fault) = channel.delete_queue(&reply_queue).await {
            debug!(queue = %reply_queue, error = %fault, "ignored reply queue delete failure");
        }
    }
    if !channel_dead {
        if let Err(fault) = channel.close().await {
            debug!(error = %fault, "ignored channel close failure");
        }
    }

    outcome
}

/// Declare, subscribe, publish, and await the raced outcome. The declared
/// reply queue name is written into `reply_queue` as soon as it exists so
/// the caller can delete it on every exit path.
async fn exchange(
    channel: &dyn MessageChannel,
    guard: &mut ChannelGuard,
    reply_queue: &mut Option<String>,
    queue: &str,
    content: &[u8],
    options: &RequestOptions,
) -> Result<Message> {
    let correlation_id = Uuid::new_v4().to_string();
    let context = RequestContext {
        queue: queue.to_string(),
        content: Some(content.to_vec()),
        correlation_id: Some(correlation_id.clone()),
    };

    let requested = options.reply_queue.clone().unwrap_or_default();
    let declared = tokio::select! {
        declared = channel.declare_queue(&requested, options.queue.clone()) => declared?,
        death = guard.died() => return Err(death_error(death, &context)),
    };
    debug!(correlation_id = %correlation_id, reply_queue = %declared, "declared reply queue");
    *reply_queue = Some(declared.clone());

    let mut deliveries = tokio::select! {
        subscribed = channel.consume(&declared, options.consume.clone()) => subscribed?,
        death = guard.died() => return Err(death_error(death, &context)),
    };

    let mut properties = options.send.clone();
    properties.correlation_id = Some(correlation_id.clone());
    properties.reply_to = Some(declared);
    tokio::select! {
        published = channel.publish(queue, content, properties) => { published?; }
        death = guard.died() => return Err(death_error(death, &context)),
    }
    debug!(correlation_id = %correlation_id, queue, "request published");

    // the timeout window starts once the request is on the wire
    let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
    let mut subscribed = true;
    loop {
        tokio::select! {
            // a fully received matching reply must win over a same-tick
            // death or timeout
            biased;

            delivery = deliveries.recv(), if subscribed => match delivery {
                Some(Some(message)) => {
                    if message.properties.correlation_id.as_deref()
                        == Some(correlation_id.as_str())
                    {
                        debug!(correlation_id = %correlation_id, "reply received");
                        return Ok(message);
                    }
                    // stale or foreign correlation id: drop silently
                }
                // null delivery, the reply queue was deleted under us
                Some(None) => {}
                None => subscribed = false,
            },
            death = guard.died() => return Err(death_error(death, &context)),
            _ = wait_until(deadline) => {
                debug!(correlation_id = %correlation_id, timeout = ?options.timeout, "request timed out");
                return Err(RpcError::Timeout { context: context.clone() });
            }
        }
    }
}

fn death_error(death: ChannelDeath, context: &RequestContext) -> RpcError {
    if let ChannelDeath::Errored(fault) = death {
        debug!(error = %fault, "channel errored before the reply arrived");
    }
    RpcError::ChannelClosed {
        context: context.clone(),
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}
