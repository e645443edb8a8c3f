use tracing::debug;

use crate::errors::{RequestContext, Result, RpcError};
use crate::fatal;
use crate::guard::{ChannelDeath, ChannelGuard};
use crate::transport::{Message, MessageChannel, OpensChannels};

/// Create a channel, probe whether `queue` exists on the broker, and tear
/// the channel down again.
///
/// Returns `false` exactly when the broker reports the specific not-found
/// condition. Any other probe failure propagates unmodified; an unexpected
/// channel `error` notification is routed to the fatal-fault sink because
/// it is not recoverable at this layer.
pub async fn check_queue(connection: &dyn OpensChannels, queue: &str) -> Result<bool> {
    let channel = connection.open_channel().await?;
    let mut guard = ChannelGuard::arm(channel.as_ref());
    debug!(queue, "checking queue existence");

    tokio::select! {
        probe = channel.check_queue(queue) => {
            guard.cancel();
            match probe {
                Ok(()) => {
                    channel.close().await?;
                    Ok(true)
                }
                // the broker has already invalidated the channel, no close
                Err(fault) if fault.is_not_found() => Ok(false),
                Err(fault) => {
                    if let Err(close_fault) = channel.close().await {
                        debug!(error = %close_fault, "ignored close failure after failed probe");
                    }
                    Err(RpcError::Transport(fault))
                }
            }
        }
        death = guard.died() => {
            guard.cancel();
            match death {
                ChannelDeath::Errored(fault) if fault.is_not_found() => Ok(false),
                ChannelDeath::Errored(fault) => {
                    fatal::report(fault);
                    Err(RpcError::ChannelClosed {
                        context: RequestContext::queue(queue),
                    })
                }
                ChannelDeath::Closed => Err(RpcError::ChannelClosed {
                    context: RequestContext::queue(queue),
                }),
            }
        }
    }
}

/// Probe the queue an inbound request expects its reply on.
pub async fn check_reply_queue(connection: &dyn OpensChannels, inbound: &Message) -> Result<bool> {
    let reply_to = inbound.properties.reply_to.as_deref().ok_or_else(|| {
        RpcError::InvalidArgument(
            "cannot check the reply queue of a message without 'reply_to'".into(),
        )
    })?;
    check_queue(connection, reply_to).await
}
