use tracing::debug;

use crate::errors::{RequestContext, Result, RpcError};
use crate::transport::{Message, MessageChannel, MessageProperties};

/// Options for [`reply`].
#[derive(Clone, Debug, Default)]
pub struct ReplyOptions {
    /// Properties for the response publish. `correlation_id` is overridden
    /// by the inbound message's id whenever that id is present.
    pub properties: MessageProperties,
    /// Probe the `reply_to` queue before publishing and fail with
    /// [`RpcError::QueueNotFound`] when it is gone.
    ///
    /// A failed probe invalidates the channel on the wire, so a consume
    /// loop enabling this loses its long-lived channel whenever a reply
    /// queue has disappeared. Reply over a throwaway channel if that
    /// matters.
    pub ensure_queue: bool,
}

/// Publish a response to an inbound request's `reply_to` queue on the given
/// channel.
///
/// Channel ownership stays with the caller, typically a consume loop: this
/// never opens or closes anything. Returns the transport's local
/// backpressure signal.
///
/// An inbound message without a `correlation_id` is answered untagged; most
/// requesters drop untagged responses, so this lax mode only helps peers
/// that correlate by other means.
pub async fn reply(
    channel: &dyn MessageChannel,
    inbound: &Message,
    content: impl Into<Vec<u8>>,
    options: ReplyOptions,
) -> Result<bool> {
    let reply_to = inbound.properties.reply_to.as_deref().ok_or_else(|| {
        RpcError::InvalidArgument("cannot reply to a message without 'reply_to'".into())
    })?;
    let content = content.into();

    let mut properties = options.properties;
    if let Some(correlation_id) = &inbound.properties.correlation_id {
        properties.correlation_id = Some(correlation_id.clone());
    }

    if options.ensure_queue {
        if let Err(fault) = channel.check_queue(reply_to).await {
            if fault.is_not_found() {
                let context = RequestContext {
                    queue: reply_to.to_string(),
                    content: Some(content),
                    correlation_id: properties.correlation_id,
                };
                return Err(RpcError::QueueNotFound { context, fault });
            }
            return Err(RpcError::Transport(fault));
        }
    }

    debug!(
        queue = reply_to,
        correlation_id = ?properties.correlation_id,
        "publishing reply"
    );
    Ok(channel.publish(reply_to, &content, properties).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryBroker;
    use crate::transport::{ConsumeOptions, Fault, OpensChannels, QueueOptions};

    fn inbound(reply_to: Option<&str>, correlation_id: Option<&str>) -> Message {
        Message {
            properties: MessageProperties {
                reply_to: reply_to.map(str::to_string),
                correlation_id: correlation_id.map(str::to_string),
                content_type: None,
            },
            content: b"{\"a\":10,\"b\":20}".to_vec(),
        }
    }

    #[tokio::test]
    async fn publishes_to_reply_to_with_the_inbound_correlation_id() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        channel
            .declare_queue("replies", QueueOptions::default())
            .await
            .unwrap();
        let mut deliveries = channel
            .consume("replies", ConsumeOptions { no_ack: true })
            .await
            .unwrap();

        let flushed = reply(
            channel.as_ref(),
            &inbound(Some("replies"), Some("c1")),
            "ok",
            ReplyOptions::default(),
        )
        .await
        .unwrap();
        assert!(flushed);

        let response = deliveries.recv().await.unwrap().unwrap();
        assert_eq!(response.content, b"ok");
        assert_eq!(response.properties.correlation_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn inbound_correlation_id_overrides_caller_properties() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        channel
            .declare_queue("replies", QueueOptions::default())
            .await
            .unwrap();
        let mut deliveries = channel
            .consume("replies", ConsumeOptions { no_ack: true })
            .await
            .unwrap();

        let options = ReplyOptions {
            properties: MessageProperties {
                correlation_id: Some("stale".into()),
                content_type: Some("application/json".into()),
                reply_to: None,
            },
            ensure_queue: false,
        };
        reply(
            channel.as_ref(),
            &inbound(Some("replies"), Some("c1")),
            "200",
            options,
        )
        .await
        .unwrap();

        let response = deliveries.recv().await.unwrap().unwrap();
        assert_eq!(response.properties.correlation_id.as_deref(), Some("c1"));
        assert_eq!(
            response.properties.content_type.as_deref(),
            Some("application/json")
        );
    }

    #[tokio::test]
    async fn missing_correlation_id_publishes_untagged() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        channel
            .declare_queue("replies", QueueOptions::default())
            .await
            .unwrap();
        let mut deliveries = channel
            .consume("replies", ConsumeOptions { no_ack: true })
            .await
            .unwrap();

        reply(
            channel.as_ref(),
            &inbound(Some("replies"), None),
            "ok",
            ReplyOptions::default(),
        )
        .await
        .unwrap();

        let response = deliveries.recv().await.unwrap().unwrap();
        assert_eq!(response.properties.correlation_id, None);
    }

    #[tokio::test]
    async fn missing_reply_to_is_rejected_before_publishing() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();

        let error = reply(
            channel.as_ref(),
            &inbound(None, Some("c1")),
            "ok",
            ReplyOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(error, RpcError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn ensure_queue_reports_a_deleted_reply_queue() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();

        let options = ReplyOptions {
            ensure_queue: true,
            ..ReplyOptions::default()
        };
        let error = reply(
            channel.as_ref(),
            &inbound(Some("gone"), Some("c1")),
            "ok",
            options,
        )
        .await
        .unwrap_err();

        match error {
            RpcError::QueueNotFound { context, fault } => {
                assert_eq!(context.queue, "gone");
                assert_eq!(context.correlation_id.as_deref(), Some("c1"));
                assert!(fault.is_not_found());
            }
            other => panic!("expected QueueNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn other_probe_faults_propagate_unmodified() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        channel.close().await.unwrap();

        let options = ReplyOptions {
            ensure_queue: true,
            ..ReplyOptions::default()
        };
        let error = reply(
            channel.as_ref(),
            &inbound(Some("replies"), Some("c1")),
            "ok",
            options,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            error,
            RpcError::Transport(fault) if fault == Fault::channel_unusable()
        ));
    }
}
