//! End-to-end request/reply flows over the in-memory transport.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use amqp_rpc::transport::memory::MemoryBroker;
use amqp_rpc::{
    check_queue, check_reply_queue, reply, request, ConsumeOptions, Message, MessageChannel,
    MessageProperties, OpensChannels, QueueOptions, ReplyOptions, RequestOptions, RpcError,
};

#[derive(Debug, Serialize, Deserialize)]
struct MathRequest {
    a: i64,
    b: i64,
}

/// A long-lived responder multiplying `a * b`, in the shape a real worker
/// process would have: one channel, one consume loop, replies through the
/// public API.
async fn run_multiply_responder(broker: MemoryBroker) {
    let channel = broker
        .open_channel()
        .await
        .expect("responder channel should open");
    let mut deliveries = channel
        .consume("multiply-queue", ConsumeOptions { no_ack: true })
        .await
        .expect("responder should consume the request queue");

    while let Some(Some(inbound)) = deliveries.recv().await {
        let math: MathRequest = inbound.decode().expect("request payload should be json");
        let product = (math.a * math.b).to_string();
        reply(channel.as_ref(), &inbound, product, ReplyOptions::default())
            .await
            .expect("reply should publish");
    }
}

async fn broker_with_multiply_responder() -> MemoryBroker {
    let broker = MemoryBroker::new();
    let channel = broker.open_channel().await.unwrap();
    channel
        .declare_queue("multiply-queue", QueueOptions::default())
        .await
        .unwrap();
    channel.close().await.unwrap();
    tokio::spawn(run_multiply_responder(broker.clone()));
    broker
}

#[tokio::test]
async fn rpc_round_trip() {
    let broker = broker_with_multiply_responder().await;

    let content = serde_json::to_vec(&MathRequest { a: 10, b: 20 }).unwrap();
    let response = request(&broker, "multiply-queue", content, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&response.content), "200");
}

#[tokio::test]
async fn sequential_requests_each_get_their_own_reply() {
    let broker = broker_with_multiply_responder().await;

    for (a, b) in [(2, 3), (7, 8), (0, 9)] {
        let content = serde_json::to_vec(&MathRequest { a, b }).unwrap();
        let response = request(&broker, "multiply-queue", content, RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(
            String::from_utf8_lossy(&response.content),
            (a * b).to_string()
        );
    }

    // every exchange cleaned up its reply queue
    assert_eq!(broker.queue_names(), vec!["multiply-queue".to_string()]);
}

#[tokio::test]
async fn concurrent_requests_do_not_cross_correlate() {
    let broker = broker_with_multiply_responder().await;

    let mut handles = Vec::new();
    for a in 1..=5i64 {
        let broker = broker.clone();
        handles.push(tokio::spawn(async move {
            let content = serde_json::to_vec(&MathRequest { a, b: 11 }).unwrap();
            let response =
                request(&broker, "multiply-queue", content, RequestOptions::default())
                    .await
                    .unwrap();
            (a, String::from_utf8_lossy(&response.content).to_string())
        }));
    }

    for handle in handles {
        let (a, product) = handle.await.unwrap();
        assert_eq!(product, (a * 11).to_string());
    }
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out() {
    let broker = MemoryBroker::new();
    let error = request(
        &broker,
        "missing-queue",
        "x",
        RequestOptions::timeout(Duration::from_millis(50)),
    )
    .await
    .unwrap_err();
    assert!(matches!(error, RpcError::Timeout { .. }));
}

#[tokio::test]
async fn existence_checks_cover_both_directions() {
    let broker = broker_with_multiply_responder().await;

    assert!(check_queue(&broker, "multiply-queue").await.unwrap());
    assert!(!check_queue(&broker, "nonexistent").await.unwrap());

    let inbound = Message {
        properties: MessageProperties {
            reply_to: Some("multiply-queue".into()),
            ..MessageProperties::default()
        },
        content: Vec::new(),
    };
    assert!(check_reply_queue(&broker, &inbound).await.unwrap());
}
