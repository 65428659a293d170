//! Round trips against a real RabbitMQ (needs Docker):
//!
//! ```sh
//! cargo test -p broker --test amqp_integration -- --ignored
//! ```

use broker::{
    AmqpTransport, BrokerClient, BrokerConfig, Disposition, ExchangeKind, HandlerFn, MessageEnvelope, ProducerManager,
};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::{TestDataBuilder, TestRabbitMq};

fn config(rabbit: &TestRabbitMq) -> BrokerConfig {
    BrokerConfig::new(&rabbit.amqp_url, "patient-records").with_connect_retries(3)
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_producer_publish_reaches_bound_queue() {
    let rabbit = TestRabbitMq::new().await;
    let names = TestDataBuilder::from_test_name("test_producer_publish_reaches_bound_queue");
    let exchange = names.name("exchange", "patients");
    let queue = names.name("queue", "patients");

    // Consumer side: declare and bind before anything is published.
    let mut consumer = BrokerClient::new(AmqpTransport::new(), config(&rabbit));
    assert!(consumer.connect(3).await);
    consumer.declare_exchange(&exchange, ExchangeKind::Topic).await.unwrap();
    consumer.declare_queue(&queue, &exchange, "patient.#").await.unwrap();

    let producer = Arc::new(ProducerManager::new(config(&rabbit), AmqpTransport::new));
    assert!(producer.start_producer());
    producer.declare_exchange(&exchange, ExchangeKind::Topic).await.unwrap();
    assert!(producer.publish(&exchange, "patient.created.123", json!({"patient_id": 123})));

    let received: Arc<Mutex<Vec<Value>>> = Arc::default();
    let stop = consumer.stop_handle();
    let sink = received.clone();
    consumer.consume(
        queue.as_str(),
        Arc::new(HandlerFn(move |message: Value| {
            let sink = sink.clone();
            let stop = stop.clone();
            async move {
                sink.lock().unwrap().push(message);
                stop.stop();
                Ok::<_, broker::BrokerError>(true)
            }
        })),
        false,
    );

    tokio::time::timeout(Duration::from_secs(10), consumer.start_consuming())
        .await
        .expect("message not delivered in time")
        .unwrap();

    let received = received.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    let envelope: MessageEnvelope = serde_json::from_value(received[0].clone()).unwrap();
    assert_eq!(envelope.source_service, "patient-records");
    assert_eq!(envelope.data["patient_id"], 123);

    consumer.close().await;
    assert!(producer.stop_producer(Duration::from_secs(5)).await);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_declined_message_is_redelivered() {
    let rabbit = TestRabbitMq::new().await;
    let names = TestDataBuilder::from_test_name("test_declined_message_is_redelivered");
    let exchange = names.name("exchange", "drift");
    let queue = names.name("queue", "drift");

    let mut client = BrokerClient::new(AmqpTransport::new(), config(&rabbit));
    assert!(client.connect(3).await);
    client.declare_exchange(&exchange, ExchangeKind::Topic).await.unwrap();
    client.declare_queue(&queue, &exchange, "#").await.unwrap();
    assert!(client.publish(&exchange, "drift", json!({"record_type": "patient"}), 3).await);

    let outcomes: Arc<Mutex<Vec<Disposition>>> = Arc::default();
    let stop = client.stop_handle();
    let seen = outcomes.clone();
    client.consume(
        queue.as_str(),
        Arc::new(HandlerFn(move |_: Value| {
            let seen = seen.clone();
            let stop = stop.clone();
            async move {
                let mut seen = seen.lock().unwrap();
                // Decline the first delivery, accept the redelivery.
                let accept = !seen.is_empty();
                seen.push(Disposition::from(accept));
                if accept {
                    stop.stop();
                }
                Ok::<_, broker::BrokerError>(accept)
            }
        })),
        false,
    );

    tokio::time::timeout(Duration::from_secs(10), client.start_consuming())
        .await
        .expect("message not redelivered in time")
        .unwrap();

    assert_eq!(
        *outcomes.lock().unwrap(),
        vec![Disposition::Requeue, Disposition::Ack]
    );
    client.close().await;
}
