//! Broker client: one connection + channel with reconnect, confirmed publish and
//! ack-managed consumption.

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::envelope::{Disposition, ExchangeKind, MessageEnvelope, MessageProperties};
use crate::error::BrokerError;
use crate::metrics;
use crate::retry::{RetryPolicy, retry_with_state};
use crate::transport::{Delivery, Transport};

/// Unacked deliveries held by one consumer at a time.
pub const PREFETCH_COUNT: u16 = 1;

/// Processes one decoded message and decides how it is settled.
///
/// `Err` is treated like [`Disposition::Requeue`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Value) -> Result<Disposition, BrokerError>;
}

/// Adapts an async closure returning `bool` (true = ack, false = requeue).
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, BrokerError>> + Send,
{
    async fn handle(&self, message: Value) -> Result<Disposition, BrokerError> {
        (self.0)(message).await.map(Disposition::from)
    }
}

/// Decode a raw body and run the handler on it.
///
/// Malformed JSON is rejected without reaching the handler; handler errors requeue.
pub async fn dispatch(handler: &dyn MessageHandler, body: &[u8]) -> Disposition {
    let message: Value = match serde_json::from_slice(body) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, bytes = body.len(), "Rejecting malformed message");
            return Disposition::Reject;
        }
    };

    match handler.handle(message).await {
        Ok(disposition) => disposition,
        Err(e) => {
            error!(error = %e, "Message handler failed, requeueing");
            Disposition::Requeue
        }
    }
}

/// Connection/consumption flags readable without holding the client.
#[derive(Debug, Default)]
pub struct ClientStatus {
    connected: AtomicBool,
    consuming: AtomicBool,
    generation: AtomicU64,
}

impl ClientStatus {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_consuming(&self) -> bool {
        self.consuming.load(Ordering::SeqCst)
    }

    /// Number of successful connects so far; changes whenever the connection is replaced.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Cloneable handle that ends a client's consume loop from anywhere.
#[derive(Clone, Debug)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Idempotent; safe when the client is not consuming.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

#[derive(Clone)]
struct Subscription {
    queue: String,
    handler: Arc<dyn MessageHandler>,
    auto_ack: bool,
}

/// A fully prepared publish, shared across retry attempts.
struct Outgoing {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
}

pub struct BrokerClient<T: Transport> {
    transport: T,
    config: BrokerConfig,
    status: Arc<ClientStatus>,
    subscription: Option<Subscription>,
    stop: StopHandle,
}

impl<T: Transport> BrokerClient<T> {
    pub fn new(transport: T, config: BrokerConfig) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            transport,
            config,
            status: Arc::new(ClientStatus::default()),
            subscription: None,
            stop: StopHandle { tx: Arc::new(tx) },
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn status(&self) -> Arc<ClientStatus> {
        self.status.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected() && self.transport.is_open()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Connect with up to `max_retries` attempts, backing off 1s, 2s, 4s ... between them.
    pub async fn connect(&mut self, max_retries: u32) -> bool {
        let policy = RetryPolicy::exponential(max_retries, self.config.connect_backoff);
        self.connect_with(&policy).await
    }

    /// Connect using an explicit policy (the producer's recovery uses a longer one).
    pub async fn connect_with(&mut self, policy: &RetryPolicy) -> bool {
        let max_attempts = policy.max_attempts;
        let result = retry_with_state(self, policy, |client, attempt| {
            client.open_once(attempt, max_attempts).boxed()
        })
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, attempts = max_attempts, url = %self.config.redacted_url(), "Could not connect to broker");
                false
            }
        }
    }

    async fn open_once(&mut self, attempt: u32, max_attempts: u32) -> Result<(), BrokerError> {
        self.status.connected.store(false, Ordering::SeqCst);
        match self.transport.open(&self.config).await {
            Ok(()) => {
                self.status.connected.store(true, Ordering::SeqCst);
                self.status.generation.fetch_add(1, Ordering::SeqCst);
                metrics::broker_connected(&self.config.source_service);
                Ok(())
            }
            Err(e) => {
                warn!(attempt, max_attempts, error = %e, "Connection attempt failed");
                Err(e)
            }
        }
    }

    /// Reconnect if the connection is gone. No-op while connected.
    pub async fn ensure_connection(&mut self) -> Result<(), BrokerError> {
        if self.is_connected() {
            return Ok(());
        }

        if self.status.is_connected() {
            info!("Broker connection lost, reconnecting");
        }
        self.status.connected.store(false, Ordering::SeqCst);

        if self.connect(self.config.connect_retries).await {
            Ok(())
        } else {
            Err(BrokerError::Connection(
                "Failed to re-establish broker connection".to_string(),
            ))
        }
    }

    pub async fn declare_exchange(&mut self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.ensure_connection().await?;
        self.transport.declare_exchange(name, kind).await
    }

    /// Declare a durable queue and bind it to `exchange` with `routing_key`.
    pub async fn declare_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.ensure_connection().await?;
        self.transport.declare_queue(queue).await?;
        self.transport.bind_queue(queue, exchange, routing_key).await
    }

    pub async fn heartbeat(&mut self) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::Connection("not connected".to_string()));
        }
        self.transport.heartbeat().await
    }

    /// Wrap `message` in the envelope and publish it with confirms.
    ///
    /// Makes up to `max_retries` attempts with a fixed pause between them, checking the
    /// connection before each. Returns false once every attempt failed; never errors.
    pub async fn publish(&mut self, exchange: &str, routing_key: &str, message: Value, max_retries: u32) -> bool {
        let envelope = MessageEnvelope::wrap(self.config.source_service.clone(), message);
        let body = match envelope.to_bytes() {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, exchange, routing_key, "Failed to serialize message");
                return false;
            }
        };

        let outgoing = Arc::new(Outgoing {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            properties: MessageProperties::for_envelope(&envelope),
        });

        let policy = RetryPolicy::fixed(max_retries, self.config.publish_retry_delay);
        let result = retry_with_state(self, &policy, move |client, attempt| {
            client.publish_once(outgoing.clone(), attempt, max_retries).boxed()
        })
        .await;

        match result {
            Ok(()) => {
                debug!(exchange, routing_key, "Published message");
                true
            }
            Err(e) => {
                error!(exchange, routing_key, attempts = max_retries, error = %e, "Giving up on message");
                false
            }
        }
    }

    async fn publish_once(&mut self, outgoing: Arc<Outgoing>, attempt: u32, max_attempts: u32) -> Result<(), BrokerError> {
        let result = match self.ensure_connection().await {
            Ok(()) => {
                self.transport
                    .publish(
                        &outgoing.exchange,
                        &outgoing.routing_key,
                        &outgoing.body,
                        &outgoing.properties,
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!(
                attempt,
                max_attempts,
                exchange = %outgoing.exchange,
                routing_key = %outgoing.routing_key,
                error = %e,
                "Publish attempt failed"
            );
        }
        result
    }

    /// Register `handler` for `queue`. Consumption starts with [`Self::start_consuming`].
    pub fn consume(&mut self, queue: impl Into<String>, handler: Arc<dyn MessageHandler>, auto_ack: bool) {
        self.subscription = Some(Subscription {
            queue: queue.into(),
            handler,
            auto_ack,
        });
    }

    /// Deliver messages to the registered handler until stopped or the stream ends.
    ///
    /// Returns `Ok` after [`Self::stop_consuming`] (or a [`StopHandle`]); a stop requested
    /// before this is called is honoured and returns immediately. A lost connection is
    /// reported as an error.
    pub async fn start_consuming(&mut self) -> Result<(), BrokerError> {
        let subscription = self.subscription.clone().ok_or_else(|| {
            BrokerError::Channel("no handler registered, call consume() first".to_string())
        })?;

        let mut stop_rx = self.stop.tx.subscribe();
        if *stop_rx.borrow() {
            debug!(queue = %subscription.queue, "Stop already requested, not consuming");
            return Ok(());
        }

        self.ensure_connection().await?;
        let mut deliveries = self
            .transport
            .subscribe(&subscription.queue, PREFETCH_COUNT, subscription.auto_ack)
            .await?;

        self.status.consuming.store(true, Ordering::SeqCst);
        info!(queue = %subscription.queue, "Consuming");

        let result = loop {
            tokio::select! {
                biased;
                // The watch::Ref must not outlive the arm or the loop stops being Send.
                _ = async { let _ = stop_rx.wait_for(|stopped| *stopped).await; } => {
                    info!(queue = %subscription.queue, "Stop requested, leaving consume loop");
                    break Ok(());
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => handle_delivery(delivery, &subscription).await,
                    Some(Err(e)) => break Err(e),
                    None => {
                        break Err(BrokerError::Connection(format!(
                            "Delivery stream for {} ended",
                            subscription.queue
                        )));
                    }
                },
            }
        };

        self.status.consuming.store(false, Ordering::SeqCst);
        result
    }

    /// Idempotent; safe when not consuming.
    pub fn stop_consuming(&self) {
        self.stop.stop();
    }

    /// Close channel then connection. Errors are logged, never returned.
    pub async fn close(&mut self) {
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Error while closing broker connection");
        }
        self.status.connected.store(false, Ordering::SeqCst);
        self.status.consuming.store(false, Ordering::SeqCst);
    }
}

async fn handle_delivery(delivery: Box<dyn Delivery>, subscription: &Subscription) {
    let disposition = dispatch(subscription.handler.as_ref(), delivery.body()).await;
    metrics::delivery_settled(&subscription.queue, disposition);

    if subscription.auto_ack {
        return;
    }

    debug!(
        queue = %subscription.queue,
        routing_key = %delivery.routing_key(),
        redelivered = delivery.redelivered(),
        %disposition,
        "Settling delivery"
    );
    if let Err(e) = delivery.settle(disposition).await {
        warn!(queue = %subscription.queue, error = %e, "Failed to settle delivery");
    }
}
