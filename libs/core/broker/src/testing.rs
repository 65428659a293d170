//! Test doubles
//!
//! - [`MemoryBroker`]: in-process stand-in for RabbitMQ. Hands out [`MemoryTransport`]s
//!   that share its state, records every call, and can be told to fail.
//! - [`RecordingProducer`]: a [`MessageProducer`] that just remembers what it was given.
//!
//! Available to this crate's tests and, with the `testing` feature, to downstream crates.

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::BrokerConfig;
use crate::envelope::{Disposition, ExchangeKind, MessageEnvelope, MessageProperties};
use crate::error::BrokerError;
use crate::producer::MessageProducer;
use crate::transport::{Delivery, DeliveryStream, Transport};

/// A message the memory broker accepted.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub envelope: MessageEnvelope,
    pub properties: MessageProperties,
}

#[derive(Default)]
struct BrokerState {
    open: bool,
    open_attempts: u32,
    fail_opens: u32,
    publish_attempts: u32,
    fail_publishes: u32,
    heartbeats: u32,
    fail_heartbeats: u32,
    fail_declares: u32,
    closes: u32,
    published: Vec<PublishedMessage>,
    exchanges: Vec<(String, ExchangeKind)>,
    queues: Vec<String>,
    bindings: Vec<(String, String, String)>,
    prefetch: Option<u16>,
    pending_deliveries: VecDeque<Vec<u8>>,
    delivery_tx: Option<mpsc::UnboundedSender<Box<dyn Delivery>>>,
    deliveries_closed: bool,
    settlements: Vec<Disposition>,
}

/// Shared in-memory broker. Cloning yields another handle to the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
        }
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.state().fail_opens = count;
    }

    pub fn fail_next_publishes(&self, count: u32) {
        self.state().fail_publishes = count;
    }

    pub fn fail_next_heartbeats(&self, count: u32) {
        self.state().fail_heartbeats = count;
    }

    /// Refuse the next `count` exchange declarations; the connection stays open.
    pub fn fail_next_declares(&self, count: u32) {
        self.state().fail_declares = count;
    }

    /// Drop every open connection, as a broker restart would.
    pub fn sever(&self) {
        self.state().open = false;
    }

    pub fn open_attempts(&self) -> u32 {
        self.state().open_attempts
    }

    pub fn publish_attempts(&self) -> u32 {
        self.state().publish_attempts
    }

    pub fn heartbeats(&self) -> u32 {
        self.state().heartbeats
    }

    pub fn closes(&self) -> u32 {
        self.state().closes
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn declared_exchanges(&self) -> Vec<(String, ExchangeKind)> {
        self.state().exchanges.clone()
    }

    pub fn declared_queues(&self) -> Vec<String> {
        self.state().queues.clone()
    }

    /// `(queue, exchange, routing_key)` triples.
    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.state().bindings.clone()
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.state().prefetch
    }

    /// Queue a raw body for the (current or next) subscriber.
    pub fn push_delivery(&self, body: Vec<u8>) {
        let mut state = self.state();
        match &state.delivery_tx {
            Some(tx) => {
                let delivery = self.delivery(body);
                if tx.send(delivery).is_err() {
                    state.delivery_tx = None;
                }
            }
            None => state.pending_deliveries.push_back(body),
        }
    }

    /// End the delivery stream once queued deliveries are consumed.
    pub fn close_deliveries(&self) {
        let mut state = self.state();
        state.deliveries_closed = true;
        state.delivery_tx = None;
    }

    /// Dispositions in settlement order.
    pub fn settlements(&self) -> Vec<Disposition> {
        self.state().settlements.clone()
    }

    fn delivery(&self, body: Vec<u8>) -> Box<dyn Delivery> {
        Box::new(MemoryDelivery {
            body,
            routing_key: "memory".to_string(),
            broker: self.clone(),
        })
    }
}

pub struct MemoryTransport {
    broker: MemoryBroker,
}

impl MemoryTransport {
    fn require_open(&self) -> Result<(), BrokerError> {
        if self.broker.state().open {
            Ok(())
        } else {
            Err(BrokerError::Channel("memory transport is closed".to_string()))
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&mut self, _config: &BrokerConfig) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.open_attempts += 1;
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(BrokerError::Connection("connection refused".to_string()));
        }
        state.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.state().open
    }

    async fn declare_exchange(&mut self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.require_open()?;
        let mut state = self.broker.state();
        if state.fail_declares > 0 {
            state.fail_declares -= 1;
            return Err(BrokerError::Topology(format!("cannot declare {}", name)));
        }
        state.exchanges.push((name.to_string(), kind));
        Ok(())
    }

    async fn declare_queue(&mut self, name: &str) -> Result<(), BrokerError> {
        self.require_open()?;
        self.broker.state().queues.push(name.to_string());
        Ok(())
    }

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.require_open()?;
        self.broker
            .state()
            .bindings
            .push((queue.to_string(), exchange.to_string(), routing_key.to_string()));
        Ok(())
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        self.require_open()?;
        let envelope: MessageEnvelope = serde_json::from_slice(body)?;

        let mut state = self.broker.state();
        state.publish_attempts += 1;
        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(BrokerError::Publish("nacked".to_string()));
        }
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            envelope,
            properties: properties.clone(),
        });
        Ok(())
    }

    async fn heartbeat(&mut self) -> Result<(), BrokerError> {
        self.require_open()?;
        let mut state = self.broker.state();
        if state.fail_heartbeats > 0 {
            state.fail_heartbeats -= 1;
            return Err(BrokerError::Connection("heartbeat timed out".to_string()));
        }
        state.heartbeats += 1;
        Ok(())
    }

    async fn subscribe(&mut self, _queue: &str, prefetch: u16, _auto_ack: bool) -> Result<DeliveryStream, BrokerError> {
        self.require_open()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.broker.state();
        state.prefetch = Some(prefetch);
        while let Some(body) = state.pending_deliveries.pop_front() {
            let _ = tx.send(self.broker.delivery(body));
        }
        if !state.deliveries_closed {
            state.delivery_tx = Some(tx);
        }
        drop(state);

        let deliveries = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        });
        Ok(Box::pin(deliveries))
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.closes += 1;
        state.open = false;
        Ok(())
    }
}

struct MemoryDelivery {
    body: Vec<u8>,
    routing_key: String,
    broker: MemoryBroker,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn routing_key(&self) -> &str {
        &self.routing_key
    }

    fn redelivered(&self) -> bool {
        false
    }

    async fn settle(self: Box<Self>, disposition: Disposition) -> Result<(), BrokerError> {
        self.broker.state().settlements.push(disposition);
        Ok(())
    }
}

/// A publish handed to [`RecordingProducer`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPublish {
    pub exchange: String,
    pub routing_key: String,
    pub message: Value,
}

/// Producer double: accepts (or refuses) everything and remembers it.
#[derive(Default)]
pub struct RecordingProducer {
    published: Mutex<Vec<RecordedPublish>>,
    declared: Mutex<Vec<(String, ExchangeKind)>>,
    refuse: AtomicBool,
    fail_declares: AtomicBool,
}

impl RecordingProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `publish` return false, as a full queue or stopped producer would.
    pub fn refuse_publishes(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_declares(&self, fail: bool) {
        self.fail_declares.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<RecordedPublish> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn declared(&self) -> Vec<(String, ExchangeKind)> {
        self.declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MessageProducer for RecordingProducer {
    fn publish(&self, exchange: &str, routing_key: &str, message: Value) -> bool {
        if self.refuse.load(Ordering::SeqCst) {
            return false;
        }
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedPublish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                message,
            });
        true
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        if self.fail_declares.load(Ordering::SeqCst) {
            return Err(BrokerError::Topology(format!("cannot declare {}", name)));
        }
        self.declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), kind));
        Ok(())
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn eventually(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
