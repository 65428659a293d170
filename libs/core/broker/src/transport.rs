//! Transport abstraction
//!
//! `BrokerClient` talks to the broker only through [`Transport`], which keeps the
//! retry/ack logic testable without a running broker. [`crate::amqp::AmqpTransport`]
//! is the production implementation.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::BrokerConfig;
use crate::envelope::{Disposition, ExchangeKind, MessageProperties};
use crate::error::BrokerError;

/// Stream of deliveries for one subscription. Ends when the broker cancels the consumer
/// or the connection goes away.
pub type DeliveryStream = BoxStream<'static, Result<Box<dyn Delivery>, BrokerError>>;

/// One physical connection plus channel.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Open connection and channel, with publisher confirms enabled.
    async fn open(&mut self, config: &BrokerConfig) -> Result<(), BrokerError>;

    /// Whether both connection and channel are currently usable.
    fn is_open(&self) -> bool;

    async fn declare_exchange(&mut self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    async fn declare_queue(&mut self, name: &str) -> Result<(), BrokerError>;

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError>;

    /// Publish and wait for the broker's confirm. A negative confirm is an error.
    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError>;

    /// Cheap round trip proving the connection is alive.
    async fn heartbeat(&mut self) -> Result<(), BrokerError>;

    /// Start a consumer on `queue` with the given prefetch.
    async fn subscribe(&mut self, queue: &str, prefetch: u16, auto_ack: bool) -> Result<DeliveryStream, BrokerError>;

    /// Close channel, then connection. Closing a closed transport is not an error.
    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// A received message awaiting settlement.
#[async_trait]
pub trait Delivery: Send {
    fn body(&self) -> &[u8];

    fn routing_key(&self) -> &str;

    fn redelivered(&self) -> bool;

    async fn settle(self: Box<Self>, disposition: Disposition) -> Result<(), BrokerError>;
}
