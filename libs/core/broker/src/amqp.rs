//! AMQP (RabbitMQ) transport built on lapin.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    message::Delivery as LapinDelivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString, ShortString},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::envelope::{Disposition, ExchangeKind, MessageProperties};
use crate::error::BrokerError;
use crate::transport::{Delivery, DeliveryStream, Transport};

/// Always present on RabbitMQ; a passive declare of it is the heartbeat round trip.
const HEARTBEAT_EXCHANGE: &str = "amq.topic";

const REPLY_SUCCESS: u16 = 200;

#[derive(Default)]
pub struct AmqpTransport {
    connection: Option<Connection>,
    channel: Option<Channel>,
}

impl AmqpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self) -> Result<&Channel, BrokerError> {
        self.channel
            .as_ref()
            .filter(|channel| channel.status().connected())
            .ok_or_else(|| BrokerError::Channel("channel is not open".to_string()))
    }
}

fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(ShortString::from(properties.content_type))
        .with_delivery_mode(if properties.persistent { 2 } else { 1 })
        .with_correlation_id(ShortString::from(properties.correlation_id.clone()))
        .with_message_id(ShortString::from(properties.message_id.clone()))
        .with_timestamp(properties.timestamp)
}

/// Connection shows up under the service name in the management UI.
fn connection_properties(config: &BrokerConfig) -> ConnectionProperties {
    ConnectionProperties::default().with_connection_name(LongString::from(config.source_service.clone()))
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn open(&mut self, config: &BrokerConfig) -> Result<(), BrokerError> {
        if self.connection.is_some() {
            let _ = self.close().await;
        }

        let connection = Connection::connect(&config.connection_uri(), connection_properties(config))
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to connect: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to create channel: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to enable publisher confirms: {}", e)))?;

        info!(url = %config.redacted_url(), "Connected to AMQP");

        self.connection = Some(connection);
        self.channel = Some(channel);
        Ok(())
    }

    fn is_open(&self) -> bool {
        let connection_open = self
            .connection
            .as_ref()
            .is_some_and(|c| c.status().connected());
        let channel_open = self
            .channel
            .as_ref()
            .is_some_and(|c| c.status().connected());
        connection_open && channel_open
    }

    async fn declare_exchange(&mut self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.channel()?
            .exchange_declare(
                name,
                lapin_kind(kind),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to declare exchange {}: {}", name, e)))?;

        debug!(exchange = %name, kind = %kind, "Declared exchange");
        Ok(())
    }

    async fn declare_queue(&mut self, name: &str) -> Result<(), BrokerError> {
        self.channel()?
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to declare queue {}: {}", name, e)))?;

        debug!(queue = %name, "Declared queue");
        Ok(())
    }

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.channel()?
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to bind queue {}: {}", queue, e)))?;

        info!(queue = %queue, exchange = %exchange, routing_key = %routing_key, "Bound queue to exchange");
        Ok(())
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        let confirm = self
            .channel()?
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                basic_properties(properties),
            )
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish: {}", e)))?;

        match confirm
            .await
            .map_err(|e| BrokerError::Publish(format!("Publish confirmation failed: {}", e)))?
        {
            Confirmation::Nack(_) => Err(BrokerError::Publish(format!(
                "Broker nacked message for {}/{}",
                exchange, routing_key
            ))),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        }
    }

    async fn heartbeat(&mut self) -> Result<(), BrokerError> {
        self.channel()?
            .exchange_declare(
                HEARTBEAT_EXCHANGE,
                lapin::ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    passive: true,
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connection(format!("Heartbeat failed: {}", e)))
    }

    async fn subscribe(&mut self, queue: &str, prefetch: u16, auto_ack: bool) -> Result<DeliveryStream, BrokerError> {
        let channel = self.channel()?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to set prefetch: {}", e)))?;

        let tag = format!("{}-{}", queue, Uuid::new_v4().simple());
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to start consumer: {}", e)))?;

        info!(queue = %queue, consumer_tag = %tag, prefetch, "Subscribed to queue");

        let stream = consumer.map(|delivery| {
            delivery
                .map(|inner| Box::new(AmqpDelivery { inner }) as Box<dyn Delivery>)
                .map_err(BrokerError::from)
        });
        Ok(stream.boxed())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        let mut first_error = None;

        if let Some(channel) = self.channel.take() {
            if channel.status().connected() {
                if let Err(e) = channel.close(REPLY_SUCCESS, "closing").await {
                    warn!(error = %e, "Error closing channel");
                    first_error.get_or_insert(BrokerError::from(e));
                }
            }
        }

        if let Some(connection) = self.connection.take() {
            if connection.status().connected() {
                if let Err(e) = connection.close(REPLY_SUCCESS, "closing").await {
                    warn!(error = %e, "Error closing connection");
                    first_error.get_or_insert(BrokerError::from(e));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct AmqpDelivery {
    inner: LapinDelivery,
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.inner.data
    }

    fn routing_key(&self) -> &str {
        self.inner.routing_key.as_str()
    }

    fn redelivered(&self) -> bool {
        self.inner.redelivered
    }

    async fn settle(self: Box<Self>, disposition: Disposition) -> Result<(), BrokerError> {
        let acker = &self.inner.acker;
        let result = match disposition {
            Disposition::Ack => acker.ack(BasicAckOptions::default()).await,
            Disposition::Requeue => {
                acker
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
            }
            Disposition::Reject => acker.reject(BasicRejectOptions { requeue: false }).await,
        };
        result.map_err(|e| BrokerError::Channel(format!("Failed to {} delivery: {}", disposition, e)))
    }
}
