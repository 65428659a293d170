//! Wire types: the message envelope, publish requests and per-message properties.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use uuid::Uuid;

/// Correlation id used when the payload carries none.
pub const UNKNOWN_CORRELATION_ID: &str = "unknown";

/// Body of every published message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// ISO-8601 UTC time the envelope was built
    pub timestamp: String,
    pub source_service: String,
    /// Caller payload, untouched
    pub data: Value,
}

impl MessageEnvelope {
    pub fn wrap(source_service: impl Into<String>, data: Value) -> Self {
        Self {
            timestamp: iso_now(),
            source_service: source_service.into(),
            data,
        }
    }

    /// `data.correlation_id` when it is a non-empty string.
    pub fn correlation_id(&self) -> Option<&str> {
        self.data
            .get("correlation_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// AMQP basic properties applied to each publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub persistent: bool,
    pub content_type: &'static str,
    pub correlation_id: String,
    pub message_id: String,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
}

impl MessageProperties {
    pub fn for_envelope(envelope: &MessageEnvelope) -> Self {
        Self {
            persistent: true,
            content_type: "application/json",
            correlation_id: envelope
                .correlation_id()
                .unwrap_or(UNKNOWN_CORRELATION_ID)
                .to_string(),
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().timestamp().max(0) as u64,
        }
    }
}

/// A message waiting in the producer's queue.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub exchange: String,
    pub routing_key: String,
    pub message: Value,
    pub enqueued_at: Instant,
}

impl PublishRequest {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, message: Value) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            message,
            enqueued_at: Instant::now(),
        }
    }
}

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Disposition {
    /// Processed; remove from the queue
    Ack,
    /// Not processed; put back for redelivery
    Requeue,
    /// Unprocessable; drop without requeue
    Reject,
}

impl From<bool> for Disposition {
    fn from(success: bool) -> Self {
        if success { Disposition::Ack } else { Disposition::Requeue }
    }
}

/// Exchange types supported for declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Topic,
    Direct,
    Fanout,
    Headers,
}

/// Current UTC time as an ISO-8601 string with microsecond precision.
pub fn iso_now() -> String {
    iso_timestamp(Utc::now())
}

pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
