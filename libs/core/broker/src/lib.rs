//! AMQP messaging plumbing for the patient-records service.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  try_send   ┌───────────────────┐  confirm   ┌───────────┐
//! │ Entity publishers│────────────▶│  ProducerManager  │───────────▶│           │
//! │ (MessageProducer)│             │ (one worker task) │            │ RabbitMQ  │
//! └──────────────────┘             └───────────────────┘            │           │
//!                                                                   │           │
//! ┌──────────────────┐  supervise  ┌───────────────────┐  ack/nack  │           │
//! │ ConsumerManager  │────────────▶│ Consumer (task N) │◀───────────│           │
//! └──────────────────┘             └───────────────────┘            └───────────┘
//! ```
//!
//! # Key Features
//!
//! - **Non-blocking publish**: bounded FIFO queue drained by a single worker
//! - **Recovery**: reconnect with exponential backoff, exchanges re-declared on the new
//!   connection
//! - **Ack-managed consumption**: prefetch 1, malformed messages rejected, handler
//!   failures requeued
//! - **Supervised consumers**: per-consumer tasks, panic containment, cooperative stop
//! - **Health Endpoints**: liveness/readiness probes, consumer status, Prometheus metrics
//!
//! # Example
//!
//! ```rust,ignore
//! use broker::{AmqpTransport, BrokerConfig, ProducerManager};
//! use core_config::FromEnv;
//!
//! let producer = Arc::new(ProducerManager::new(BrokerConfig::from_env()?, AmqpTransport::new));
//! producer.start_producer();
//! producer.publish("patient.updates", "patient.created.1", json!({"patient_id": 1}));
//! ```

mod amqp;
mod client;
mod config;
mod consumer;
mod envelope;
mod error;
mod health;
pub mod metrics;
mod producer;
pub mod retry;
pub mod shared;
mod shutdown;
mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use amqp::AmqpTransport;
pub use client::{BrokerClient, ClientStatus, HandlerFn, MessageHandler, PREFETCH_COUNT, StopHandle, dispatch};
pub use config::BrokerConfig;
pub use consumer::{Consumer, ConsumerFactory, ConsumerHealth, ConsumerManager, ConsumerState};
pub use envelope::{
    Disposition, ExchangeKind, MessageEnvelope, MessageProperties, PublishRequest, UNKNOWN_CORRELATION_ID, iso_now,
    iso_timestamp,
};
pub use error::{BrokerError, ErrorCategory};
pub use health::{HealthState, health_router};
pub use metrics::init_metrics;
pub use producer::{MessageProducer, ProducerManager, ProducerStats, TransportFactory};
pub use retry::{RetryPolicy, Retryable};
pub use shutdown::ShutdownSignal;
pub use transport::{Delivery, DeliveryStream, Transport};
