//! Process-wide producer for callers without an application context.
//!
//! Prefer constructing a [`ProducerManager`] at startup and passing it down; this exists
//! for code paths that cannot be handed one.

use core_config::FromEnv;
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use crate::amqp::AmqpTransport;
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::producer::ProducerManager;

pub type SharedProducer = Arc<ProducerManager<AmqpTransport>>;

static SHARED: Lazy<Mutex<Option<SharedProducer>>> = Lazy::new(|| Mutex::new(None));

/// The shared producer, built from the environment and started on first use.
///
/// A producer that stopped on its own (unrecoverable connection loss) is restarted.
pub async fn producer() -> Result<SharedProducer, BrokerError> {
    let mut slot = SHARED.lock().await;

    if let Some(producer) = slot.as_ref() {
        if !producer.is_running() {
            info!("Restarting shared producer");
            producer.start_producer();
        }
        return Ok(producer.clone());
    }

    let config = BrokerConfig::from_env()?;
    let producer = Arc::new(ProducerManager::new(config, AmqpTransport::new));
    producer.start_producer();
    *slot = Some(producer.clone());
    Ok(producer)
}

/// Stop and forget the shared producer. True when there was none or it stopped in time.
pub async fn shutdown(timeout: Duration) -> bool {
    let producer = SHARED.lock().await.take();
    match producer {
        Some(producer) => producer.stop_producer(timeout).await,
        None => true,
    }
}
