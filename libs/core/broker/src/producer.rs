//! Producer manager
//!
//! Callers enqueue publish requests without blocking; a single worker task owns the
//! broker connection and drains the queue in FIFO order:
//!
//! ```text
//! publish() ──try_send──▶ [bounded queue] ──▶ worker ──▶ BrokerClient::publish ──▶ broker
//!                                               │
//!                                               ├─ declares exchanges on demand
//!                                               ├─ heartbeats when idle
//!                                               └─ reconnects + re-declares on errors
//! ```

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::BrokerClient;
use crate::config::BrokerConfig;
use crate::envelope::{ExchangeKind, PublishRequest};
use crate::error::BrokerError;
use crate::metrics;
use crate::retry::RetryPolicy;
use crate::transport::Transport;

/// Anything that accepts messages for asynchronous delivery.
///
/// Entity publishers depend on this rather than on a concrete manager.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    /// Enqueue without blocking. False when the message was not accepted.
    fn publish(&self, exchange: &str, routing_key: &str, message: Value) -> bool;

    /// Declare an exchange on the producer's connection.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;
}

/// Builds a fresh transport for the worker.
pub type TransportFactory<T> = Arc<dyn Fn() -> T + Send + Sync>;

type ExchangeRegistry = Arc<RwLock<BTreeMap<String, ExchangeKind>>>;

enum Control {
    Declare {
        name: String,
        kind: ExchangeKind,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
}

struct WorkerHandle {
    queue: mpsc::Sender<PublishRequest>,
    control: mpsc::Sender<Control>,
    join: JoinHandle<()>,
}

/// Point-in-time view for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ProducerStats {
    pub running: bool,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub exchanges: Vec<String>,
}

pub struct ProducerManager<T: Transport> {
    config: BrokerConfig,
    factory: TransportFactory<T>,
    running: Arc<AtomicBool>,
    exchanges: ExchangeRegistry,
    worker: RwLock<Option<WorkerHandle>>,
}

impl<T: Transport> ProducerManager<T> {
    pub fn new(config: BrokerConfig, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            config,
            factory: Arc::new(factory),
            running: Arc::new(AtomicBool::new(false)),
            exchanges: Arc::new(RwLock::new(BTreeMap::new())),
            worker: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the worker. Returns false (and does nothing) when already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_producer(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Producer already running");
            return false;
        }

        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity);
        let (control_tx, control_rx) = mpsc::channel(16);

        let worker = ProducerWorker {
            client: BrokerClient::new((self.factory)(), self.config.clone()),
            config: self.config.clone(),
            running: self.running.clone(),
            exchanges: self.exchanges.clone(),
            queue: queue_rx,
            control: control_rx,
            pending: None,
            synced_generation: 0,
            last_activity: Instant::now(),
        };
        let join = tokio::spawn(worker.run());

        *self.worker.write().unwrap_or_else(PoisonError::into_inner) = Some(WorkerHandle {
            queue: queue_tx,
            control: control_tx,
            join,
        });

        info!(
            queue_capacity = self.config.queue_capacity,
            source_service = %self.config.source_service,
            "Producer started"
        );
        true
    }

    /// Enqueue a message. Never blocks: false when not running or the queue is full.
    pub fn publish(&self, exchange: &str, routing_key: &str, message: Value) -> bool {
        if !self.is_running() {
            debug!(exchange, routing_key, "Producer not running, message refused");
            metrics::message_refused(exchange, "not_running");
            return false;
        }

        let guard = self.worker.read().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = guard.as_ref() else {
            metrics::message_refused(exchange, "not_running");
            return false;
        };

        match handle.queue.try_send(PublishRequest::new(exchange, routing_key, message)) {
            Ok(()) => {
                metrics::message_enqueued(exchange);
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    exchange,
                    routing_key,
                    capacity = self.config.queue_capacity,
                    "Producer queue full, message refused"
                );
                metrics::message_refused(exchange, "queue_full");
                false
            }
            Err(TrySendError::Closed(_)) => {
                metrics::message_refused(exchange, "not_running");
                false
            }
        }
    }

    /// Declare an exchange through the worker and record it for re-declaration after
    /// reconnects. Declaring a known exchange is a no-op.
    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        if !self.is_running() {
            return Err(BrokerError::NotRunning);
        }

        let control = {
            let guard = self.worker.read().unwrap_or_else(PoisonError::into_inner);
            guard
                .as_ref()
                .map(|handle| handle.control.clone())
                .ok_or(BrokerError::NotRunning)?
        };

        let (reply, response) = oneshot::channel();
        control
            .send(Control::Declare {
                name: name.to_string(),
                kind,
                reply,
            })
            .await
            .map_err(|_| BrokerError::NotRunning)?;

        response.await.map_err(|_| BrokerError::NotRunning)?
    }

    /// Refuse new messages, let the worker deliver everything already queued, then close.
    ///
    /// Waits up to `timeout`. Returns false when the worker did not finish in time (it is
    /// left to finish on its own).
    pub async fn stop_producer(&self, timeout: Duration) -> bool {
        self.running.store(false, Ordering::SeqCst);

        let handle = self
            .worker
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(WorkerHandle { queue, control, join }) = handle else {
            return true;
        };
        // The worker exits once the closed queue has been emptied.
        drop(queue);
        drop(control);

        match tokio::time::timeout(timeout, join).await {
            Ok(_) => {
                info!("Producer stopped");
                true
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Producer worker did not stop in time");
                false
            }
        }
    }

    pub fn stats(&self) -> ProducerStats {
        let queue_depth = self
            .worker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|handle| handle.queue.max_capacity() - handle.queue.capacity())
            .unwrap_or(0);

        ProducerStats {
            running: self.is_running(),
            queue_depth,
            queue_capacity: self.config.queue_capacity,
            exchanges: self
                .exchanges
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .keys()
                .cloned()
                .collect(),
        }
    }
}

#[async_trait]
impl<T: Transport> MessageProducer for ProducerManager<T> {
    fn publish(&self, exchange: &str, routing_key: &str, message: Value) -> bool {
        ProducerManager::publish(self, exchange, routing_key, message)
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        ProducerManager::declare_exchange(self, name, kind).await
    }
}

/// State owned exclusively by the worker task.
struct ProducerWorker<T: Transport> {
    client: BrokerClient<T>,
    config: BrokerConfig,
    running: Arc<AtomicBool>,
    exchanges: ExchangeRegistry,
    queue: mpsc::Receiver<PublishRequest>,
    control: mpsc::Receiver<Control>,
    /// Request interrupted by a connection failure; retried first after recovery.
    pending: Option<PublishRequest>,
    /// Connection generation the registry was last declared on.
    synced_generation: u64,
    last_activity: Instant,
}

impl<T: Transport> ProducerWorker<T> {
    async fn run(mut self) {
        if !self.client.connect(self.config.connect_retries).await {
            error!("Producer could not connect to broker, stopping");
            self.running.store(false, Ordering::SeqCst);
            return;
        }
        if let Err(e) = self.sync_exchanges().await {
            warn!(error = %e, "Could not declare known exchanges on startup");
        }
        self.last_activity = Instant::now();

        // Runs until the queue is closed and empty, or recovery gives up.
        loop {
            let step = match self.pending.take() {
                Some(request) => self.deliver(request, true).await,
                None => self.next_step().await,
            };

            let step = match step {
                Ok(true) => self.heartbeat_if_idle().await,
                Ok(false) => break,
                Err(e) => Err(e),
            };

            if let Err(e) = step {
                warn!(error = %e, "Producer connection error, recovering");
                if !self.recover().await {
                    error!(
                        attempts = self.config.recovery_attempts,
                        "Producer could not recover broker connection, stopping"
                    );
                    self.running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }

        self.client.close().await;

        let undelivered = self.queue.len() + usize::from(self.pending.is_some());
        if undelivered > 0 {
            warn!(undelivered, "Producer stopped with undelivered messages");
        }
        info!("Producer worker exited");
    }

    /// Wait for a control message or a request. `Ok(false)` once every sender is gone.
    async fn next_step(&mut self) -> Result<bool, BrokerError> {
        tokio::select! {
            biased;
            Some(control) = self.control.recv() => {
                self.handle_control(control).await?;
                Ok(true)
            }
            received = tokio::time::timeout(self.config.poll_interval, self.queue.recv()) => {
                match received {
                    Ok(Some(request)) => {
                        metrics::queue_depth(self.queue.len());
                        self.deliver(request, false).await
                    }
                    Ok(None) => Ok(false),
                    Err(_) => Ok(true),
                }
            }
        }
    }

    async fn handle_control(&mut self, control: Control) -> Result<(), BrokerError> {
        match control {
            Control::Declare { name, kind, reply } => {
                let result = self.declare(&name, kind).await;
                let connection_lost = result.is_err() && !self.client.is_connected();
                let _ = reply.send(result);

                if connection_lost {
                    return Err(BrokerError::Connection(format!(
                        "Connection lost while declaring {}",
                        name
                    )));
                }
                Ok(())
            }
        }
    }

    /// `is_retry` marks a request that already failed once before a recovery; it is not
    /// kept a second time.
    async fn deliver(&mut self, request: PublishRequest, is_retry: bool) -> Result<bool, BrokerError> {
        if let Err(e) = self.prepare(&request.exchange).await {
            if is_retry {
                error!(
                    exchange = %request.exchange,
                    routing_key = %request.routing_key,
                    error = %e,
                    "Message dropped, broker still unusable after recovery"
                );
                metrics::message_published(&request.exchange, false, request.enqueued_at.elapsed());
            } else {
                self.pending = Some(request);
            }
            return Err(e);
        }

        let PublishRequest {
            exchange,
            routing_key,
            message,
            enqueued_at,
        } = request;

        let published = self
            .client
            .publish(&exchange, &routing_key, message, self.config.publish_retries)
            .await;
        metrics::message_published(&exchange, published, enqueued_at.elapsed());
        self.last_activity = Instant::now();

        if !published {
            error!(exchange = %exchange, routing_key = %routing_key, "Message dropped after publish retries");
        }
        Ok(true)
    }

    /// Connection up, registry declared on it, target exchange known.
    async fn prepare(&mut self, exchange: &str) -> Result<(), BrokerError> {
        self.client.ensure_connection().await?;
        self.sync_exchanges().await?;

        let known = self
            .exchanges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(exchange);
        if !known {
            self.declare(exchange, ExchangeKind::Topic).await?;
        }
        Ok(())
    }

    async fn declare(&mut self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let known = self
            .exchanges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied();
        if known == Some(kind) && self.client.is_connected() {
            return Ok(());
        }

        self.client.declare_exchange(name, kind).await?;
        self.exchanges
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), kind);
        info!(exchange = %name, kind = %kind, "Exchange declared");
        Ok(())
    }

    /// Re-declare every known exchange when the connection has been replaced.
    async fn sync_exchanges(&mut self) -> Result<(), BrokerError> {
        let generation = self.client.status().generation();
        if generation == self.synced_generation {
            return Ok(());
        }

        let known: Vec<(String, ExchangeKind)> = self
            .exchanges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, kind)| (name.clone(), *kind))
            .collect();

        for (name, kind) in &known {
            self.client.declare_exchange(name, *kind).await?;
        }
        if !known.is_empty() {
            info!(count = known.len(), "Re-declared exchanges on new connection");
        }

        self.synced_generation = generation;
        Ok(())
    }

    async fn heartbeat_if_idle(&mut self) -> Result<bool, BrokerError> {
        if self.last_activity.elapsed() < self.config.heartbeat_interval {
            return Ok(true);
        }
        self.client.heartbeat().await?;
        debug!("Producer heartbeat");
        self.last_activity = Instant::now();
        Ok(true)
    }

    /// Close, then reconnect with backoff (1s, 2s, 4s ... before each attempt).
    async fn recover(&mut self) -> bool {
        self.client.close().await;

        let policy = RetryPolicy::exponential(self.config.recovery_attempts, self.config.connect_backoff)
            .with_wait_before_first(true);
        if !self.client.connect_with(&policy).await {
            metrics::producer_recovery("failed");
            return false;
        }

        if let Err(e) = self.sync_exchanges().await {
            // Retried before the next delivery because the generation is still unsynced.
            warn!(error = %e, "Reconnected but could not re-declare exchanges");
        }

        metrics::producer_recovery("recovered");
        info!("Producer recovered broker connection");
        self.last_activity = Instant::now();
        true
    }
}
