//! Records Worker Service
//!
//! Long-running process that owns the patient-records messaging:
//!
//! ```text
//! PostgreSQL ◀── DriftConsumer ◀── reconciliation.drift.detected
//!                    │ sync events
//!                    ▼
//!             ProducerManager ──▶ patient.updates
//! ```
//!
//! ## Shutdown
//!
//! SIGINT/SIGTERM triggers the shared [`ShutdownSignal`]. Consumers are stopped first so
//! in-flight sync events are still enqueued, then the producer drains its queue and
//! closes, each phase bounded by `SHUTDOWN_TIMEOUT_SECS`.

pub mod config;

use axum::Router;
use broker::{
    AmqpTransport, BrokerConfig, Consumer, ConsumerManager, HealthState, ProducerManager, RetryPolicy,
    ShutdownSignal, health_router,
};
use core_config::{Environment, FromEnv};
use domain_patients::{
    DriftConsumer, DriftHandler, MedicationPublisher, PatientPublisher,
    postgres::{self, PgRecordStore},
};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub use config::WorkerConfig;

/// Serve the health router until shutdown is triggered.
async fn start_health_server(router: Router, port: u16, shutdown: ShutdownSignal) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    let app = router.layer(TraceLayer::new_for_http());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the records worker
///
/// 1. Sets up structured logging and the Prometheus recorder
/// 2. Connects to PostgreSQL (with retry)
/// 3. Starts the producer and declares the entity exchanges
/// 4. Starts the drift consumer under the consumer manager
/// 5. Serves health endpoints until a shutdown signal arrives
///
/// # Errors
///
/// Returns an error if configuration is missing or invalid, or if PostgreSQL stays
/// unreachable. Broker trouble after startup is handled by reconnects, not by exiting.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    broker::init_metrics();

    let app_name = env!("CARGO_PKG_NAME");
    let app_version = env!("CARGO_PKG_VERSION");
    info!(name = app_name, version = app_version, ?environment, "Starting records worker");

    let config = WorkerConfig::from_env().wrap_err("Failed to load worker configuration")?;
    let broker_config = BrokerConfig::from_env().wrap_err("Failed to load broker configuration")?;
    info!(
        broker = %broker_config.redacted_url(),
        drift_queue = %config.drift.queue,
        health_port = config.health_port,
        "Configuration loaded"
    );

    info!("Connecting to PostgreSQL...");
    let db_policy = RetryPolicy::exponential(5, Duration::from_secs(1)).with_max_delay(Duration::from_secs(30));
    let db = postgres::connect(&config.database_url, &db_policy)
        .await
        .wrap_err("Failed to connect to PostgreSQL")?;

    let producer = Arc::new(ProducerManager::new(broker_config.clone(), AmqpTransport::new));
    producer.start_producer();

    let patients = PatientPublisher::new(producer.clone()).await;
    let medications = MedicationPublisher::new(producer.clone()).await;
    let handler = Arc::new(DriftHandler::new(
        Arc::new(PgRecordStore::new(db)),
        patients,
        medications,
    ));

    let shutdown = ShutdownSignal::new();
    let consumers = Arc::new(ConsumerManager::new(shutdown.clone()).with_stop_timeout(config.shutdown_timeout));

    let drift_settings = config.drift.clone();
    consumers.register_consumer(DriftConsumer::<AmqpTransport>::NAME, move || {
        let broker_config = broker_config.clone();
        let settings = drift_settings.clone();
        let handler = handler.clone();
        async move {
            let consumer = DriftConsumer::build(AmqpTransport::new(), broker_config, settings, handler).await?;
            Ok(Arc::new(consumer) as Arc<dyn Consumer>)
        }
    });
    let started = consumers.start_all_consumers();
    info!(consumers = started, "Consumers started");

    let signal_listener = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_listener.trigger_on_os_signal().await {
            error!(error = %e, "Could not listen for OS signals, shutting down");
            signal_listener.trigger();
        }
    });

    let health = HealthState::new(app_name, app_version, producer.clone(), consumers.clone());
    let server = {
        let shutdown = shutdown.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            let result = start_health_server(health_router(health), port, shutdown.clone()).await;
            if result.is_err() {
                shutdown.trigger();
            }
            result
        })
    };

    shutdown.wait().await;
    info!("Shutting down records worker");

    if !consumers.stop_all_consumers().await {
        warn!("Consumers did not stop within the timeout");
    }
    if !producer.stop_producer(config.shutdown_timeout).await {
        warn!("Producer did not drain within the timeout");
    }

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Health server exited with an error"),
        Err(e) => error!(error = %e, "Health server task failed"),
    }

    info!("Records worker stopped");
    Ok(())
}
