//! Health check handlers for the messaging worker.
//!
//! - `/health`: liveness, always OK while the process serves requests
//! - `/ready`: producer running and every consumer healthy, 503 otherwise
//! - `/consumers`: per-consumer status and health
//! - `/metrics`: Prometheus text format

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::consumer::{ConsumerHealth, ConsumerManager};
use crate::metrics;
use crate::producer::{ProducerManager, ProducerStats};
use crate::transport::Transport;

type StatsFn = Arc<dyn Fn() -> ProducerStats + Send + Sync>;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub app_name: String,
    pub app_version: String,
    producer_stats: StatsFn,
    consumers: Arc<ConsumerManager>,
}

impl HealthState {
    pub fn new<T: Transport>(
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        producer: Arc<ProducerManager<T>>,
        consumers: Arc<ConsumerManager>,
    ) -> Self {
        Self::with_stats(app_name, app_version, move || producer.stats(), consumers)
    }

    /// Build from any source of producer statistics.
    pub fn with_stats(
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        producer_stats: impl Fn() -> ProducerStats + Send + Sync + 'static,
        consumers: Arc<ConsumerManager>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            producer_stats: Arc::new(producer_stats),
            consumers,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ConsumersResponse {
    pub status: BTreeMap<String, String>,
    pub health: BTreeMap<String, ConsumerHealth>,
}

pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
    })
}

pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    let producer = (state.producer_stats)();
    let consumers_ok = state.consumers.all_healthy();

    let status = if producer.running && consumers_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "ready" } else { "not_ready" },
            "checks": {
                "producer": if producer.running { "ok" } else { "stopped" },
                "consumers": if consumers_ok { "ok" } else { "unhealthy" },
            },
            "producer": producer,
        })),
    )
}

pub async fn consumers_handler(State(state): State<HealthState>) -> Json<ConsumersResponse> {
    Json(ConsumersResponse {
        status: state.consumers.consumer_status(),
        health: state.consumers.consumer_health(),
    })
}

pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/consumers", get(consumers_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
