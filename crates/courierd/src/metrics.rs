//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  Prometheus text format
//!   GET /healthz  Liveness probe (always 200 if process is running)
//!   GET /readyz   Readiness probe (200 if mailbox storage is reachable)

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus_client::encoding::{text::encode, EncodeLabelSet};
use prometheus_client::metrics::{counter::Counter, family::Family};
use prometheus_client::registry::Registry;
use std::sync::Arc;

use courier_mailbox::Mailbox;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RejectLabels {
    /// `CourierError::kind()` of the rejection
    pub kind: String,
}

/// Relay counters, shared between the gRPC service and the HTTP endpoint.
#[derive(Debug, Default, Clone)]
pub struct RelayMetrics {
    pub stored: Counter,
    pub stored_chunks: Counter,
    pub stored_bytes: Counter,
    pub listed: Counter,
    pub fetched: Counter,
    pub deleted: Counter,
    pub rejected: Family<RejectLabels, Counter>,
}

impl RelayMetrics {
    /// Create the counters and register them under the `courier_` prefix.
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        let courier = registry.sub_registry_with_prefix("courier");
        courier.register(
            "transfers_stored",
            "Transfer records accepted into the mailbox",
            metrics.stored.clone(),
        );
        courier.register(
            "chunks_stored",
            "Encrypted chunks accepted into the mailbox",
            metrics.stored_chunks.clone(),
        );
        courier.register(
            "ciphertext_bytes_stored",
            "Ciphertext bytes accepted into the mailbox",
            metrics.stored_bytes.clone(),
        );
        courier.register(
            "mailbox_lists",
            "Mailbox listings served",
            metrics.listed.clone(),
        );
        courier.register(
            "transfers_fetched",
            "Transfer records fetched by recipients",
            metrics.fetched.clone(),
        );
        courier.register(
            "transfers_deleted",
            "Transfer records deleted by recipients",
            metrics.deleted.clone(),
        );
        courier.register(
            "transfers_rejected",
            "Store requests rejected, by error kind",
            metrics.rejected.clone(),
        );
        metrics
    }

    pub fn reject(&self, kind: &str) {
        self.rejected
            .get_or_create(&RejectLabels {
                kind: kind.to_string(),
            })
            .inc();
    }
}

/// Shared state for the HTTP endpoints
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<Registry>,
    pub mailbox: Arc<Mailbox>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

/// Serve Prometheus metrics and health endpoints on `addr` (e.g. "127.0.0.1:9300")
pub async fn serve(addr: String, state: HealthState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness probe: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe: returns 200 if storage is reachable, 503 otherwise.
async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    match state.mailbox.check_health().await {
        Ok(()) => (StatusCode::OK, "ready"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "storage unreachable"),
    }
}
