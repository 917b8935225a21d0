//! Health & Status API endpoints
//!
//! - GET /health  - Per-chain component health (503 unless every chain is healthy)
//! - GET /healthz - Liveness check
//! - GET /status  - Watcher cursors and pipeline counters
//! - GET /metrics - Prometheus metrics

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use eyre::eyre;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::coordinator::{StatusBoard, StatusReport};
use crate::health::HealthSnapshot;
use crate::metrics;
use crate::shutdown;

#[derive(Clone)]
pub struct AppState {
    pub health: watch::Receiver<HealthSnapshot>,
    pub status: StatusBoard,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(health: watch::Receiver<HealthSnapshot>, status: StatusBoard) -> Self {
        Self {
            health,
            status,
            started_at: Instant::now(),
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub snapshot: HealthSnapshot,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_seconds: u64,
    #[serde(flatten)]
    pub report: StatusReport,
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let snapshot = state.health.borrow().clone();
    let (code, status) = if snapshot.is_healthy() {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };
    (code, Json(HealthResponse { status, snapshot }))
}

/// Liveness check (always returns OK if server is running)
async fn liveness() -> &'static str {
    "OK"
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        uptime_seconds: state.started_at.elapsed().as_secs(),
        report: state.status.snapshot(),
    })
}

async fn prometheus_metrics() -> Response {
    match metrics::render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response(),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(liveness))
        .route("/status", get(status))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Serve the API until shutdown is requested
pub async fn start_api_server(
    bind_address: &str,
    port: u16,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> eyre::Result<()> {
    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server started");
    metrics::UP.set(1.0);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown::requested(&mut shutdown).await })
        .await?;

    metrics::UP.set(0.0);
    info!("API server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{Component, HealthState, HealthUpdate};
    use crate::types::ChainId;

    fn state(snapshot: HealthSnapshot) -> (watch::Sender<HealthSnapshot>, AppState) {
        let (tx, rx) = watch::channel(snapshot);
        (tx, AppState::new(rx, StatusBoard::default()))
    }

    #[tokio::test]
    async fn test_health_ok_when_all_healthy() {
        let mut snapshot = HealthSnapshot::default();
        snapshot.apply(HealthUpdate {
            chain_id: ChainId(1),
            component: Component::Watcher,
            state: HealthState::Healthy,
        });
        let (_tx, state) = state(snapshot);

        let (code, Json(body)) = health_check(State(state)).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.status, "healthy");
    }

    #[tokio::test]
    async fn test_health_unavailable_when_halted() {
        let (tx, state) = state(HealthSnapshot::default());
        tx.send_modify(|s| {
            s.apply(HealthUpdate {
                chain_id: ChainId(2),
                component: Component::Watcher,
                state: HealthState::Halted("reorg".into()),
            });
        });

        let (code, Json(body)) = health_check(State(state)).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["chains"]["2"]["components"]["watcher"]["status"], "halted");
    }

    #[tokio::test]
    async fn test_status_serializes_empty_board() {
        let (_tx, state) = state(HealthSnapshot::default());
        let Json(body) = status(State(state)).await;
        let json = serde_json::to_value(&body).unwrap();
        assert!(json["watchers"].as_object().unwrap().is_empty());
        assert!(json["pipelines"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metrics_renders() {
        metrics::record_deposit_detected(ChainId(3));
        let response = prometheus_metrics().await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
