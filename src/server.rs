use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use nodelease::{HealthReport, IdGenerator, NodeLeaseAllocator};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone)]
pub struct HealthState {
    pub allocator: Arc<NodeLeaseAllocator>,
    pub generator: Arc<IdGenerator>,
}

async fn get_health(State(state): State<HealthState>) -> (StatusCode, Json<HealthReport>) {
    let report = HealthReport::collect(&state.allocator, Some(&state.generator)).await;
    let code = if report.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .with_state(state)
}

/// Serve the health endpoint until `shutdown` is cancelled
pub async fn serve(
    listener: TcpListener,
    state: HealthState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!("Health endpoint listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
