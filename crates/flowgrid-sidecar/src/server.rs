//! Sidecar HTTP endpoints.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/ready` | 204 when ready, 503 otherwise |
//! | GET, POST | `/pre-stop?source=` | Run pre-stop hooks (once), 204 when done |
//! | GET | `/metrics` | Prometheus exposition |

use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use serde::Deserialize;
use tracing::info;

use crate::aggregator::SidecarStatusAggregator;
use crate::counters::ReplicaCounters;
use crate::hooks::LifecycleHookRegistry;
use crate::prometheus::render_prometheus;

/// Shared state for sidecar handlers.
#[derive(Clone)]
pub struct SidecarState {
    pub aggregator: Arc<SidecarStatusAggregator>,
    pub hooks: Arc<LifecycleHookRegistry>,
    pub counters: Arc<ReplicaCounters>,
}

#[derive(Debug, Deserialize)]
pub struct PreStopParams {
    #[serde(default)]
    pub source: Option<String>,
}

pub fn build_router(state: SidecarState) -> Router {
    Router::new()
        .route("/ready", get(ready))
        .route("/pre-stop", get(pre_stop).post(pre_stop))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn ready(State(state): State<SidecarState>) -> StatusCode {
    if state.aggregator.is_ready().await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn pre_stop(
    State(state): State<SidecarState>,
    Query(params): Query<PreStopParams>,
) -> StatusCode {
    let source = params.source.unwrap_or_else(|| "unknown".to_string());
    info!(%source, "pre-stop requested");
    state.hooks.pre_stop(&source).await;
    StatusCode::NO_CONTENT
}

async fn metrics(State(state): State<SidecarState>) -> impl IntoResponse {
    let step = state.aggregator.snapshot().await;
    let body = render_prometheus(&step, &state.counters, state.aggregator.is_lead());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
