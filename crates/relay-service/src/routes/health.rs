use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use tracing::instrument;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    service_name: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    broker: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache: Option<&'static str>,
}

/// Liveness probe
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service_name: env!("CARGO_PKG_NAME"),
    })
}

/// Readiness probe: broker connected and, if configured, Redis reachable.
#[instrument(skip(state))]
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let broker_ok = state.connection.is_connected();

    let cache_ok = match &state.cache {
        Some(cache) => Some(cache.ping().await.is_ok()),
        None => None,
    };

    let ready = broker_ok && cache_ok.unwrap_or(true);
    let label = |ok: bool| if ok { "ok" } else { "unavailable" };

    let body = Json(ReadyResponse {
        status: if ready { "ready" } else { "not ready" },
        broker: label(broker_ok),
        cache: cache_ok.map(label),
    });

    if ready {
        (StatusCode::OK, body)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body)
    }
}
