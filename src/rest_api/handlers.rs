//! HTTP handlers for the REST API

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use kube::api::{Api, ListParams};
use tracing::{error, instrument};

use crate::controller::ControllerState;
use crate::crd::{AlertChannel, ApiCheck, Group, ManagedResource};

use super::dto::{ErrorResponse, HealthResponse, ResourceListResponse, ResourceSummary};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

fn health_body(status: &str) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Liveness probe
#[instrument]
pub async fn healthz() -> Json<HealthResponse> {
    health_body("healthy")
}

/// Readiness probe
///
/// A standby replica is ready: it only waits for the lease. The leader is
/// ready once its controllers have been started.
#[instrument(skip(state))]
pub async fn readyz(
    State(state): State<Arc<ControllerState>>,
) -> (StatusCode, Json<HealthResponse>) {
    if !state.leading() {
        (StatusCode::OK, health_body("standby"))
    } else if state.ready.load(Ordering::Relaxed) {
        (StatusCode::OK, health_body("ready"))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, health_body("starting"))
    }
}

/// Metrics endpoint handler
#[cfg(feature = "metrics")]
pub async fn metrics() -> Result<String, StatusCode> {
    crate::controller::metrics::encode_text().map_err(|e| {
        error!("Failed to encode metrics: {:?}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn summaries<K: ManagedResource>(state: &ControllerState) -> Result<Vec<ResourceSummary>, kube::Error> {
    let api: Api<K> = Api::all(state.client.clone());
    let list = api.list(&ListParams::default()).await?;
    Ok(list.items.iter().map(ResourceSummary::of).collect())
}

/// List every managed resource with its sync state
#[instrument(skip(state))]
pub async fn list_resources(
    State(state): State<Arc<ControllerState>>,
) -> ApiResult<ResourceListResponse> {
    let listed = async {
        let mut items = summaries::<AlertChannel>(&state).await?;
        items.extend(summaries::<Group>(&state).await?);
        items.extend(summaries::<ApiCheck>(&state).await?);
        Ok::<_, kube::Error>(items)
    }
    .await;

    match listed {
        Ok(items) => {
            let total = items.len();
            Ok(Json(ResourceListResponse { items, total }))
        }
        Err(e) => {
            error!("Failed to list managed resources: {:?}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("list_failed", &e.to_string())),
            ))
        }
    }
}
