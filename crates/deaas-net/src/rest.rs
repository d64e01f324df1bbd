//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "REST endpoints for health and on-demand telemetry reads."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dispatcher::{AssetReading, DispatchError, Dispatcher, TelemetryQuery};

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub ok: bool,
    pub telemetry_provider: String,
}

/// Body of a successful `GET /api/telemetry`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Vec<AssetReading>,
}

#[derive(Debug, Default, Deserialize)]
struct TelemetryParams {
    #[serde(rename = "type")]
    kind: Option<String>,
    ids: Option<String>,
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

/// Router serving `/health` and `/api/telemetry`.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/api/telemetry", get(get_telemetry))
        .with_state(dispatcher)
}

async fn get_health(State(dispatcher): State<Arc<Dispatcher>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        telemetry_provider: dispatcher.provider_name().to_owned(),
    })
}

async fn get_telemetry(
    State(dispatcher): State<Arc<Dispatcher>>,
    Query(params): Query<TelemetryParams>,
) -> Result<Json<TelemetryResponse>, DispatchError> {
    let query = TelemetryQuery::parse(params.kind.as_deref(), params.ids.as_deref())?;
    debug!(kind = %query.kind, count = query.ids.len(), "telemetry read requested");
    let data = dispatcher.telemetry(query.kind, &query.ids);
    Ok(Json(TelemetryResponse {
        kind: query.kind.as_str().to_owned(),
        data,
    }))
}
