use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::error::StartError;
use crate::service::SharedService;

/// Embedded admin page.
pub async fn index_handler() -> axum::response::Html<&'static str> {
    axum::response::Html(include_str!("../../static/index.html"))
}

/// System-wide status: registry counts, pool occupancy, memory and load.
pub async fn sys_status(State(service): State<SharedService>) -> Json<serde_json::Value> {
    let stats = service.system_stats();
    Json(serde_json::json!(stats))
}

/// All registered streams with their lifecycle state and counters.
pub async fn list_streams(State(service): State<SharedService>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "streams": service.list() }))
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub url: String,
}

/// Begin producing an HLS playlist for an RTSP source under this name.
/// Responds with the playlist path; starting a running stream returns the
/// existing path.
pub async fn handle_start(
    State(service): State<SharedService>,
    Path(name): Path<String>,
    Json(request): Json<StartRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    match service.start(&request.url, &name) {
        Ok(playlist) => Ok(Json(serde_json::json!({
            "name": name,
            "playlist": playlist,
        }))),
        Err(err @ StartError::CapacityExceeded(_)) => {
            Err((StatusCode::TOO_MANY_REQUESTS, err.to_string()))
        }
        Err(err @ StartError::ShuttingDown) => {
            Err((StatusCode::SERVICE_UNAVAILABLE, err.to_string()))
        }
        Err(err @ StartError::Io(_)) => Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string())),
        Err(err) => Err((StatusCode::BAD_REQUEST, err.to_string())),
    }
}

/// Stop a stream and delete its segments. Unknown names are a no-op.
pub async fn handle_stop(
    State(service): State<SharedService>,
    Path(name): Path<String>,
) -> Json<serde_json::Value> {
    service.stop(&name).await;
    Json(serde_json::json!({ "name": name, "status": "stopped" }))
}

pub async fn stream_status(
    State(service): State<SharedService>,
    Path(name): Path<String>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "name": name, "status": service.status(&name) }))
}

pub async fn stream_stats(
    State(service): State<SharedService>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match service.stats(&name) {
        Some(stats) => Ok(Json(serde_json::json!(stats))),
        None => Err(StatusCode::NOT_FOUND),
    }
}
