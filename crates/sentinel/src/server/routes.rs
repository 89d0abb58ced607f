use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use crate::{metrics::gather_metrics, sentinel::Sentinel, Error};

fn error_response(e: Error) -> Response {
    let status = match &e {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        _ => {
            error!("Request failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

pub async fn metrics() -> Response {
    match gather_metrics() {
        Ok(body) => body.into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn list_active_runs(State(sentinel): State<Arc<Sentinel>>) -> Response {
    match sentinel.list_active_runs().await {
        Ok(runs) => Json(runs).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_run(State(sentinel): State<Arc<Sentinel>>, Path(id): Path<String>) -> Response {
    match sentinel.get_run_status(&id).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn list_anomalies(State(sentinel): State<Arc<Sentinel>>, Path(id): Path<String>) -> Response {
    match sentinel.list_anomalies(&id).await {
        Ok(anomalies) => Json(anomalies).into_response(),
        Err(e) => error_response(e),
    }
}
