//! HTTP ingress for motion envelopes.
//!
//! One route accepts the broker-delivered envelope and hands it to the
//! dispatcher; the response is the dispatch outcome. Validation failures
//! answer 400, anything fatal answers 500 with a structured `{error,
//! message}` body that never carries tokens.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use sonosense_core::{CoreError, MotionEnvelope};
use sonosense_engine::MotionDispatcher;
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<MotionDispatcher>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/events/motion", post(ingest_motion))
        .route("/healthz", get(|| async { Json(json!({"status": "ok"})) }))
        .with_state(state)
}

async fn ingest_motion(
    State(state): State<AppState>,
    Json(envelope): Json<MotionEnvelope>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.dispatcher.handle(&envelope).await {
        Ok(outcome) => match serde_json::to_value(&outcome) {
            Ok(body) => (StatusCode::OK, Json(body)),
            Err(e) => {
                error!("Failed to serialise dispatch outcome: {}", e);
                internal_error()
            }
        },
        Err(CoreError::Validation { field, message }) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "ValidationError", "message": format!("{field}: {message}")})),
        ),
        Err(e) => {
            error!("Motion dispatch failed: {}", e);
            internal_error()
        }
    }
}

fn internal_error() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "InternalError", "message": "internal server error"})),
    )
}
