//! Axum HTTP service around a loaded CRF model.
//!
//! Configuration comes from the environment:
//!
//! - `LCRF_CONFIG`: configuration file (required)
//! - `LCRF_MODEL`: model dump (required)
//! - `LCRF_ADDR`: listen address, default `0.0.0.0:3000`

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use lcrf_core::{Applier, ApplierStats, CancelToken, RawUnit, UnitResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Shared application state
struct AppState {
    applier: Applier,
}

#[derive(Deserialize)]
struct ApplyRequest {
    text: String,
}

#[derive(Deserialize)]
struct BatchRequest {
    units: Vec<String>,
}

#[derive(Serialize)]
struct ApplyResponse {
    units: Vec<UnitResult>,
    stats: ApplierStats,
}

fn env_var(name: &str) -> Result<String, Box<dyn std::error::Error>> {
    std::env::var(name).map_err(|_| format!("{name} is not set").into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = env_var("LCRF_CONFIG")?;
    let model = env_var("LCRF_MODEL")?;
    let addr = std::env::var("LCRF_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    let applier = tokio::task::spawn_blocking(move || Applier::load(config, model)).await??;
    let state = Arc::new(AppState { applier });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(state).layer(cors);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("CRF tagging service listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/labels", get(labels_handler))
        .route("/apply", post(apply_handler))
        .route("/apply/batch", post(batch_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Label alphabet of the loaded model
async fn labels_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.applier.labels().names().to_vec())
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": message})),
    )
        .into_response()
}

fn internal_error(message: String) -> Response {
    error!(%message, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": message})),
    )
        .into_response()
}

/// Tags one text. Running text may come back as several sentence units.
async fn apply_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ApplyRequest>,
) -> Response {
    if req.text.trim().is_empty() {
        return bad_request("empty text");
    }
    // Decoding blocks; it runs on the blocking pool
    let task = tokio::task::spawn_blocking(move || {
        let units = state.applier.apply_to_text(&req.text)?;
        Ok::<_, lcrf_core::DecodeError>(ApplyResponse {
            units,
            stats: state.applier.stats(),
        })
    });
    match task.await {
        Ok(Ok(response)) => Json(response).into_response(),
        Ok(Err(e)) => internal_error(e.to_string()),
        Err(e) => internal_error(e.to_string()),
    }
}

/// Tags many texts in parallel. Results of all texts come back in one list,
/// in request order.
async fn batch_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchRequest>,
) -> Response {
    if req.units.is_empty() {
        return bad_request("no units");
    }
    let task = tokio::task::spawn_blocking(move || {
        let applier = &state.applier;
        let mut units: Vec<RawUnit> = Vec::new();
        for text in &req.units {
            units.extend(applier.read_units(text.as_bytes()));
        }
        // Re-number so indices run across the whole batch
        for (i, unit) in units.iter_mut().enumerate() {
            unit.index = i;
        }
        let results = applier.apply_batch(units, &CancelToken::new())?;
        Ok::<_, lcrf_core::DecodeError>(ApplyResponse {
            units: results,
            stats: applier.stats(),
        })
    });
    match task.await {
        Ok(Ok(response)) => Json(response).into_response(),
        Ok(Err(e)) => internal_error(e.to_string()),
        Err(e) => internal_error(e.to_string()),
    }
}
