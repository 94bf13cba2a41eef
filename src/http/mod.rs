use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::state::AppState;

pub mod account;
pub mod ai;
pub mod auth;
pub mod business;
pub mod environments;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(ai::router())
        .merge(environments::router())
        .merge(account::router())
        .merge(business::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .db
        .health_check()
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(json!({ "status": "ok" })))
}
