use axum::extract::{Path, State};
use axum::routing::{get, patch};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::db::models::{DatasetRow, EnvironmentRow};
use crate::error::ApiError;
use crate::http::auth::AuthUser;
use crate::state::AppState;
use crate::storage::storage_path_from_url;

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/environments", get(list_environments).post(create_environment))
        .route(
            "/environments/{id}",
            get(get_environment)
                .patch(rename_environment)
                .delete(delete_environment),
        )
        .route(
            "/environments/{id}/folders",
            get(list_folders).post(create_folder),
        )
        .route("/folders/{id}", patch(rename_folder).delete(delete_folder))
}

#[derive(Debug, Deserialize)]
struct NameBody {
    name: String,
}

fn validated_name(raw: &str) -> Result<&str, ApiError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }
    Ok(name)
}

/// Blob cleanup after a cascade delete. Best effort: rows are already gone,
/// an orphaned blob only costs storage.
async fn delete_blobs(state: &AppState, urls: Vec<String>) {
    let bucket = &state.config.dataset_bucket;
    let paths: Vec<String> = urls
        .iter()
        .filter_map(|url| storage_path_from_url(bucket, url))
        .collect();
    if paths.is_empty() {
        return;
    }
    if let Err(err) = state.store.delete(bucket, &paths).await {
        warn!("Blob cleanup of {} object(s) failed: {err:#}", paths.len());
    }
}

// -- environments --

async fn list_environments(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<EnvironmentRow>>, ApiError> {
    Ok(Json(state.db.list_environments(&user.id).await?))
}

async fn create_environment(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<NameBody>,
) -> Result<Json<EnvironmentRow>, ApiError> {
    let name = validated_name(&body.name)?;
    if state.db.environment_name_taken(&user.id, name).await? {
        return Err(ApiError::BadRequest(format!(
            "an environment named {name:?} already exists"
        )));
    }
    let row = state.db.create_environment(&user.id, name).await?;
    info!("Created environment {} for {}", row.id, user.id);
    Ok(Json(row))
}

async fn get_environment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(environment_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let environment = state
        .db
        .get_environment(&environment_id, &user.id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("environment {environment_id} not found")))?;
    let folders = state.db.list_folders(&environment.id, &user.id).await?;
    Ok(Json(json!({
        "environment": environment,
        "folders": folders,
    })))
}

async fn rename_environment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(environment_id): Path<String>,
    Json(body): Json<NameBody>,
) -> Result<Json<EnvironmentRow>, ApiError> {
    let name = validated_name(&body.name)?;
    if state.db.environment_name_taken(&user.id, name).await? {
        return Err(ApiError::BadRequest(format!(
            "an environment named {name:?} already exists"
        )));
    }
    state
        .db
        .rename_environment(&environment_id, &user.id, name)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("environment {environment_id} not found")))
}

async fn delete_environment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(environment_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Collect affected blob URLs before the cascade removes the rows.
    let urls = state
        .db
        .list_image_urls_for_environment(&environment_id)
        .await?;
    if !state.db.delete_environment(&environment_id, &user.id).await? {
        return Err(ApiError::NotFound(format!(
            "environment {environment_id} not found"
        )));
    }
    delete_blobs(&state, urls).await;
    info!("Deleted environment {environment_id}");
    Ok(Json(json!({ "deleted": true })))
}

// -- folders --

async fn list_folders(
    State(state): State<AppState>,
    user: AuthUser,
    Path(environment_id): Path<String>,
) -> Result<Json<Vec<DatasetRow>>, ApiError> {
    state
        .db
        .get_environment(&environment_id, &user.id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("environment {environment_id} not found")))?;
    Ok(Json(state.db.list_folders(&environment_id, &user.id).await?))
}

async fn create_folder(
    State(state): State<AppState>,
    user: AuthUser,
    Path(environment_id): Path<String>,
    Json(body): Json<NameBody>,
) -> Result<Json<DatasetRow>, ApiError> {
    let name = validated_name(&body.name)?;
    state
        .db
        .get_environment(&environment_id, &user.id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("environment {environment_id} not found")))?;
    if state
        .db
        .folder_name_taken(&user.id, Some(&environment_id), name)
        .await?
    {
        return Err(ApiError::BadRequest(format!(
            "a folder named {name:?} already exists in this environment"
        )));
    }
    let row = state
        .db
        .create_folder(Some(&user.id), Some(&environment_id), name)
        .await?;
    info!("Created folder {} in environment {environment_id}", row.id);
    Ok(Json(row))
}

async fn rename_folder(
    State(state): State<AppState>,
    user: AuthUser,
    Path(folder_id): Path<String>,
    Json(body): Json<NameBody>,
) -> Result<Json<DatasetRow>, ApiError> {
    let name = validated_name(&body.name)?;
    let current = state
        .db
        .get_dataset(&folder_id)
        .await?
        .filter(|dataset| dataset.user_id.as_deref() == Some(user.id.as_str()))
        .ok_or_else(|| ApiError::NotFound(format!("folder {folder_id} not found")))?;
    if state
        .db
        .folder_name_taken(&user.id, current.environment_id.as_deref(), name)
        .await?
    {
        return Err(ApiError::BadRequest(format!(
            "a folder named {name:?} already exists in this environment"
        )));
    }
    state
        .db
        .rename_folder(&folder_id, &user.id, name)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("folder {folder_id} not found")))
}

async fn delete_folder(
    State(state): State<AppState>,
    user: AuthUser,
    Path(folder_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let urls = state.db.list_image_urls_for_dataset(&folder_id).await?;
    if !state.db.delete_folder(&folder_id, &user.id).await? {
        return Err(ApiError::NotFound(format!("folder {folder_id} not found")));
    }
    delete_blobs(&state, urls).await;
    info!("Deleted folder {folder_id}");
    Ok(Json(json!({ "deleted": true })))
}
