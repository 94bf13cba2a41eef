use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::db::models::BusinessProfileRow;
use crate::error::ApiError;
use crate::http::auth::AuthUser;
use crate::state::AppState;

pub(super) fn router() -> Router<AppState> {
    Router::new().route("/business", get(get_business).post(upsert_business))
}

#[derive(Debug, Deserialize)]
struct BusinessProfileBody {
    #[serde(default)]
    business_name: Option<String>,
    #[serde(default)]
    vibes: Option<String>,
    #[serde(default)]
    theme: Option<String>,
}

async fn get_business(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<BusinessProfileRow>, ApiError> {
    state
        .db
        .get_business_profile(&user.id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("business profile not found".to_string()))
}

/// Creates the profile on first write; later writes only overwrite the
/// fields the body actually carries.
async fn upsert_business(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<BusinessProfileBody>,
) -> Result<Json<BusinessProfileRow>, ApiError> {
    let row = state
        .db
        .upsert_business_profile(
            &user.id,
            body.business_name.as_deref(),
            body.vibes.as_deref(),
            body.theme.as_deref(),
        )
        .await?;
    Ok(Json(row))
}
