use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db::models::{CreditTransactionRow, PlanRow, UsageLogRow, UserProfileRow};
use crate::error::ApiError;
use crate::http::auth::AuthUser;
use crate::state::AppState;

const DEFAULT_PAGE_SIZE: i64 = 25;
const MAX_PAGE_SIZE: i64 = 100;

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/account/profile", get(get_profile).put(update_profile))
        .route("/account/credits", get(get_credits))
        .route("/account/credits/history", get(credit_history))
        .route("/account/usage", get(usage_history))
        .route("/account/plans", get(list_plans))
}

#[derive(Debug, Deserialize)]
struct PageParams {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

impl PageParams {
    fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

// -- profile --

async fn get_profile(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<UserProfileRow>, ApiError> {
    state
        .db
        .get_user_profile(&user.id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("no profile for this user".to_string()))
}

#[derive(Debug, Deserialize)]
struct ProfileBody {
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    creative_type: Option<String>,
}

async fn update_profile(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<ProfileBody>,
) -> Result<Json<UserProfileRow>, ApiError> {
    let row = state
        .db
        .upsert_user_profile(
            &user.id,
            body.first_name.as_deref(),
            body.last_name.as_deref(),
            body.creative_type.as_deref(),
        )
        .await?;
    Ok(Json(row))
}

// -- credits --

async fn get_credits(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    // A user with no ledger row simply has a zero balance.
    let balance = state.db.get_credit_balance(&user.id).await?;
    let (total, used, remaining) = balance
        .map(|row| (row.total_credits, row.used_credits, row.remaining_credits))
        .unwrap_or((0, 0, 0));
    Ok(Json(json!({
        "total_credits": total,
        "used_credits": used,
        "remaining_credits": remaining,
    })))
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    total: i64,
    transactions: Vec<CreditTransactionRow>,
}

async fn credit_history(
    State(state): State<AppState>,
    user: AuthUser,
    Query(page): Query<PageParams>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let total = state.db.count_credit_transactions(&user.id).await?;
    let transactions = state
        .db
        .list_credit_transactions(&user.id, page.limit(), page.offset())
        .await?;
    Ok(Json(HistoryResponse {
        total,
        transactions,
    }))
}

async fn usage_history(
    State(state): State<AppState>,
    user: AuthUser,
    Query(page): Query<PageParams>,
) -> Result<Json<Vec<UsageLogRow>>, ApiError> {
    let rows = state
        .db
        .list_usage_logs(&user.id, page.limit(), page.offset())
        .await?;
    Ok(Json(rows))
}

// -- plans --

async fn list_plans(State(state): State<AppState>) -> Result<Json<Vec<PlanRow>>, ApiError> {
    Ok(Json(state.db.list_plans().await?))
}
