use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use serde::Deserialize;
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

/// Authenticated caller. Token validation is delegated to the external auth
/// service; this process never inspects credentials itself.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
}

/// Optional variant for endpoints that also serve anonymous callers.
#[derive(Debug, Clone)]
pub struct MaybeAuthUser(pub Option<AuthUser>);

impl MaybeAuthUser {
    pub fn id(&self) -> Option<&str> {
        self.0.as_ref().map(|user| user.id.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

async fn verify_bearer(state: &AppState, token: &str) -> Option<AuthUser> {
    let verify_url = state.config.auth_verify_url.trim();
    if verify_url.is_empty() {
        debug!("No auth verify endpoint configured; treating caller as anonymous");
        return None;
    }

    let response = match state.http.get(verify_url).bearer_auth(token).send().await {
        Ok(response) => response,
        Err(err) => {
            debug!("Auth verification call failed: {err}");
            return None;
        }
    };
    if !response.status().is_success() {
        return None;
    }
    let body: VerifyResponse = response.json().await.ok()?;
    let id = body.user_id.or(body.id)?;
    if id.trim().is_empty() {
        return None;
    }
    Some(AuthUser { id })
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

impl FromRequestParts<AppState> for MaybeAuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(parts) else {
            return Ok(MaybeAuthUser(None));
        };
        Ok(MaybeAuthUser(verify_bearer(state, token).await))
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let MaybeAuthUser(user) = MaybeAuthUser::from_request_parts(parts, state).await?;
        user.ok_or(ApiError::Unauthorized)
    }
}
