//! Session validation endpoints and the request auth extractor

use axum::{
    Json, Router,
    extract::{FromRequestParts, State},
    http::{StatusCode, request::Parts},
    routing::get,
};
use axum_extra::extract::CookieJar;
use serde::Serialize;
use std::sync::Arc;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};

use crate::AppState;
use crate::domain::users;
use crate::models::SignerStatus;
use crate::services::session;

pub fn routes() -> Router<Arc<AppState>> {
    // Rate limit: burst of 10, then ~6/s, to keep token probing in check
    let rate_limit_config = GovernorConfigBuilder::default()
        .per_second(6)
        .burst_size(10)
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .expect("Failed to build rate limit config");

    let rate_limit_layer = GovernorLayer {
        config: rate_limit_config.into(),
    };

    Router::new()
        .route("/auth/me", get(get_me))
        .layer(rate_limit_layer)
}

// ============================================================================
// Auth Extractor - validates the session token and extracts the fid
// ============================================================================

/// Extractor that validates the access token and returns the caller's fid.
/// Accepts either an Authorization bearer header (daemon, scripts) or the
/// access_token cookie (browser clients).
pub struct AuthUser(pub i64);

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let bearer = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);

        let token = match bearer {
            Some(token) => token,
            None => {
                let jar = CookieJar::from_request_parts(parts, state)
                    .await
                    .map_err(|e| {
                        eprintln!("Cookie extraction error: {:?}", e);
                        StatusCode::INTERNAL_SERVER_ERROR
                    })?;

                jar.get("access_token")
                    .map(|c| c.value().to_string())
                    .ok_or(StatusCode::UNAUTHORIZED)?
            }
        };

        // Validate JWT
        let fid = session::validate_access_token(&token, &state.jwt_secret).map_err(|e| {
            eprintln!("JWT validation failed: {:?}", e);
            StatusCode::UNAUTHORIZED
        })?;

        Ok(AuthUser(fid))
    }
}

// ============================================================================
// Session endpoints
// ============================================================================

#[derive(Serialize)]
struct MeResponse {
    fid: i64,
    signer_status: Option<SignerStatus>,
    needs_signer_approval: bool,
}

/// GET /auth/me - Get current account info (validates session)
async fn get_me(
    State(state): State<Arc<AppState>>,
    AuthUser(fid): AuthUser,
) -> Result<Json<MeResponse>, StatusCode> {
    // The account row is created lazily on first schedule or signer call,
    // so a missing row just means no signer is connected yet
    let user = users::get_user_by_fid(&state.db, fid).await.map_err(|e| {
        eprintln!("Get user by fid error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let (signer_status, needs_signer_approval) = match user {
        Some(u) => (u.signer_status, u.needs_signer_approval),
        None => (None, false),
    };

    Ok(Json(MeResponse {
        fid,
        signer_status,
        needs_signer_approval,
    }))
}
