//! Signer provisioning and status endpoints (/signer)

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::AppState;
use crate::domain::users;
use crate::models::{SignerStatus, UserRecord};
use crate::routes::auth::AuthUser;
use crate::services::error::LogErr;
use crate::services::neynar::FarcasterApi;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/signer", get(get_signer).post(provision_signer))
}

#[derive(Serialize)]
struct SignerStateResponse {
    signer_uuid: Option<String>,
    status: Option<SignerStatus>,
    approval_url: Option<String>,
    needs_approval: bool,
    checked_at: Option<DateTime<Utc>>,
}

impl SignerStateResponse {
    fn none_connected() -> Self {
        Self {
            signer_uuid: None,
            status: None,
            approval_url: None,
            needs_approval: false,
            checked_at: None,
        }
    }
}

impl From<UserRecord> for SignerStateResponse {
    fn from(user: UserRecord) -> Self {
        Self {
            signer_uuid: user.signer_uuid,
            status: user.signer_status,
            approval_url: user.signer_approval_url,
            needs_approval: user.needs_signer_approval,
            checked_at: user.signer_checked_at,
        }
    }
}

#[derive(Deserialize)]
struct SignerQuery {
    live: Option<bool>,
}

/// GET /signer - Current signer state, optionally revalidated against Neynar
/// with ?live=true
async fn get_signer(
    State(state): State<Arc<AppState>>,
    AuthUser(fid): AuthUser,
    Query(query): Query<SignerQuery>,
) -> Result<Json<SignerStateResponse>, StatusCode> {
    let user = users::get_user_by_fid(&state.db, fid)
        .await
        .log_500("Get user error")?;

    let Some(user) = user else {
        return Ok(Json(SignerStateResponse::none_connected()));
    };

    if query.live.unwrap_or(false) {
        if let Some(signer_uuid) = user.signer_uuid.clone() {
            let status = state
                .neynar
                .signer_status(&signer_uuid)
                .await
                .log_502("Live signer check failed")?;

            users::update_signer_status(&state.db, fid, status)
                .await
                .log_500("Update signer status error")?;

            let refreshed = users::get_user_by_fid(&state.db, fid)
                .await
                .log_500("Get user error")?
                .ok_or(StatusCode::NOT_FOUND)?;

            return Ok(Json(refreshed.into()));
        }
    }

    Ok(Json(user.into()))
}

/// POST /signer - Connect a signer for the account.
///
/// Reuses the signer already on file when it is approved or still awaiting
/// approval; otherwise registers a fresh one with Neynar and returns 201 with
/// the approval link the account holder has to visit.
async fn provision_signer(
    State(state): State<Arc<AppState>>,
    AuthUser(fid): AuthUser,
) -> Result<(StatusCode, Json<SignerStateResponse>), StatusCode> {
    let user = users::upsert_user(&state.db, fid)
        .await
        .log_500("Upsert user error")?;

    if user.signer_uuid.is_some() {
        match user.signer_status {
            Some(SignerStatus::Approved) | Some(SignerStatus::Pending) => {
                return Ok((StatusCode::OK, Json(user.into())));
            }
            _ => {}
        }
    }

    let signer = state
        .neynar
        .create_signer()
        .await
        .log_502("Create signer failed")?;

    users::save_signer(
        &state.db,
        fid,
        &signer.signer_uuid,
        signer.status,
        signer.approval_url.as_deref(),
    )
    .await
    .log_500("Save signer error")?;

    let user = users::get_user_by_fid(&state.db, fid)
        .await
        .log_500("Get user error")?
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok((StatusCode::CREATED, Json(user.into())))
}
