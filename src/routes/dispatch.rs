//! Manual dispatch trigger for external schedulers

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
};
use std::sync::Arc;

use crate::AppState;
use crate::dispatch::{DispatchSummary, Dispatcher, PgStore};
use crate::services::error::LogErr;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/internal/dispatch", post(trigger_dispatch))
}

/// POST /internal/dispatch - run one dispatch pass right now
///
/// Lets an external cron service drive publishing when the embedded worker is
/// disabled. Guarded by a shared secret rather than a user session.
async fn trigger_dispatch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<DispatchSummary>, StatusCode> {
    if !state.dispatch_enabled {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let Some(secret) = state.dispatch_secret.as_deref() else {
        // No secret configured means no way to authorize the trigger
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;
    if !secrets_match(presented, secret) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let dispatcher = Dispatcher::new(
        PgStore::new(state.db.clone()),
        state.neynar.clone(),
        state.dispatch.clone(),
    );
    let summary = dispatcher
        .run_once()
        .await
        .log_500("Manual dispatch pass failed")?;

    println!(
        "[dispatch] Manual pass complete: {} processed, {} published, {} blocked, {} failed",
        summary.processed, summary.published, summary.blocked, summary.failed
    );

    Ok(Json(summary))
}

/// Compare the presented secret without short-circuiting on the first
/// mismatched byte, so response timing does not leak how much of it was right
fn secrets_match(presented: &str, expected: &str) -> bool {
    if presented.len() != expected.len() {
        return false;
    }
    presented
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_secrets_are_accepted() {
        assert!(secrets_match("trigger-secret", "trigger-secret"));
    }

    #[test]
    fn wrong_secrets_are_rejected_at_any_length() {
        // Same length, one byte off
        assert!(!secrets_match("trigger-secreX", "trigger-secret"));
        assert!(!secrets_match("trigger", "trigger-secret"));
        assert!(!secrets_match("trigger-secret-extra", "trigger-secret"));
        assert!(!secrets_match("", "trigger-secret"));
    }
}
