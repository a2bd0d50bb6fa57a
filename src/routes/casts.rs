//! Scheduled cast endpoints (/casts/*)

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::AppState;
use crate::constants::{DEFAULT_PAGE_SIZE, MAX_CAST_EMBEDS, MAX_CAST_LENGTH, MAX_PAGE_SIZE};
use crate::domain::{casts, users};
use crate::models::ScheduledCast;
use crate::routes::auth::AuthUser;
use crate::services::error::LogErr;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/casts", get(list_casts).post(create_cast))
        .route(
            "/casts/{id}",
            get(get_cast).patch(update_cast).delete(delete_cast),
        )
}

/// Storage operations behind the cast endpoints.
///
/// Production goes through [`PgCasts`]; router tests swap in an in-memory
/// fake with the same guarded-write semantics.
#[async_trait]
pub trait CastsStore: Send + Sync {
    /// Create the account row if it is missing
    async fn ensure_user(&self, fid: i64) -> Result<(), sqlx::Error>;

    async fn create_cast(
        &self,
        fid: i64,
        content: &str,
        channel_id: Option<&str>,
        scheduled_at: DateTime<Utc>,
        media_urls: &[String],
    ) -> Result<ScheduledCast, sqlx::Error>;

    async fn count_casts(
        &self,
        fid: i64,
        status_filter: Option<&str>,
    ) -> Result<i64, sqlx::Error>;

    async fn list_casts_paginated(
        &self,
        fid: i64,
        status_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ScheduledCast>, sqlx::Error>;

    async fn get_cast(&self, id: Uuid, fid: i64) -> Result<Option<ScheduledCast>, sqlx::Error>;

    /// Returns false when the cast was already posted (or does not exist)
    async fn update_cast(
        &self,
        id: Uuid,
        fid: i64,
        content: Option<&str>,
        channel_id: Option<&str>,
        scheduled_at: Option<DateTime<Utc>>,
        media_urls: Option<&[String]>,
    ) -> Result<bool, sqlx::Error>;

    /// Returns false when the cast was already posted (or does not exist)
    async fn delete_cast(&self, id: Uuid, fid: i64) -> Result<bool, sqlx::Error>;
}

/// Postgres-backed store used by the live router
#[derive(Clone)]
pub struct PgCasts {
    pool: PgPool,
}

impl PgCasts {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CastsStore for PgCasts {
    async fn ensure_user(&self, fid: i64) -> Result<(), sqlx::Error> {
        users::upsert_user(&self.pool, fid).await.map(|_| ())
    }

    async fn create_cast(
        &self,
        fid: i64,
        content: &str,
        channel_id: Option<&str>,
        scheduled_at: DateTime<Utc>,
        media_urls: &[String],
    ) -> Result<ScheduledCast, sqlx::Error> {
        casts::create_cast(&self.pool, fid, content, channel_id, scheduled_at, media_urls).await
    }

    async fn count_casts(
        &self,
        fid: i64,
        status_filter: Option<&str>,
    ) -> Result<i64, sqlx::Error> {
        casts::count_casts(&self.pool, fid, status_filter).await
    }

    async fn list_casts_paginated(
        &self,
        fid: i64,
        status_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ScheduledCast>, sqlx::Error> {
        casts::list_casts_paginated(&self.pool, fid, status_filter, limit, offset).await
    }

    async fn get_cast(&self, id: Uuid, fid: i64) -> Result<Option<ScheduledCast>, sqlx::Error> {
        casts::get_cast(&self.pool, id, fid).await
    }

    async fn update_cast(
        &self,
        id: Uuid,
        fid: i64,
        content: Option<&str>,
        channel_id: Option<&str>,
        scheduled_at: Option<DateTime<Utc>>,
        media_urls: Option<&[String]>,
    ) -> Result<bool, sqlx::Error> {
        casts::update_cast(
            &self.pool,
            id,
            fid,
            content,
            channel_id,
            scheduled_at,
            media_urls,
        )
        .await
    }

    async fn delete_cast(&self, id: Uuid, fid: i64) -> Result<bool, sqlx::Error> {
        casts::delete_cast(&self.pool, id, fid).await
    }
}

#[derive(Serialize)]
struct CastResponse {
    id: Uuid,
    content: String,
    channel_id: Option<String>,
    scheduled_at: DateTime<Utc>,
    media_urls: Vec<String>,
    posted: bool,
    posted_at: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ScheduledCast> for CastResponse {
    fn from(cast: ScheduledCast) -> Self {
        Self {
            id: cast.id,
            content: cast.content,
            channel_id: cast.channel_id,
            scheduled_at: cast.scheduled_at,
            media_urls: cast.media_urls,
            posted: cast.posted,
            posted_at: cast.posted_at,
            result: cast.result,
            error: cast.error,
            created_at: cast.created_at,
            updated_at: cast.updated_at,
        }
    }
}

#[derive(Deserialize)]
struct CreateCastRequest {
    content: String,
    channel_id: Option<String>,
    scheduled_at: DateTime<Utc>,
    #[serde(default)]
    media_urls: Vec<String>,
}

/// POST /casts - Queue a cast for future publication
async fn create_cast(
    State(state): State<Arc<AppState>>,
    AuthUser(fid): AuthUser,
    Json(req): Json<CreateCastRequest>,
) -> Result<(StatusCode, Json<CastResponse>), StatusCode> {
    validate_content(&req.content)?;
    validate_media_urls(&req.media_urls)?;
    validate_schedule(req.scheduled_at)?;

    // Make sure the account row exists so dispatch can find its signer later
    state
        .casts
        .ensure_user(fid)
        .await
        .log_500("Upsert user error")?;

    let cast = state
        .casts
        .create_cast(
            fid,
            &req.content,
            req.channel_id.as_deref(),
            req.scheduled_at,
            &req.media_urls,
        )
        .await
        .log_500("Create cast error")?;

    Ok((StatusCode::CREATED, Json(cast.into())))
}

#[derive(Deserialize)]
struct ListCastsQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    status: Option<String>,
}

#[derive(Serialize)]
struct ListCastsResponse {
    casts: Vec<CastResponse>,
    total: i64,
    has_more: bool,
}

/// GET /casts - List the account's casts with pagination
async fn list_casts(
    State(state): State<Arc<AppState>>,
    AuthUser(fid): AuthUser,
    Query(query): Query<ListCastsQuery>,
) -> Result<Json<ListCastsResponse>, StatusCode> {
    let (limit, offset) = page_params(query.limit, query.offset);
    let status_filter = query.status.as_deref();

    let total = state
        .casts
        .count_casts(fid, status_filter)
        .await
        .log_500("Count casts error")?;

    let result = state
        .casts
        .list_casts_paginated(fid, status_filter, limit, offset)
        .await
        .log_500("List casts error")?;

    let has_more = offset + (result.len() as i64) < total;

    Ok(Json(ListCastsResponse {
        casts: result.into_iter().map(CastResponse::from).collect(),
        total,
        has_more,
    }))
}

/// GET /casts/:id - Get one cast
async fn get_cast(
    State(state): State<Arc<AppState>>,
    AuthUser(fid): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<CastResponse>, StatusCode> {
    let cast = state
        .casts
        .get_cast(id, fid)
        .await
        .log_500("Get cast error")?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(cast.into()))
}

#[derive(Deserialize)]
struct UpdateCastRequest {
    content: Option<String>,
    channel_id: Option<String>,
    scheduled_at: Option<DateTime<Utc>>,
    media_urls: Option<Vec<String>>,
}

/// PATCH /casts/:id - Edit an unposted cast
async fn update_cast(
    State(state): State<Arc<AppState>>,
    AuthUser(fid): AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateCastRequest>,
) -> Result<Json<CastResponse>, StatusCode> {
    if let Some(content) = &req.content {
        validate_content(content)?;
    }
    if let Some(urls) = &req.media_urls {
        validate_media_urls(urls)?;
    }
    if let Some(scheduled_at) = req.scheduled_at {
        validate_schedule(scheduled_at)?;
    }

    let existing = state
        .casts
        .get_cast(id, fid)
        .await
        .log_500("Get cast error")?
        .ok_or(StatusCode::NOT_FOUND)?;

    // Published casts are immutable history
    if existing.posted {
        return Err(StatusCode::CONFLICT);
    }

    let updated = state
        .casts
        .update_cast(
            id,
            fid,
            req.content.as_deref(),
            req.channel_id.as_deref(),
            req.scheduled_at,
            req.media_urls.as_deref(),
        )
        .await
        .log_500("Update cast error")?;

    // The dispatcher may have published it between the read and the write
    if !updated {
        return Err(StatusCode::CONFLICT);
    }

    let cast = state
        .casts
        .get_cast(id, fid)
        .await
        .log_500("Get cast error")?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(cast.into()))
}

/// DELETE /casts/:id - Remove an unposted cast from the queue
async fn delete_cast(
    State(state): State<Arc<AppState>>,
    AuthUser(fid): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    let existing = state
        .casts
        .get_cast(id, fid)
        .await
        .log_500("Get cast error")?
        .ok_or(StatusCode::NOT_FOUND)?;

    if existing.posted {
        return Err(StatusCode::CONFLICT);
    }

    let deleted = state
        .casts
        .delete_cast(id, fid)
        .await
        .log_500("Delete cast error")?;

    if !deleted {
        return Err(StatusCode::CONFLICT);
    }

    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Request validation
// ============================================================================

/// Cast length the way the protocol counts it (UTF-16 code units)
pub(crate) fn cast_length(text: &str) -> usize {
    text.encode_utf16().count()
}

fn validate_content(content: &str) -> Result<(), StatusCode> {
    if content.trim().is_empty() {
        eprintln!("[casts] Rejected empty content");
        return Err(StatusCode::BAD_REQUEST);
    }

    let length = cast_length(content);
    if length > MAX_CAST_LENGTH {
        eprintln!(
            "[casts] Rejected content: {} UTF-16 units (max {})",
            length, MAX_CAST_LENGTH
        );
        return Err(StatusCode::BAD_REQUEST);
    }

    Ok(())
}

fn validate_media_urls(urls: &[String]) -> Result<(), StatusCode> {
    if urls.len() > MAX_CAST_EMBEDS {
        eprintln!(
            "[casts] Rejected media: {} urls (max {})",
            urls.len(),
            MAX_CAST_EMBEDS
        );
        return Err(StatusCode::BAD_REQUEST);
    }

    for raw in urls {
        let parsed = url::Url::parse(raw).map_err(|e| {
            eprintln!("[casts] Rejected media url {:?}: {}", raw, e);
            StatusCode::BAD_REQUEST
        })?;

        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            eprintln!("[casts] Rejected media url {:?}: not http(s)", raw);
            return Err(StatusCode::BAD_REQUEST);
        }
    }

    Ok(())
}

fn validate_schedule(scheduled_at: DateTime<Utc>) -> Result<(), StatusCode> {
    if scheduled_at <= Utc::now() {
        eprintln!("[casts] Rejected schedule time in the past: {}", scheduled_at);
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(())
}

/// Clamp client paging inputs to sane bounds before they reach SQL
pub(crate) fn page_params(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(0, MAX_PAGE_SIZE);
    let offset = offset.unwrap_or(0).max(0);
    (limit, offset)
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn cast_length_counts_utf16_units() {
        assert_eq!(cast_length("hello"), 5);
        // Astral-plane emoji take two UTF-16 units each
        assert_eq!(cast_length("🎩"), 2);
        assert_eq!(cast_length("gm 🎩"), 5);
    }

    #[test]
    fn content_at_the_limit_is_accepted() {
        let content = "a".repeat(MAX_CAST_LENGTH);
        assert!(validate_content(&content).is_ok());
        let over = "a".repeat(MAX_CAST_LENGTH + 1);
        assert!(validate_content(&over).is_err());
    }

    #[test]
    fn blank_content_is_rejected() {
        assert!(validate_content("").is_err());
        assert!(validate_content("   \n ").is_err());
    }

    #[test]
    fn media_urls_must_be_http() {
        assert!(validate_media_urls(&["https://example.com/cat.png".to_string()]).is_ok());
        assert!(validate_media_urls(&["ftp://example.com/cat.png".to_string()]).is_err());
        assert!(validate_media_urls(&["not a url".to_string()]).is_err());
    }

    #[test]
    fn media_url_count_is_capped() {
        let urls: Vec<String> = (0..3)
            .map(|i| format!("https://example.com/{}.png", i))
            .collect();
        assert!(validate_media_urls(&urls).is_err());
    }

    #[test]
    fn schedule_must_be_in_the_future() {
        assert!(validate_schedule(Utc::now() + Duration::minutes(5)).is_ok());
        assert!(validate_schedule(Utc::now() - Duration::minutes(5)).is_err());
    }

    #[test]
    fn paging_inputs_are_clamped() {
        assert_eq!(page_params(None, None), (DEFAULT_PAGE_SIZE, 0));
        assert_eq!(page_params(Some(10), Some(20)), (10, 20));
        // Negative values would be rejected by Postgres; clamp them instead
        assert_eq!(page_params(Some(-1), Some(-5)), (0, 0));
        assert_eq!(page_params(Some(10_000), Some(3)), (MAX_PAGE_SIZE, 3));
    }
}
