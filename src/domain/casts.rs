//! Scheduled cast domain - DB queries for the publish queue
//!
//! All functions use the generic Executor pattern, allowing them to work with
//! both `&PgPool` (for standalone queries) and `&mut PgConnection` (for transactions).

use chrono::{DateTime, Utc};
use sqlx::{Executor, Postgres};
use uuid::Uuid;

use crate::models::ScheduledCast;

/// Parsed status filter enum for type-safe query building
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Pending,
    Posted,
    All,
}

impl StatusFilter {
    pub fn from_str(s: Option<&str>) -> Self {
        match s {
            Some("pending") => StatusFilter::Pending,
            Some("posted") => StatusFilter::Posted,
            _ => StatusFilter::All,
        }
    }

    /// Returns SQL WHERE clause fragment for filtering by post status
    fn where_clause(&self) -> &'static str {
        match self {
            StatusFilter::Pending => "AND posted = FALSE",
            StatusFilter::Posted => "AND posted = TRUE",
            StatusFilter::All => "",
        }
    }
}

/// Queue a new cast for future publication
pub async fn create_cast<'e, E>(
    executor: E,
    fid: i64,
    content: &str,
    channel_id: Option<&str>,
    scheduled_at: DateTime<Utc>,
    media_urls: &[String],
) -> Result<ScheduledCast, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        INSERT INTO scheduled_casts (fid, content, channel_id, scheduled_at, media_urls)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, fid, content, channel_id, scheduled_at, media_urls, posted,
                  posted_at, result, error, claimed_at, created_at, updated_at
        "#,
    )
    .bind(fid)
    .bind(content)
    .bind(channel_id)
    .bind(scheduled_at)
    .bind(media_urls.to_vec())
    .fetch_one(executor)
    .await
}

/// Count an account's casts for pagination
pub async fn count_casts<'e, E>(
    executor: E,
    fid: i64,
    status_filter: Option<&str>,
) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let filter = StatusFilter::from_str(status_filter);
    let query = format!(
        "SELECT COUNT(*) FROM scheduled_casts WHERE fid = $1 {}",
        filter.where_clause()
    );

    let (count,): (i64,) = sqlx::query_as(&query)
        .bind(fid)
        .fetch_one(executor)
        .await?;

    Ok(count)
}

/// List an account's casts with pagination, soonest due first
pub async fn list_casts_paginated<'e, E>(
    executor: E,
    fid: i64,
    status_filter: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<ScheduledCast>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let filter = StatusFilter::from_str(status_filter);
    let query = format!(
        r#"SELECT id, fid, content, channel_id, scheduled_at, media_urls, posted,
                  posted_at, result, error, claimed_at, created_at, updated_at
           FROM scheduled_casts
           WHERE fid = $1 {}
           ORDER BY scheduled_at ASC
           LIMIT $2 OFFSET $3"#,
        filter.where_clause()
    );

    sqlx::query_as(&query)
        .bind(fid)
        .bind(limit)
        .bind(offset)
        .fetch_all(executor)
        .await
}

/// Get a cast by ID, scoped to its owner
pub async fn get_cast<'e, E>(
    executor: E,
    id: Uuid,
    fid: i64,
) -> Result<Option<ScheduledCast>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT id, fid, content, channel_id, scheduled_at, media_urls, posted,
               posted_at, result, error, claimed_at, created_at, updated_at
        FROM scheduled_casts
        WHERE id = $1 AND fid = $2
        "#,
    )
    .bind(id)
    .bind(fid)
    .fetch_optional(executor)
    .await
}

/// Update an unposted cast's editable fields. Passing None keeps a field as is.
/// Any stale dispatch error is cleared so the edited cast gets a clean retry.
/// Returns false when the cast was already posted (or does not exist).
pub async fn update_cast<'e, E>(
    executor: E,
    id: Uuid,
    fid: i64,
    content: Option<&str>,
    channel_id: Option<&str>,
    scheduled_at: Option<DateTime<Utc>>,
    media_urls: Option<&[String]>,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE scheduled_casts
        SET content = COALESCE($3, content),
            channel_id = COALESCE($4, channel_id),
            scheduled_at = COALESCE($5, scheduled_at),
            media_urls = COALESCE($6, media_urls),
            error = NULL,
            updated_at = NOW()
        WHERE id = $1 AND fid = $2 AND posted = FALSE
        "#,
    )
    .bind(id)
    .bind(fid)
    .bind(content)
    .bind(channel_id)
    .bind(scheduled_at)
    .bind(media_urls.map(|m| m.to_vec()))
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Delete an unposted cast. Returns false when it was already posted
/// (or does not exist); published casts are immutable history.
pub async fn delete_cast<'e, E>(executor: E, id: Uuid, fid: i64) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        DELETE FROM scheduled_casts
        WHERE id = $1 AND fid = $2 AND posted = FALSE
        "#,
    )
    .bind(id)
    .bind(fid)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Claim the batch of due casts for one dispatch pass.
///
/// A row is due when its scheduled time has passed, it is not posted, any
/// previous failure has aged past the cooldown, and no other dispatcher holds
/// a live claim on it. FOR UPDATE SKIP LOCKED plus the claimed_at lease keeps
/// concurrent passes from double-publishing. Claiming leaves updated_at alone
/// since that column drives the failure cooldown.
pub async fn claim_due_casts<'e, E>(
    executor: E,
    limit: i64,
    cooldown_hours: i64,
    lease_seconds: i64,
) -> Result<Vec<ScheduledCast>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        WITH due AS (
            SELECT id
            FROM scheduled_casts
            WHERE posted = FALSE
              AND scheduled_at <= NOW()
              AND (
                  error IS NULL
                  OR updated_at < NOW() - ($1::text || ' hours')::interval
              )
              AND (
                  claimed_at IS NULL
                  OR claimed_at < NOW() - ($2::text || ' seconds')::interval
              )
            ORDER BY scheduled_at ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
        ),
        claimed AS (
            UPDATE scheduled_casts c
            SET claimed_at = NOW()
            FROM due
            WHERE c.id = due.id
            RETURNING c.id, c.fid, c.content, c.channel_id, c.scheduled_at,
                      c.media_urls, c.posted, c.posted_at, c.result, c.error,
                      c.claimed_at, c.created_at, c.updated_at
        )
        SELECT * FROM claimed ORDER BY scheduled_at ASC
        "#,
    )
    .bind(cooldown_hours)
    .bind(lease_seconds)
    .bind(limit)
    .fetch_all(executor)
    .await
}

/// Mark a cast as posted (atomic - only succeeds if not already posted).
/// Returns true if the update was applied, false if already posted.
pub async fn mark_cast_posted<'e, E>(
    executor: E,
    id: Uuid,
    result: &serde_json::Value,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let updated = sqlx::query(
        r#"
        UPDATE scheduled_casts
        SET posted = TRUE,
            posted_at = NOW(),
            result = $1,
            error = NULL,
            claimed_at = NULL,
            updated_at = NOW()
        WHERE id = $2 AND posted = FALSE
        "#,
    )
    .bind(result)
    .bind(id)
    .execute(executor)
    .await?;

    Ok(updated.rows_affected() > 0)
}

/// Record a dispatch failure on the row and release the claim.
/// Touching updated_at starts the retry cooldown.
pub async fn record_cast_error<'e, E>(
    executor: E,
    id: Uuid,
    message: &str,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE scheduled_casts
        SET error = $1,
            claimed_at = NULL,
            updated_at = NOW()
        WHERE id = $2 AND posted = FALSE
        "#,
    )
    .bind(message)
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}
