//! User domain - DB queries for accounts and their signers
//!
//! All functions use the generic Executor pattern, allowing them to work with
//! both `&PgPool` (for standalone queries) and `&mut PgConnection` (for transactions).

use sqlx::{Executor, Postgres};

use crate::models::{SignerStatus, UserRecord};

/// Insert the account row for a fid if it does not exist yet
pub async fn upsert_user<'e, E>(executor: E, fid: i64) -> Result<UserRecord, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        INSERT INTO users (fid)
        VALUES ($1)
        ON CONFLICT (fid) DO UPDATE SET updated_at = NOW()
        RETURNING id, fid, signer_uuid, signer_status, signer_approval_url,
                  needs_signer_approval, signer_checked_at, created_at, updated_at
        "#,
    )
    .bind(fid)
    .fetch_one(executor)
    .await
}

pub async fn get_user_by_fid<'e, E>(executor: E, fid: i64) -> Result<Option<UserRecord>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT id, fid, signer_uuid, signer_status, signer_approval_url,
               needs_signer_approval, signer_checked_at, created_at, updated_at
        FROM users
        WHERE fid = $1
        "#,
    )
    .bind(fid)
    .fetch_optional(executor)
    .await
}

/// Store a freshly registered signer on the account row
pub async fn save_signer<'e, E>(
    executor: E,
    fid: i64,
    signer_uuid: &str,
    status: SignerStatus,
    approval_url: Option<&str>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE users
        SET signer_uuid = $2,
            signer_status = $3,
            signer_approval_url = $4,
            needs_signer_approval = $5,
            signer_checked_at = NOW(),
            updated_at = NOW()
        WHERE fid = $1
        "#,
    )
    .bind(fid)
    .bind(signer_uuid)
    .bind(status)
    .bind(approval_url)
    .bind(!status.is_approved())
    .execute(executor)
    .await?;
    Ok(())
}

/// Switch the account over to an already-approved signer
pub async fn adopt_signer<'e, E>(executor: E, fid: i64, signer_uuid: &str) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE users
        SET signer_uuid = $2,
            signer_status = 'approved',
            signer_approval_url = NULL,
            needs_signer_approval = FALSE,
            signer_checked_at = NOW(),
            updated_at = NOW()
        WHERE fid = $1
        "#,
    )
    .bind(fid)
    .bind(signer_uuid)
    .execute(executor)
    .await?;
    Ok(())
}

/// Record the status Neynar reported for the signer currently on file
pub async fn update_signer_status<'e, E>(
    executor: E,
    fid: i64,
    status: SignerStatus,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE users
        SET signer_status = $2,
            needs_signer_approval = $3,
            signer_checked_at = NOW(),
            updated_at = NOW()
        WHERE fid = $1
        "#,
    )
    .bind(fid)
    .bind(status)
    .bind(!status.is_approved())
    .execute(executor)
    .await?;
    Ok(())
}

/// Flag the account after Neynar rejected its signer mid-publish
pub async fn flag_signer_needs_approval<'e, E>(executor: E, fid: i64) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE users
        SET needs_signer_approval = TRUE,
            signer_status = 'pending',
            updated_at = NOW()
        WHERE fid = $1
        "#,
    )
    .bind(fid)
    .execute(executor)
    .await?;
    Ok(())
}
