//! Scheduled cast dispatch background job using apalis
//!
//! Runs as a scheduled cron job that claims due casts and publishes them
//! through Neynar, one row at a time so a single bad cast never stalls the
//! rest of the queue.

use apalis::prelude::*;
use apalis_cron::{CronStream, Schedule};
use apalis_sql::postgres::PostgresStorage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::constants::{
    BASE_RETRY_DELAY_MS, DEFAULT_CLAIM_LEASE_SECONDS, DEFAULT_DISPATCH_BATCH_SIZE,
    DEFAULT_DISPATCH_CRON_SECONDS, DEFAULT_RETRY_COOLDOWN_HOURS, MAX_API_ATTEMPTS,
    MAX_CAST_EMBEDS,
};
use crate::domain::{casts, users};
use crate::models::{ScheduledCast, SignerStatus, UserRecord};
use crate::services::neynar::{
    FarcasterApi, NeynarClient, NeynarError, NewSigner, backoff_delay_ms,
};
use crate::services::signer::{SignerError, SignerValidation, ensure_usable_signer};

/// Job input - marker for batch processing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchJob {
    pub scheduled_at: chrono::DateTime<chrono::Utc>,
}

impl From<chrono::DateTime<chrono::Utc>> for DispatchJob {
    fn from(dt: chrono::DateTime<chrono::Utc>) -> Self {
        DispatchJob { scheduled_at: dt }
    }
}

/// Shared context for dispatch passes
#[derive(Clone)]
pub struct DispatchContext {
    pub pool: PgPool,
    pub neynar: NeynarClient,
    pub config: DispatchConfig,
}

/// Job handler - runs one dispatch pass
/// Always returns Ok - individual cast failures are recorded on their rows
async fn process_dispatch_job(_job: DispatchJob, ctx: Data<DispatchContext>) -> Result<(), Error> {
    let dispatcher = Dispatcher::new(
        PgStore::new(ctx.pool.clone()),
        ctx.neynar.clone(),
        ctx.config.clone(),
    );

    match dispatcher.run_once().await {
        Ok(summary) => {
            if summary.processed > 0 {
                println!(
                    "[dispatch] Pass complete: {} processed, {} published, {} blocked, {} failed",
                    summary.processed, summary.published, summary.blocked, summary.failed
                );
            }
        }
        Err(e) => {
            eprintln!("[dispatch] Pass error (will retry next tick): {}", e);
        }
    }
    Ok(())
}

/// Start the dispatch worker
pub async fn run_dispatch_worker(pool: PgPool, neynar: NeynarClient, config: DispatchConfig) {
    let cron_seconds = dispatch_cron_seconds();
    let batch_size = config.batch_size;
    let schedule_expr = format!("*/{} * * * * *", cron_seconds);

    let ctx = DispatchContext {
        pool: pool.clone(),
        neynar,
        config,
    };

    // Run apalis migrations
    PostgresStorage::setup(&pool)
        .await
        .expect("Failed to set up apalis storage");

    let storage: PostgresStorage<DispatchJob> = PostgresStorage::new(pool.clone());
    let schedule = Schedule::from_str(&schedule_expr).expect("Invalid dispatch worker schedule");
    let cron = CronStream::new(schedule);
    let backend = cron.pipe_to_storage(storage);

    println!(
        "[dispatch] Apalis worker starting (every {}s, batch {})",
        cron_seconds, batch_size
    );

    let worker = WorkerBuilder::new("dispatch-worker")
        .data(ctx)
        .backend(backend)
        .build_fn(process_dispatch_job);

    Monitor::new()
        .register(worker)
        .run()
        .await
        .expect("Dispatch worker monitor failed");
}

/// Tuning knobs for a dispatch pass
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub batch_size: i64,
    pub retry_cooldown_hours: i64,
    pub claim_lease_seconds: i64,
    /// Trust the stored signer status instead of revalidating against Neynar
    pub skip_live_check: bool,
    pub max_api_attempts: u32,
    pub base_retry_delay_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_DISPATCH_BATCH_SIZE,
            retry_cooldown_hours: DEFAULT_RETRY_COOLDOWN_HOURS,
            claim_lease_seconds: DEFAULT_CLAIM_LEASE_SECONDS,
            skip_live_check: false,
            max_api_attempts: MAX_API_ATTEMPTS,
            base_retry_delay_ms: BASE_RETRY_DELAY_MS,
        }
    }
}

impl DispatchConfig {
    /// Read tuning knobs from the environment, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            batch_size: dispatch_batch_size(),
            retry_cooldown_hours: retry_cooldown_hours(),
            claim_lease_seconds: claim_lease_seconds(),
            skip_live_check: env_flag("DISPATCH_SKIP_LIVE_SIGNER_CHECK"),
            ..Self::default()
        }
    }
}

/// Counters for one dispatch pass
#[derive(Debug, Default, Clone, Serialize)]
pub struct DispatchSummary {
    pub processed: u32,
    pub published: u32,
    pub blocked: u32,
    pub failed: u32,
}

enum RowOutcome {
    Published,
    /// Waiting on a human (signer approval), not worth retrying blindly
    Blocked,
    Failed,
    /// Someone else already published it
    Skipped,
}

/// Storage operations the dispatcher needs.
///
/// Production goes through [`PgStore`]; tests swap in an in-memory fake with
/// the same claim semantics.
#[async_trait]
pub trait DispatchStore: Send + Sync {
    /// Claim up to `limit` due casts, oldest scheduled first
    async fn claim_due_casts(
        &self,
        limit: i64,
        cooldown_hours: i64,
        lease_seconds: i64,
    ) -> Result<Vec<ScheduledCast>, sqlx::Error>;

    async fn get_user_by_fid(&self, fid: i64) -> Result<Option<UserRecord>, sqlx::Error>;

    /// Returns false when the cast was already posted by someone else
    async fn mark_cast_posted(
        &self,
        id: Uuid,
        result: &serde_json::Value,
    ) -> Result<bool, sqlx::Error>;

    async fn record_cast_error(&self, id: Uuid, message: &str) -> Result<(), sqlx::Error>;

    async fn save_new_signer(&self, fid: i64, signer: &NewSigner) -> Result<(), sqlx::Error>;

    async fn adopt_signer(&self, fid: i64, signer_uuid: &str) -> Result<(), sqlx::Error>;

    async fn flag_signer_needs_approval(&self, fid: i64) -> Result<(), sqlx::Error>;
}

/// Postgres-backed store used by the worker and the manual trigger route
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DispatchStore for PgStore {
    async fn claim_due_casts(
        &self,
        limit: i64,
        cooldown_hours: i64,
        lease_seconds: i64,
    ) -> Result<Vec<ScheduledCast>, sqlx::Error> {
        casts::claim_due_casts(&self.pool, limit, cooldown_hours, lease_seconds).await
    }

    async fn get_user_by_fid(&self, fid: i64) -> Result<Option<UserRecord>, sqlx::Error> {
        users::get_user_by_fid(&self.pool, fid).await
    }

    async fn mark_cast_posted(
        &self,
        id: Uuid,
        result: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        casts::mark_cast_posted(&self.pool, id, result).await
    }

    async fn record_cast_error(&self, id: Uuid, message: &str) -> Result<(), sqlx::Error> {
        casts::record_cast_error(&self.pool, id, message).await
    }

    async fn save_new_signer(&self, fid: i64, signer: &NewSigner) -> Result<(), sqlx::Error> {
        users::save_signer(
            &self.pool,
            fid,
            &signer.signer_uuid,
            signer.status,
            signer.approval_url.as_deref(),
        )
        .await
    }

    async fn adopt_signer(&self, fid: i64, signer_uuid: &str) -> Result<(), sqlx::Error> {
        users::adopt_signer(&self.pool, fid, signer_uuid).await
    }

    async fn flag_signer_needs_approval(&self, fid: i64) -> Result<(), sqlx::Error> {
        users::flag_signer_needs_approval(&self.pool, fid).await
    }
}

/// Publishes claimed casts one at a time, isolating failures per row
pub struct Dispatcher<S, A> {
    store: S,
    api: A,
    config: DispatchConfig,
}

impl<S, A> Dispatcher<S, A>
where
    S: DispatchStore,
    A: FarcasterApi,
{
    pub fn new(store: S, api: A, config: DispatchConfig) -> Self {
        Self { store, api, config }
    }

    /// Claim the due batch and publish it in scheduled order.
    /// Only the claim itself can fail; row failures land on the rows.
    pub async fn run_once(&self) -> Result<DispatchSummary, sqlx::Error> {
        let claimed = self
            .store
            .claim_due_casts(
                self.config.batch_size,
                self.config.retry_cooldown_hours,
                self.config.claim_lease_seconds,
            )
            .await?;

        let mut summary = DispatchSummary::default();
        // Signers already validated against Neynar in this pass
        let mut validated: HashSet<String> = HashSet::new();

        for cast in &claimed {
            summary.processed += 1;
            match self.process_cast(cast, &mut validated).await {
                RowOutcome::Published => summary.published += 1,
                RowOutcome::Blocked => summary.blocked += 1,
                RowOutcome::Failed => summary.failed += 1,
                RowOutcome::Skipped => {}
            }
        }

        Ok(summary)
    }

    async fn process_cast(
        &self,
        cast: &ScheduledCast,
        validated: &mut HashSet<String>,
    ) -> RowOutcome {
        // Should not happen given the claim query
        if cast.posted {
            return RowOutcome::Skipped;
        }

        let user = match self.store.get_user_by_fid(cast.fid).await {
            Ok(user) => user,
            Err(e) => {
                self.write_row_error(cast.id, &format!("account lookup failed: {}", e))
                    .await;
                return RowOutcome::Failed;
            }
        };

        let Some(user) = user else {
            self.write_row_error(
                cast.id,
                &format!("no account on file for fid {}; connect the account first", cast.fid),
            )
            .await;
            return RowOutcome::Failed;
        };

        let Some(claimed_signer) = user.signer_uuid.clone() else {
            self.write_row_error(
                cast.id,
                "no signer on file; connect a signer before this cast can go out",
            )
            .await;
            return RowOutcome::Failed;
        };

        if user.signer_status != Some(SignerStatus::Approved) {
            let message = match &user.signer_approval_url {
                Some(url) => format!("signer awaiting approval; approve it at {}", url),
                None => "signer is not approved; reconnect it from the app".to_string(),
            };
            self.write_row_error(cast.id, &message).await;
            return RowOutcome::Blocked;
        }

        let skip_live = self.config.skip_live_check || validated.contains(&claimed_signer);
        let validation = match self
            .validate_with_retry(cast.fid, &claimed_signer, skip_live)
            .await
        {
            Ok(validation) => validation,
            Err(e) => {
                self.write_row_error(cast.id, &format!("signer check failed: {}", e))
                    .await;
                return RowOutcome::Failed;
            }
        };

        let signer_uuid = match validation {
            SignerValidation::NeedsApproval { approval_url, .. } => {
                let message = match approval_url {
                    Some(url) => format!("signer approval required; approve it at {}", url),
                    None => "signer approval required; check your Farcaster client".to_string(),
                };
                self.write_row_error(cast.id, &message).await;
                return RowOutcome::Blocked;
            }
            SignerValidation::Valid {
                signer_uuid,
                refreshed,
            } => {
                if refreshed {
                    println!(
                        "[dispatch] Refreshed signer for fid {} while publishing cast {}",
                        cast.fid, cast.id
                    );
                }
                signer_uuid
            }
        };
        validated.insert(signer_uuid.clone());

        let embeds = build_embeds(&cast.media_urls, &cast.content);

        match self.publish_with_retry(&signer_uuid, cast, &embeds).await {
            Ok(result) => match self.store.mark_cast_posted(cast.id, &result).await {
                Ok(true) => {
                    println!("[dispatch] Published cast {} for fid {}", cast.id, cast.fid);
                    RowOutcome::Published
                }
                Ok(false) => {
                    eprintln!("[dispatch] Cast {} was already marked posted", cast.id);
                    RowOutcome::Skipped
                }
                Err(e) => {
                    // The cast went out but the row still says pending
                    eprintln!(
                        "[dispatch] CRITICAL: published cast {} but failed to record it: {}",
                        cast.id, e
                    );
                    RowOutcome::Failed
                }
            },
            Err(NeynarError::AuthRejected(message)) => {
                if let Err(e) = self.store.flag_signer_needs_approval(cast.fid).await {
                    eprintln!("[dispatch] Failed to flag signer for fid {}: {}", cast.fid, e);
                }
                self.write_row_error(
                    cast.id,
                    &format!("signer was rejected while publishing; re-authorize it ({})", message),
                )
                .await;
                RowOutcome::Blocked
            }
            Err(e) => {
                self.write_row_error(cast.id, &e.to_string()).await;
                RowOutcome::Failed
            }
        }
    }

    /// Signer validation with the same bounded rate-limit retry as publishing.
    /// A throttled walk is retried whole; it makes no writes before failing.
    async fn validate_with_retry(
        &self,
        fid: i64,
        claimed_signer: &str,
        skip_live_check: bool,
    ) -> Result<SignerValidation, SignerError> {
        let mut attempt: u32 = 0;
        loop {
            match ensure_usable_signer(&self.store, &self.api, fid, claimed_signer, skip_live_check)
                .await
            {
                Err(SignerError::Api(NeynarError::RateLimited { retry_after_secs }))
                    if attempt + 1 < self.config.max_api_attempts =>
                {
                    let delay = backoff_delay_ms(
                        self.config.base_retry_delay_ms,
                        attempt,
                        retry_after_secs,
                    );
                    println!(
                        "[dispatch] Rate limited checking signer for fid {}, retrying in {}ms",
                        fid, delay
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Publish with bounded retries. Only rate limits are retried; every other
    /// error class surfaces immediately.
    async fn publish_with_retry(
        &self,
        signer_uuid: &str,
        cast: &ScheduledCast,
        embeds: &[String],
    ) -> Result<serde_json::Value, NeynarError> {
        let mut attempt: u32 = 0;
        loop {
            match self
                .api
                .publish_cast(signer_uuid, &cast.content, cast.channel_id.as_deref(), embeds)
                .await
            {
                Err(NeynarError::RateLimited { retry_after_secs })
                    if attempt + 1 < self.config.max_api_attempts =>
                {
                    let delay = backoff_delay_ms(
                        self.config.base_retry_delay_ms,
                        attempt,
                        retry_after_secs,
                    );
                    println!(
                        "[dispatch] Rate limited publishing cast {}, retrying in {}ms",
                        cast.id, delay
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn write_row_error(&self, id: Uuid, message: &str) {
        if let Err(e) = self.store.record_cast_error(id, message).await {
            eprintln!(
                "[dispatch] CRITICAL: failed to record error for cast {}: {}",
                id, e
            );
        }
    }
}

/// Assemble the embed list for publishing: explicit media URLs first, then any
/// URLs detected in the text, deduplicated and capped at the protocol limit.
pub(crate) fn build_embeds(media_urls: &[String], text: &str) -> Vec<String> {
    let mut embeds: Vec<String> = Vec::new();

    for url in media_urls {
        if embeds.len() >= MAX_CAST_EMBEDS {
            break;
        }
        if !embeds.iter().any(|e| e == url) {
            embeds.push(url.clone());
        }
    }

    for url in detect_urls(text) {
        if embeds.len() >= MAX_CAST_EMBEDS {
            break;
        }
        if !embeds.iter().any(|e| *e == url) {
            embeds.push(url);
        }
    }

    embeds
}

fn detect_urls(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter(|w| w.starts_with("http://") || w.starts_with("https://"))
        .map(|w| w.trim_end_matches(['.', ',', ';', ':', '!', '?', ')']).to_string())
        .collect()
}

fn dispatch_batch_size() -> i64 {
    env::var("DISPATCH_BATCH_SIZE")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_DISPATCH_BATCH_SIZE)
}

fn retry_cooldown_hours() -> i64 {
    env::var("DISPATCH_RETRY_COOLDOWN_HOURS")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_RETRY_COOLDOWN_HOURS)
}

fn claim_lease_seconds() -> i64 {
    env::var("DISPATCH_CLAIM_LEASE_SECONDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_CLAIM_LEASE_SECONDS)
}

fn dispatch_cron_seconds() -> u64 {
    env::var("DISPATCH_CRON_SECONDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > 0 && *v <= 59)
        .unwrap_or(DEFAULT_DISPATCH_CRON_SECONDS)
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}


#[cfg(test)]
mod tests {
    use super::test_support::{FakeApi, FakeStore, cast_at, due_cast, test_user};
    use super::*;
    use chrono::{Duration, Utc};

    fn approved_account(store: &FakeStore, api: &FakeApi, fid: i64) {
        store.add_user(test_user(fid, Some("signer-a"), Some(SignerStatus::Approved)));
        api.set_status("signer-a", SignerStatus::Approved);
    }

    fn dispatcher(
        store: &FakeStore,
        api: &FakeApi,
        config: DispatchConfig,
    ) -> Dispatcher<FakeStore, FakeApi> {
        Dispatcher::new(store.clone(), api.clone(), config)
    }

    #[tokio::test]
    async fn publishes_due_casts_oldest_first_up_to_the_batch_size() {
        let store = FakeStore::default();
        let api = FakeApi::default();
        approved_account(&store, &api, 42);

        let oldest = due_cast(42, 30);
        let middle = due_cast(42, 20);
        let newest = due_cast(42, 10);
        // Insertion order scrambled on purpose
        store.add_cast(newest.clone());
        store.add_cast(oldest.clone());
        store.add_cast(middle.clone());

        let config = DispatchConfig {
            batch_size: 2,
            ..DispatchConfig::default()
        };
        let summary = dispatcher(&store, &api, config).run_once().await.unwrap();

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.published, 2);
        let calls = api.publish_calls();
        assert_eq!(calls[0].text, oldest.content);
        assert_eq!(calls[1].text, middle.content);
        assert!(!store.cast(newest.id).posted);
    }

    #[tokio::test]
    async fn posted_and_future_casts_are_never_selected() {
        let store = FakeStore::default();
        let api = FakeApi::default();
        approved_account(&store, &api, 42);

        let mut already_posted = due_cast(42, 50);
        already_posted.posted = true;
        already_posted.posted_at = Some(Utc::now() - Duration::minutes(49));
        store.add_cast(already_posted);
        store.add_cast(cast_at(42, Utc::now() + Duration::minutes(5)));

        let summary = dispatcher(&store, &api, DispatchConfig::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.processed, 0);
        assert!(api.publish_calls().is_empty());
    }

    #[tokio::test]
    async fn failed_casts_wait_out_the_cooldown() {
        let store = FakeStore::default();
        let api = FakeApi::default();
        approved_account(&store, &api, 42);

        let mut cast = due_cast(42, 60);
        cast.error = Some("earlier failure".to_string());
        let id = cast.id;
        store.add_cast(cast);

        // Failed one hour ago: still cooling down
        store.set_updated_at(id, Utc::now() - Duration::hours(1));
        let summary = dispatcher(&store, &api, DispatchConfig::default())
            .run_once()
            .await
            .unwrap();
        assert_eq!(summary.processed, 0);

        // Failed 25 hours ago: eligible again
        store.set_updated_at(id, Utc::now() - Duration::hours(25));
        let summary = dispatcher(&store, &api, DispatchConfig::default())
            .run_once()
            .await
            .unwrap();
        assert_eq!(summary.published, 1);
        assert!(store.cast(id).posted);
    }

    #[tokio::test]
    async fn publish_success_records_the_outcome_atomically() {
        let store = FakeStore::default();
        let api = FakeApi::default();
        approved_account(&store, &api, 42);

        let cast = due_cast(42, 5);
        let id = cast.id;
        store.add_cast(cast);

        let summary = dispatcher(&store, &api, DispatchConfig::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.published, 1);
        let row = store.cast(id);
        assert!(row.posted);
        assert!(row.posted_at.is_some());
        assert!(row.result.is_some());
        assert!(row.error.is_none());
        assert!(row.claimed_at.is_none());
    }

    #[tokio::test]
    async fn missing_account_or_signer_fails_the_row_with_a_clear_error() {
        let store = FakeStore::default();
        let api = FakeApi::default();
        // fid 1 has no account row; fid 2 has an account but no signer
        store.add_user(test_user(2, None, None));

        let orphan = due_cast(1, 20);
        let signerless = due_cast(2, 10);
        store.add_cast(orphan.clone());
        store.add_cast(signerless.clone());

        let summary = dispatcher(&store, &api, DispatchConfig::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.failed, 2);
        assert!(store.cast(orphan.id).error.unwrap().contains("account"));
        assert!(store.cast(signerless.id).error.unwrap().contains("signer"));
        assert!(api.publish_calls().is_empty());
    }

    #[tokio::test]
    async fn stored_unapproved_signer_blocks_with_the_approval_link() {
        let store = FakeStore::default();
        let api = FakeApi::default();
        store.add_user(test_user(42, Some("signer-a"), Some(SignerStatus::Pending)));

        let cast = due_cast(42, 5);
        let id = cast.id;
        store.add_cast(cast);

        let summary = dispatcher(&store, &api, DispatchConfig::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.blocked, 1);
        let error = store.cast(id).error.unwrap();
        assert!(error.contains("signed-key-request"));
        // Blocked on the stored status alone, no network traffic
        assert_eq!(api.status_call_count(), 0);
        assert!(api.publish_calls().is_empty());

        // The row now cools down instead of being hammered every pass
        let summary = dispatcher(&store, &api, DispatchConfig::default())
            .run_once()
            .await
            .unwrap();
        assert_eq!(summary.processed, 0);
    }

    #[tokio::test]
    async fn live_check_failure_registers_a_replacement_and_blocks() {
        let store = FakeStore::default();
        let api = FakeApi::default();
        // Stored as approved, but Neynar now says the key is pending
        store.add_user(test_user(42, Some("signer-a"), Some(SignerStatus::Approved)));
        api.set_status("signer-a", SignerStatus::Pending);

        let cast = due_cast(42, 5);
        let id = cast.id;
        store.add_cast(cast);

        let summary = dispatcher(&store, &api, DispatchConfig::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.blocked, 1);
        assert_eq!(api.create_call_count(), 1);
        assert!(store.cast(id).error.unwrap().contains("token=new"));

        let user = store.user(42);
        assert_eq!(user.signer_uuid.as_deref(), Some("signer-new"));
        assert!(user.needs_signer_approval);
    }

    #[tokio::test]
    async fn publish_auth_rejection_flags_the_account() {
        let store = FakeStore::default();
        let api = FakeApi::default();
        approved_account(&store, &api, 42);
        api.push_publish(Err(NeynarError::AuthRejected("invalid signer".to_string())));

        let cast = due_cast(42, 5);
        let id = cast.id;
        store.add_cast(cast);

        let summary = dispatcher(&store, &api, DispatchConfig::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.blocked, 1);
        assert!(!store.cast(id).posted);
        assert!(store.cast(id).error.unwrap().contains("re-authorize"));
        assert!(store.user(42).needs_signer_approval);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_publish_retries_and_succeeds() {
        let store = FakeStore::default();
        let api = FakeApi::default();
        approved_account(&store, &api, 42);
        api.push_publish(Err(NeynarError::RateLimited {
            retry_after_secs: None,
        }));
        api.push_publish(Err(NeynarError::RateLimited {
            retry_after_secs: Some(1),
        }));
        // Third attempt falls through to the default success

        let cast = due_cast(42, 5);
        let id = cast.id;
        store.add_cast(cast);

        let summary = dispatcher(&store, &api, DispatchConfig::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.published, 1);
        assert_eq!(api.publish_calls().len(), 3);
        assert!(store.cast(id).posted);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_exhaustion_records_the_error() {
        let store = FakeStore::default();
        let api = FakeApi::default();
        approved_account(&store, &api, 42);
        for _ in 0..3 {
            api.push_publish(Err(NeynarError::RateLimited {
                retry_after_secs: None,
            }));
        }

        let cast = due_cast(42, 5);
        let id = cast.id;
        store.add_cast(cast);

        let summary = dispatcher(&store, &api, DispatchConfig::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(api.publish_calls().len(), MAX_API_ATTEMPTS as usize);
        let row = store.cast(id);
        assert!(!row.posted);
        assert!(row.error.unwrap().contains("rate limit"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_signer_check_retries_then_publishes() {
        let store = FakeStore::default();
        let api = FakeApi::default();
        approved_account(&store, &api, 42);
        api.push_status_error(NeynarError::RateLimited {
            retry_after_secs: None,
        });

        let cast = due_cast(42, 5);
        let id = cast.id;
        store.add_cast(cast);

        let summary = dispatcher(&store, &api, DispatchConfig::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.published, 1);
        assert_eq!(api.status_call_count(), 2);
        assert!(store.cast(id).posted);
    }

    #[tokio::test(start_paused = true)]
    async fn signer_check_rate_limit_exhaustion_never_churns_the_signer() {
        let store = FakeStore::default();
        let api = FakeApi::default();
        approved_account(&store, &api, 42);
        for _ in 0..3 {
            api.push_status_error(NeynarError::RateLimited {
                retry_after_secs: None,
            });
        }

        let cast = due_cast(42, 5);
        let id = cast.id;
        store.add_cast(cast);

        let summary = dispatcher(&store, &api, DispatchConfig::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(api.status_call_count(), MAX_API_ATTEMPTS as usize);
        // Throttling is not a credential problem
        assert_eq!(api.create_call_count(), 0);
        let row = store.cast(id);
        assert!(!row.posted);
        assert!(row.error.unwrap().contains("signer check failed"));
        assert_eq!(store.user(42).signer_uuid.as_deref(), Some("signer-a"));
    }

    #[tokio::test]
    async fn one_bad_cast_does_not_stop_the_batch() {
        let store = FakeStore::default();
        let api = FakeApi::default();
        approved_account(&store, &api, 42);
        // The oldest cast gets the scripted 500; the next one succeeds
        api.push_publish(Err(NeynarError::Api {
            status: 500,
            message: "upstream exploded".to_string(),
        }));

        let bad = due_cast(42, 20);
        let good = due_cast(42, 10);
        store.add_cast(bad.clone());
        store.add_cast(good.clone());

        let summary = dispatcher(&store, &api, DispatchConfig::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.published, 1);
        assert_eq!(summary.failed, 1);
        assert!(store.cast(bad.id).error.unwrap().contains("status 500"));
        assert!(store.cast(good.id).posted);
    }

    #[tokio::test]
    async fn concurrent_passes_publish_each_cast_at_most_once() {
        let store = FakeStore::default();
        let api = FakeApi::default();
        approved_account(&store, &api, 42);

        let ids: Vec<_> = (0..4)
            .map(|i| {
                let cast = due_cast(42, 40 - i);
                let id = cast.id;
                store.add_cast(cast);
                id
            })
            .collect();

        let config = DispatchConfig {
            batch_size: 2,
            ..DispatchConfig::default()
        };
        let d1 = dispatcher(&store, &api, config.clone());
        let d2 = dispatcher(&store, &api, config);

        let (s1, s2) = tokio::join!(
            tokio::spawn(async move { d1.run_once().await.unwrap() }),
            tokio::spawn(async move { d2.run_once().await.unwrap() }),
        );
        let (s1, s2) = (s1.unwrap(), s2.unwrap());

        assert_eq!(s1.published + s2.published, 4);
        assert_eq!(api.publish_calls().len(), 4);
        for id in ids {
            assert_eq!(store.times_marked_posted(id), 1);
        }
    }

    #[tokio::test]
    async fn a_signer_is_validated_once_per_pass() {
        let store = FakeStore::default();
        let api = FakeApi::default();
        approved_account(&store, &api, 42);
        store.add_cast(due_cast(42, 20));
        store.add_cast(due_cast(42, 10));

        let summary = dispatcher(&store, &api, DispatchConfig::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(summary.published, 2);
        assert_eq!(api.status_call_count(), 1);
    }

    #[tokio::test]
    async fn skip_live_check_publishes_without_status_lookups() {
        let store = FakeStore::default();
        let api = FakeApi::default();
        // Stored approved, nothing scripted on the API side
        store.add_user(test_user(42, Some("signer-a"), Some(SignerStatus::Approved)));
        store.add_cast(due_cast(42, 5));

        let config = DispatchConfig {
            skip_live_check: true,
            ..DispatchConfig::default()
        };
        let summary = dispatcher(&store, &api, config).run_once().await.unwrap();

        assert_eq!(summary.published, 1);
        assert_eq!(api.status_call_count(), 0);
    }

    #[test]
    fn embeds_prefer_explicit_media_and_cap_at_the_limit() {
        let media = vec![
            "https://i.imgur.com/a.png".to_string(),
            "https://i.imgur.com/b.png".to_string(),
        ];
        let embeds = build_embeds(&media, "also see https://example.com/c");
        assert_eq!(embeds, media);
    }

    #[test]
    fn embeds_pick_up_urls_from_the_text() {
        let embeds = build_embeds(&[], "gm https://warpcast.com/~/cool and http://x.dev/page.");
        assert_eq!(
            embeds,
            vec![
                "https://warpcast.com/~/cool".to_string(),
                "http://x.dev/page".to_string()
            ]
        );
    }

    #[test]
    fn duplicate_embed_urls_collapse() {
        let media = vec!["https://example.com/a.png".to_string()];
        let embeds = build_embeds(&media, "see https://example.com/a.png again");
        assert_eq!(embeds, media);
    }

    #[test]
    fn plain_words_are_not_embeds() {
        assert!(build_embeds(&[], "http is a protocol, webhttps://x is not a link").is_empty());
    }
}
