pub mod constants;
pub mod dispatch;
pub mod domain;
pub mod models;
pub mod routes;
pub mod services;

use sqlx::PgPool;
use std::sync::Arc;

use crate::dispatch::DispatchConfig;
use crate::routes::casts::CastsStore;
use crate::services::neynar::NeynarClient;

/// Shared application state handed to every route
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub neynar: NeynarClient,
    /// Cast storage behind the [`CastsStore`] seam
    pub casts: Arc<dyn CastsStore>,
    pub jwt_secret: Vec<u8>,
    pub dispatch: DispatchConfig,
    /// Shared secret guarding POST /internal/dispatch
    pub dispatch_secret: Option<String>,
    pub dispatch_enabled: bool,
}

/// Apply pending migrations from ./migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
