//! Application constants

/// Maximum cast text length in UTF-16 code units (protocol limit)
pub const MAX_CAST_LENGTH: usize = 320;

/// Maximum number of embeds a cast can carry (protocol limit)
pub const MAX_CAST_EMBEDS: usize = 2;

/// Default number of due casts claimed per dispatch pass
pub const DEFAULT_DISPATCH_BATCH_SIZE: i64 = 10;

/// Default cooldown before a failed cast becomes eligible again (24 hours)
pub const DEFAULT_RETRY_COOLDOWN_HOURS: i64 = 24;

/// Default lease on a dispatch claim before it is considered abandoned (5 minutes)
pub const DEFAULT_CLAIM_LEASE_SECONDS: i64 = 300;

/// Default dispatch worker tick interval in seconds
pub const DEFAULT_DISPATCH_CRON_SECONDS: u64 = 30;

/// Maximum attempts per Neynar call on the dispatch path (rate-limit retries)
pub const MAX_API_ATTEMPTS: u32 = 3;

/// Base delay between rate-limited attempts (500 ms, doubled per retry)
pub const BASE_RETRY_DELAY_MS: u64 = 500;

/// Default page size for paginated list endpoints
pub const DEFAULT_PAGE_SIZE: i64 = 50;

/// Maximum page size for paginated list endpoints
pub const MAX_PAGE_SIZE: i64 = 100;

/// Default Neynar API base URL
pub const DEFAULT_NEYNAR_BASE_URL: &str = "https://api.neynar.com";
