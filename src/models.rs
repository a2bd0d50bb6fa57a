//! Database model definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef};
use sqlx::{Decode, Encode, Postgres, Type};
use uuid::Uuid;

/// Lifecycle of a Farcaster signer key as Neynar reports it
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SignerStatus {
    Pending,
    Approved,
    Revoked,
}

impl SignerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignerStatus::Pending => "pending",
            SignerStatus::Approved => "approved",
            SignerStatus::Revoked => "revoked",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "approved" => SignerStatus::Approved,
            "revoked" => SignerStatus::Revoked,
            // Neynar reports fresh keys as "generated" or "pending_approval"
            _ => SignerStatus::Pending,
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, SignerStatus::Approved)
    }
}

// sqlx Type/Decode/Encode for SignerStatus to enable FromRow on UserRecord
impl Type<Postgres> for SignerStatus {
    fn type_info() -> PgTypeInfo {
        <String as Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <String as Type<Postgres>>::compatible(ty)
    }
}

impl<'r> Decode<'r, Postgres> for SignerStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <String as Decode<Postgres>>::decode(value)?;
        Ok(SignerStatus::from_str(&s))
    }
}

impl Encode<'_, Postgres> for SignerStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        <String as Encode<Postgres>>::encode_by_ref(&self.as_str().to_owned(), buf)
    }
}

/// A Farcaster account known to the scheduler, with its signer on file
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRecord {
    #[allow(dead_code)] // Fetched from DB but intentionally not exposed in API responses
    pub id: i64,
    pub fid: i64,
    pub signer_uuid: Option<String>,
    pub signer_status: Option<SignerStatus>,
    pub signer_approval_url: Option<String>,
    pub needs_signer_approval: bool,
    pub signer_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A cast queued for future publication
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScheduledCast {
    pub id: Uuid,
    pub fid: i64,
    pub content: String,
    pub channel_id: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub media_urls: Vec<String>,
    pub posted: bool,
    pub posted_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signer_status_round_trips_through_strings() {
        assert_eq!(SignerStatus::from_str("approved"), SignerStatus::Approved);
        assert_eq!(SignerStatus::from_str("revoked"), SignerStatus::Revoked);
        assert_eq!(SignerStatus::from_str("pending"), SignerStatus::Pending);
        assert_eq!(SignerStatus::Approved.as_str(), "approved");
    }

    #[test]
    fn unknown_signer_status_maps_to_pending() {
        assert_eq!(SignerStatus::from_str("generated"), SignerStatus::Pending);
        assert_eq!(SignerStatus::from_str("pending_approval"), SignerStatus::Pending);
        assert_eq!(SignerStatus::from_str("garbage"), SignerStatus::Pending);
    }
}
