//! Signer validation and refresh
//!
//! Before a cast goes out, the signer on file must still be something Neynar
//! will accept. This walks the claimed signer, then any alternate already on
//! the account row, and finally registers a fresh signer, persisting whatever
//! it lands on. Exactly one new signer is created per walk.

use crate::dispatch::DispatchStore;
use crate::services::neynar::{FarcasterApi, NeynarError};

/// Outcome of validating a signer before publishing
#[derive(Debug, Clone, PartialEq)]
pub enum SignerValidation {
    /// A signer Neynar will accept for publishing
    Valid { signer_uuid: String, refreshed: bool },
    /// No usable signer; the account holder must approve one first
    NeedsApproval {
        signer_uuid: String,
        approval_url: Option<String>,
    },
}

#[derive(Debug)]
pub enum SignerError {
    Store(sqlx::Error),
    Api(NeynarError),
}

impl From<sqlx::Error> for SignerError {
    fn from(e: sqlx::Error) -> Self {
        SignerError::Store(e)
    }
}

impl From<NeynarError> for SignerError {
    fn from(e: NeynarError) -> Self {
        SignerError::Api(e)
    }
}

impl std::fmt::Display for SignerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignerError::Store(e) => write!(f, "store error: {}", e),
            SignerError::Api(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SignerError {}

/// Validate the claimed signer and recover a usable one if it went bad.
///
/// An auth rejection from Neynar means the key is no longer recognized and is
/// treated like an unapproved signer. Transient failures (rate limits, HTTP
/// errors, 5xx) propagate unchanged so the caller can retry later instead of
/// churning signer state.
pub async fn ensure_usable_signer<S, A>(
    store: &S,
    api: &A,
    fid: i64,
    claimed_signer: &str,
    skip_live_check: bool,
) -> Result<SignerValidation, SignerError>
where
    S: DispatchStore,
    A: FarcasterApi,
{
    if skip_live_check {
        return Ok(SignerValidation::Valid {
            signer_uuid: claimed_signer.to_string(),
            refreshed: false,
        });
    }

    match api.signer_status(claimed_signer).await {
        Ok(status) if status.is_approved() => {
            return Ok(SignerValidation::Valid {
                signer_uuid: claimed_signer.to_string(),
                refreshed: false,
            });
        }
        // Pending or revoked: fall through and try to recover
        Ok(_) => {}
        // Neynar no longer recognizes the key at all
        Err(NeynarError::AuthRejected(_)) => {}
        Err(e) => return Err(SignerError::Api(e)),
    }

    // The account row may already hold a different signer, e.g. one connected
    // from another device after the claimed one was revoked.
    if let Some(user) = store.get_user_by_fid(fid).await? {
        if let Some(alternate) = user.signer_uuid {
            if alternate != claimed_signer {
                match api.signer_status(&alternate).await {
                    Ok(status) if status.is_approved() => {
                        store.adopt_signer(fid, &alternate).await?;
                        return Ok(SignerValidation::Valid {
                            signer_uuid: alternate,
                            refreshed: true,
                        });
                    }
                    Ok(_) | Err(NeynarError::AuthRejected(_)) => {}
                    Err(e) => return Err(SignerError::Api(e)),
                }
            }
        }
    }

    // Nothing usable on file: register one fresh signer for the account to approve
    let signer = api.create_signer().await?;
    store.save_new_signer(fid, &signer).await?;

    if signer.status.is_approved() {
        return Ok(SignerValidation::Valid {
            signer_uuid: signer.signer_uuid,
            refreshed: true,
        });
    }

    Ok(SignerValidation::NeedsApproval {
        signer_uuid: signer.signer_uuid,
        approval_url: signer.approval_url,
    })
}
