//! Neynar API client: signer management and cast publishing

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::models::SignerStatus;

#[derive(Debug)]
pub enum NeynarError {
    Http(reqwest::Error),
    RateLimited { retry_after_secs: Option<u64> },
    AuthRejected(String),
    Api { status: u16, message: String },
}

impl From<reqwest::Error> for NeynarError {
    fn from(e: reqwest::Error) -> Self {
        NeynarError::Http(e)
    }
}

impl std::fmt::Display for NeynarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NeynarError::Http(e) => write!(f, "HTTP error: {}", e),
            NeynarError::RateLimited { retry_after_secs } => match retry_after_secs {
                Some(secs) => write!(f, "Neynar rate limit hit, retry after {}s", secs),
                None => write!(f, "Neynar rate limit hit"),
            },
            NeynarError::AuthRejected(s) => write!(f, "Neynar rejected credentials: {}", s),
            NeynarError::Api { status, message } => {
                write!(f, "Neynar API error (status {}): {}", status, message)
            }
        }
    }
}

impl std::error::Error for NeynarError {}

/// A signer key freshly registered with Neynar
#[derive(Debug, Clone)]
pub struct NewSigner {
    pub signer_uuid: String,
    pub status: SignerStatus,
    pub approval_url: Option<String>,
}

/// The slice of the Neynar API this service depends on.
///
/// The dispatcher and the signer checks go through this trait so tests can
/// swap in a scripted fake instead of the live HTTP client.
#[async_trait]
pub trait FarcasterApi: Send + Sync {
    /// Register a brand new signer key for the account to approve
    async fn create_signer(&self) -> Result<NewSigner, NeynarError>;

    /// Look up the live approval status of a signer
    async fn signer_status(&self, signer_uuid: &str) -> Result<SignerStatus, NeynarError>;

    /// Publish a cast through an approved signer
    async fn publish_cast(
        &self,
        signer_uuid: &str,
        text: &str,
        channel_id: Option<&str>,
        embeds: &[String],
    ) -> Result<serde_json::Value, NeynarError>;
}

#[derive(Clone)]
pub struct NeynarClient {
    api_key: String,
    base_url: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct SignerResponse {
    signer_uuid: String,
    status: String,
    signer_approval_url: Option<String>,
}

impl NeynarClient {
    pub fn new(api_key: &str, base_url: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http: Client::new(),
        }
    }

    /// Classify a non-2xx response into the matching error variant
    async fn api_error(resp: reqwest::Response) -> NeynarError {
        let status = resp.status().as_u16();

        if status == 429 {
            let retry_after_secs = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return NeynarError::RateLimited { retry_after_secs };
        }

        let message = resp.text().await.unwrap_or_default();
        match status {
            401 | 403 => NeynarError::AuthRejected(message),
            _ => NeynarError::Api { status, message },
        }
    }
}

#[async_trait]
impl FarcasterApi for NeynarClient {
    async fn create_signer(&self) -> Result<NewSigner, NeynarError> {
        let url = format!("{}/v2/farcaster/signer", self.base_url);

        let resp = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({}))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }

        let signer: SignerResponse = resp.json().await?;
        Ok(NewSigner {
            signer_uuid: signer.signer_uuid,
            status: SignerStatus::from_str(&signer.status),
            approval_url: signer.signer_approval_url,
        })
    }

    async fn signer_status(&self, signer_uuid: &str) -> Result<SignerStatus, NeynarError> {
        let url = format!(
            "{}/v2/farcaster/signer?signer_uuid={}",
            self.base_url,
            percent_encode(signer_uuid)
        );

        let resp = self
            .http
            .get(&url)
            .header("x-api-key", &self.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }

        let signer: SignerResponse = resp.json().await?;
        Ok(SignerStatus::from_str(&signer.status))
    }

    /// Publish a cast to Farcaster.
    ///
    /// # Arguments
    /// * `signer_uuid` - An approved Neynar signer for the posting account
    /// * `text` - The cast text content
    /// * `channel_id` - Optional channel to post into
    /// * `embeds` - Embed URLs to attach, capped upstream at the protocol limit
    async fn publish_cast(
        &self,
        signer_uuid: &str,
        text: &str,
        channel_id: Option<&str>,
        embeds: &[String],
    ) -> Result<serde_json::Value, NeynarError> {
        let url = format!("{}/v2/farcaster/cast", self.base_url);

        let mut body = serde_json::json!({
            "signer_uuid": signer_uuid,
            "text": text,
        });

        if let Some(channel) = channel_id {
            body["channel_id"] = serde_json::json!(channel);
        }

        if !embeds.is_empty() {
            let urls: Vec<serde_json::Value> = embeds
                .iter()
                .map(|u| serde_json::json!({ "url": u }))
                .collect();
            body["embeds"] = serde_json::Value::Array(urls);
        }

        let resp = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }

        let result: serde_json::Value = resp.json().await?;
        Ok(result)
    }
}

/// Delay before the next attempt after a rate limit.
///
/// Doubles per attempt starting from the base delay. When the API sent a
/// Retry-After hint, waits at least that long.
pub fn backoff_delay_ms(base_delay_ms: u64, attempt: u32, retry_after_secs: Option<u64>) -> u64 {
    let doubled = base_delay_ms.saturating_mul(1u64 << attempt.min(16));
    match retry_after_secs {
        Some(secs) => doubled.max(secs.saturating_mul(1000)),
        None => doubled,
    }
}

fn percent_encode(s: &str) -> String {
    percent_encoding::utf8_percent_encode(s, percent_encoding::NON_ALPHANUMERIC).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay_ms(500, 0, None), 500);
        assert_eq!(backoff_delay_ms(500, 1, None), 1000);
        assert_eq!(backoff_delay_ms(500, 2, None), 2000);
    }

    #[test]
    fn backoff_waits_at_least_the_retry_after_hint() {
        assert_eq!(backoff_delay_ms(500, 0, Some(3)), 3000);
        // A computed delay already above the hint wins
        assert_eq!(backoff_delay_ms(500, 4, Some(1)), 8000);
    }
}
