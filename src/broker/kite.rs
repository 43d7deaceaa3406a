//! Kite Connect (Zerodha) login and session exchange.
//!
//! Protocol (Kite Connect v3):
//! 1. User is sent to `https://kite.zerodha.com/connect/login?v=3&api_key=...`
//! 2. Kite redirects back with `status=success&request_token=...`
//! 3. `POST /session/token` with `api_key`, `request_token` and
//!    `checksum = sha256(api_key + request_token + api_secret)` as hex
//! 4. Response `{"status": "success", "data": {"user_id", "access_token", "public_token", ...}}`

use super::{BrokerConnect, BrokerError, BrokerSession};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};

pub const DEFAULT_LOGIN_URL: &str = "https://kite.zerodha.com/connect/login";
pub const DEFAULT_API_URL: &str = "https://api.kite.trade";

const KITE_VERSION: &str = "3";

/// Kite response envelope.
#[derive(Debug, Deserialize)]
struct KiteEnvelope {
    status: String,
    #[serde(default)]
    data: Option<KiteSessionData>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
}

/// Fields of `data` we care about; Kite sends many more (profile, exchanges, ...).
#[derive(Debug, Deserialize)]
struct KiteSessionData {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    public_token: Option<String>,
}

/// HTTP client for the Kite Connect session API.
#[derive(Clone)]
pub struct KiteConnect {
    api_key: String,
    login_url: String,
    api_url: String,
    client: Client,
}

impl KiteConnect {
    pub fn new(api_key: impl Into<String>, client: Client) -> Self {
        Self::with_base_urls(api_key, DEFAULT_LOGIN_URL, DEFAULT_API_URL, client)
    }

    /// Create a client against custom endpoints (used for testing).
    pub fn with_base_urls(
        api_key: impl Into<String>,
        login_url: impl Into<String>,
        api_url: impl Into<String>,
        client: Client,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            login_url: login_url.into(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn checksum(&self, request_token: &str, api_secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.api_key.as_bytes());
        hasher.update(request_token.as_bytes());
        hasher.update(api_secret.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, BrokerError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(BrokerError::IncompleteSessionData(field)),
    }
}

#[async_trait]
impl BrokerConnect for KiteConnect {
    fn name(&self) -> &str {
        "kite"
    }

    fn login_url(&self) -> String {
        format!(
            "{}?v={}&api_key={}",
            self.login_url,
            KITE_VERSION,
            urlencoding::encode(&self.api_key)
        )
    }

    async fn exchange_request_token(
        &self,
        request_token: &str,
        api_secret: &str,
    ) -> Result<BrokerSession, BrokerError> {
        let checksum = self.checksum(request_token, api_secret);
        let url = format!("{}/session/token", self.api_url);

        tracing::debug!(url = %url, "Exchanging Kite request token");

        let form = [
            ("api_key", self.api_key.as_str()),
            ("request_token", request_token),
            ("checksum", checksum.as_str()),
        ];

        let response = self
            .client
            .post(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .form(&form)
            .send()
            .await
            .map_err(|e| BrokerError::SessionExchangeFailed(format!("request failed: {e}")))?;

        let status = response.status();
        let envelope: Result<KiteEnvelope, _> = response.json().await;

        let envelope = match (status.is_success(), envelope) {
            (true, Ok(envelope)) => envelope,
            (true, Err(e)) => {
                return Err(BrokerError::SessionExchangeFailed(format!(
                    "unreadable response: {e}"
                )))
            }
            (false, Ok(envelope)) => {
                return Err(BrokerError::SessionExchangeFailed(format!(
                    "HTTP {}: {} {}",
                    status,
                    envelope.error_type.unwrap_or_default(),
                    envelope.message.unwrap_or_default()
                )))
            }
            (false, Err(_)) => {
                return Err(BrokerError::SessionExchangeFailed(format!("HTTP {status}")))
            }
        };

        if envelope.status != "success" {
            return Err(BrokerError::SessionExchangeFailed(format!(
                "broker status '{}': {}",
                envelope.status,
                envelope.message.unwrap_or_default()
            )));
        }

        let data = envelope
            .data
            .ok_or(BrokerError::IncompleteSessionData("data"))?;

        let session = BrokerSession {
            access_token: required(data.access_token, "access_token")?,
            public_token: required(data.public_token, "public_token")?,
            broker_user_id: required(data.user_id, "user_id")?,
        };

        tracing::debug!(
            broker_user_id = %session.broker_user_id,
            "Kite session exchange successful"
        );

        Ok(session)
    }
}
