//! Broker connect adapters.
//!
//! A broker is anything that can hand out a hosted login page and swap the
//! one-time request token from its redirect for a session. The
//! authorization flow only talks to [`BrokerConnect`], so adding a broker
//! means adding an implementation here and registering it at startup.

use async_trait::async_trait;
use thiserror::Error;

pub mod kite;

pub use kite::KiteConnect;

/// Session returned by a successful request-token exchange.
///
/// All three fields are required; adapters never return a partially filled
/// session.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerSession {
    pub access_token: String,
    pub public_token: String,
    /// The user's identifier at the broker
    pub broker_user_id: String,
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession")
            .field("access_token", &"<redacted>")
            .field("public_token", &self.public_token)
            .field("broker_user_id", &self.broker_user_id)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Transport failure, non-success HTTP status, or the broker reported an
    /// error in its response envelope.
    #[error("session exchange failed: {0}")]
    SessionExchangeFailed(String),

    /// The broker answered "success" but left out a required field.
    #[error("incomplete session data: missing {0}")]
    IncompleteSessionData(&'static str),
}

/// Capability interface for a broker's OAuth-like login.
#[async_trait]
pub trait BrokerConnect: Send + Sync {
    /// Stable identifier used for routing and as the credential row key
    /// (e.g. "kite").
    fn name(&self) -> &str;

    /// The broker's hosted authorization page.
    ///
    /// State travels in a cookie, so callers must not append to this URL.
    fn login_url(&self) -> String;

    /// Exchanges the request token from the broker's redirect for a session.
    async fn exchange_request_token(
        &self,
        request_token: &str,
        api_secret: &str,
    ) -> Result<BrokerSession, BrokerError>;
}
