//! Encrypted broker credential storage.
//!
//! The access token returned by a broker session exchange is the most
//! sensitive value this service handles. It is encrypted with AES-256-GCM
//! before it reaches the persistence layer and only decrypted on the way out
//! to trading operations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore (trait)           │
//! │  - save_or_update (atomic upsert)       │
//! │  - get_access_token / get_credential    │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Encryption Module                 │
//! │  - AES-256-GCM, nonce || ct || tag      │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SQLite (broker_credentials)       │
//! │  - UNIQUE(user_id, broker)              │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use brokerlink::credentials::{validate_key, CredentialStore, SqliteCredentialStore};
//! use uuid::Uuid;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let key = validate_key(&std::env::var("BROKERLINK_ENCRYPTION_KEY")?)?;
//! let store = SqliteCredentialStore::new("brokerlink.db", key)?;
//!
//! let user = Uuid::new_v4();
//! store
//!     .save_or_update(user, "kite", "access-token", "public-token", "AB1234")
//!     .await?;
//!
//! let token = store.get_access_token(user, "kite").await?;
//! # let _ = token;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

mod encryption;
mod storage;

pub use encryption::{decrypt, encrypt, validate_key, CipherError, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use storage::SqliteCredentialStore;

/// Non-secret metadata of a linked broker account.
///
/// The encrypted access token is deliberately absent; use
/// [`CredentialStore::get_access_token`] to obtain it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BrokerCredential {
    pub user_id: Uuid,
    pub broker: String,
    /// The user's identifier at the broker (Kite `user_id`)
    pub broker_user_id: String,
    pub public_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CredentialStoreError {
    #[error("broker credentials not found")]
    CredentialsNotFound,

    /// Stored blob failed to decrypt: corrupted row or wrong master key.
    #[error("failed to decrypt stored access token: {0}")]
    DecryptionFailed(#[source] CipherError),

    #[error("failed to encrypt access token: {0}")]
    EncryptionFailed(#[source] CipherError),

    #[error("stored credential is corrupted: {0}")]
    Corrupted(String),

    #[error("credential storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("credential storage task failed: {0}")]
    Task(String),

    /// The write missed its deadline and was rolled back.
    #[error("credential write timed out before commit")]
    Timeout,
}

/// Persistence contract for per-(user, broker) credentials.
///
/// Implementations receive the raw access token but must encrypt it before
/// it is written anywhere.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Inserts or overwrites the credential for `(user_id, broker)` in a
    /// single atomic operation.
    ///
    /// Implementations bound their own duration. An `Err` means nothing was
    /// committed, including after a timeout.
    async fn save_or_update(
        &self,
        user_id: Uuid,
        broker: &str,
        raw_access_token: &str,
        public_token: &str,
        broker_user_id: &str,
    ) -> Result<(), CredentialStoreError>;

    /// Returns the decrypted access token.
    async fn get_access_token(
        &self,
        user_id: Uuid,
        broker: &str,
    ) -> Result<String, CredentialStoreError>;

    async fn get_credential(
        &self,
        user_id: Uuid,
        broker: &str,
    ) -> Result<BrokerCredential, CredentialStoreError>;
}
