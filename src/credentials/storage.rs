//! Encrypted broker credential storage using SQLite.
//!
//! All access tokens are encrypted at rest using AES-256-GCM.

use super::{encryption, BrokerCredential, CredentialStore, CredentialStoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

// Commit gate shared between a write and the caller waiting on it.
const WRITE_PENDING: u8 = 0;
const WRITE_COMMITTING: u8 = 1;
const WRITE_ABANDONED: u8 = 2;

/// Encrypted credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE broker_credentials (
///     id INTEGER PRIMARY KEY,
///     user_id TEXT NOT NULL,
///     broker TEXT NOT NULL,
///     broker_user_id TEXT NOT NULL,
///     public_token TEXT NOT NULL,
///     access_token_encrypted BLOB NOT NULL, -- nonce || ciphertext || tag
///     created_at TEXT NOT NULL,             -- RFC 3339
///     updated_at TEXT NOT NULL,             -- RFC 3339
///     UNIQUE(user_id, broker)
/// );
/// ```
///
/// # Thread Safety
/// The connection sits behind a `Mutex` and every query runs on the blocking
/// pool, so no lock is held across an `.await`.
///
/// # Timeouts
/// Writes are bounded by `write_timeout`. A write that misses it is rolled
/// back before commit, so [`CredentialStoreError::Timeout`] always means
/// nothing was stored.
pub struct SqliteCredentialStore {
    conn: Arc<Mutex<Connection>>,
    encryption_key: [u8; encryption::KEY_SIZE],
    write_timeout: Duration,
}

impl SqliteCredentialStore {
    /// Creates or opens a credential store.
    ///
    /// `encryption_key` is the already validated 32-byte master key.
    pub fn new<P: AsRef<Path>>(
        db_path: P,
        encryption_key: [u8; encryption::KEY_SIZE],
    ) -> Result<Self, CredentialStoreError> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(DEFAULT_WRITE_TIMEOUT)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS broker_credentials (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                broker TEXT NOT NULL,
                broker_user_id TEXT NOT NULL,
                public_token TEXT NOT NULL,
                access_token_encrypted BLOB NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, broker)
            );
            "#,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            encryption_key,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        })
    }

    /// Bounds how long `save_or_update` may take before giving up.
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    fn spawn_with_conn<T, F>(&self, f: F) -> JoinHandle<Result<T, CredentialStoreError>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, CredentialStoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| CredentialStoreError::Task("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, CredentialStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, CredentialStoreError> + Send + 'static,
    {
        joined(self.spawn_with_conn(f).await)
    }
}

fn joined<T>(
    result: Result<Result<T, CredentialStoreError>, tokio::task::JoinError>,
) -> Result<T, CredentialStoreError> {
    result.map_err(|e| CredentialStoreError::Task(e.to_string()))?
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, CredentialStoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CredentialStoreError::Corrupted(format!("bad timestamp: {e}")))
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn save_or_update(
        &self,
        user_id: Uuid,
        broker: &str,
        raw_access_token: &str,
        public_token: &str,
        broker_user_id: &str,
    ) -> Result<(), CredentialStoreError> {
        // Nothing below this line sees the plaintext.
        let access_token_encrypted =
            encryption::encrypt(raw_access_token.as_bytes(), &self.encryption_key)
                .map_err(CredentialStoreError::EncryptionFailed)?;

        let broker = broker.to_string();
        let public_token = public_token.to_string();
        let broker_user_id = broker_user_id.to_string();
        let now = Utc::now().to_rfc3339();

        let gate = Arc::new(AtomicU8::new(WRITE_PENDING));
        let write_gate = Arc::clone(&gate);

        let mut write = self.spawn_with_conn(move |conn| {
            // Rolled back on drop unless committed.
            let tx = conn.transaction()?;
            tx.execute(
                r#"
                INSERT INTO broker_credentials (
                    user_id, broker, broker_user_id, public_token,
                    access_token_encrypted, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                ON CONFLICT(user_id, broker) DO UPDATE SET
                    broker_user_id = excluded.broker_user_id,
                    public_token = excluded.public_token,
                    access_token_encrypted = excluded.access_token_encrypted,
                    updated_at = excluded.updated_at
                "#,
                params![
                    user_id.to_string(),
                    broker,
                    broker_user_id,
                    public_token,
                    access_token_encrypted,
                    now,
                ],
            )?;

            if write_gate
                .compare_exchange(WRITE_PENDING, WRITE_COMMITTING, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(CredentialStoreError::Timeout);
            }
            tx.commit()?;
            Ok(())
        });

        match tokio::time::timeout(self.write_timeout, &mut write).await {
            Ok(result) => joined(result),
            Err(_) => {
                if gate
                    .compare_exchange(WRITE_PENDING, WRITE_ABANDONED, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    tracing::warn!(
                        user_id = %user_id,
                        timeout_ms = self.write_timeout.as_millis() as u64,
                        "Credential write timed out, abandoning before commit"
                    );
                    Err(CredentialStoreError::Timeout)
                } else {
                    // Commit already started; report how it actually ended.
                    joined(write.await)
                }
            }
        }
    }

    async fn get_access_token(
        &self,
        user_id: Uuid,
        broker: &str,
    ) -> Result<String, CredentialStoreError> {
        let broker = broker.to_string();

        let blob: Vec<u8> = self
            .with_conn(move |conn| {
                conn.query_row(
                    r#"
                    SELECT access_token_encrypted
                    FROM broker_credentials
                    WHERE user_id = ?1 AND broker = ?2
                    "#,
                    params![user_id.to_string(), broker],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(CredentialStoreError::CredentialsNotFound)
            })
            .await?;

        let plaintext = encryption::decrypt(&blob, &self.encryption_key)
            .map_err(CredentialStoreError::DecryptionFailed)?;

        String::from_utf8(plaintext)
            .map_err(|_| CredentialStoreError::Corrupted("access token is not valid UTF-8".into()))
    }

    async fn get_credential(
        &self,
        user_id: Uuid,
        broker: &str,
    ) -> Result<BrokerCredential, CredentialStoreError> {
        let broker_name = broker.to_string();

        let (broker_user_id, public_token, created_at, updated_at) = self
            .with_conn(move |conn| {
                conn.query_row(
                    r#"
                    SELECT broker_user_id, public_token, created_at, updated_at
                    FROM broker_credentials
                    WHERE user_id = ?1 AND broker = ?2
                    "#,
                    params![user_id.to_string(), broker_name],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?
                .ok_or(CredentialStoreError::CredentialsNotFound)
            })
            .await?;

        Ok(BrokerCredential {
            user_id,
            broker: broker.to_string(),
            broker_user_id,
            public_token,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        })
    }
}
