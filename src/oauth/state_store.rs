//! Single-use OAuth state storage for CSRF and replay protection.
//!
//! A state token is the only link between the redirect out to the broker
//! and the redirect back. Verification and consumption are one operation:
//! there is no way to check a token without also deleting it.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StateStoreError {
    /// Never existed, expired, or already consumed. Deliberately one variant
    /// so a probing client learns nothing about which.
    #[error("invalid or expired OAuth state token")]
    InvalidOrExpiredState,

    #[error("OAuth state token already exists")]
    Duplicate,

    #[error("stored OAuth state is corrupted: {0}")]
    Corrupted(String),

    #[error("state storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("state storage task failed: {0}")]
    Task(String),
}

/// Persistence contract for OAuth state tokens.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persists a new state bound to `user_id`, valid for `ttl`.
    ///
    /// Fails with [`StateStoreError::Duplicate`] rather than overwrite.
    async fn save_state(&self, token: &str, user_id: Uuid, ttl: Duration)
        -> Result<(), StateStoreError>;

    /// Atomically looks up and deletes the state, returning its user.
    ///
    /// Among concurrent callers with the same token at most one succeeds.
    /// Expired states are deleted and reported as
    /// [`StateStoreError::InvalidOrExpiredState`].
    async fn verify_and_consume(&self, token: &str) -> Result<Uuid, StateStoreError>;

    /// Deletes every expired state, returning how many were removed.
    async fn purge_expired(&self) -> Result<usize, StateStoreError>;

    /// Number of stored states, reported by [`run_state_cleanup`]
    async fn count(&self) -> Result<usize, StateStoreError>;
}

/// Background task to periodically clean up expired states
pub async fn run_state_cleanup(store: Arc<dyn StateStore>, interval_seconds: u64) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        match store.purge_expired().await {
            Ok(removed) => {
                let pending = store.count().await.unwrap_or_default();
                tracing::debug!(removed, pending, "OAuth state cleanup complete");
            }
            Err(e) => {
                tracing::warn!(error = %e, "OAuth state cleanup failed");
            }
        }
    }
}

/// OAuth state entry held by [`MemoryStateStore`]
#[derive(Clone, Debug)]
struct StateEntry {
    user_id: Uuid,
    expires_at: DateTime<Utc>,
}

/// In-process state store.
///
/// Only suitable for a single instance; states are lost on restart.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    states: Arc<DashMap<String, StateEntry>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save_state(
        &self,
        token: &str,
        user_id: Uuid,
        ttl: Duration,
    ) -> Result<(), StateStoreError> {
        match self.states.entry(token.to_string()) {
            Entry::Occupied(_) => Err(StateStoreError::Duplicate),
            Entry::Vacant(slot) => {
                slot.insert(StateEntry {
                    user_id,
                    expires_at: Utc::now() + ttl,
                });
                Ok(())
            }
        }
    }

    async fn verify_and_consume(&self, token: &str) -> Result<Uuid, StateStoreError> {
        // Remove first: whoever wins the remove owns the token.
        let (_, entry) = self
            .states
            .remove(token)
            .ok_or(StateStoreError::InvalidOrExpiredState)?;

        if Utc::now() > entry.expires_at {
            return Err(StateStoreError::InvalidOrExpiredState);
        }

        Ok(entry.user_id)
    }

    async fn purge_expired(&self) -> Result<usize, StateStoreError> {
        let before = self.states.len();
        let now = Utc::now();
        self.states.retain(|_, entry| entry.expires_at >= now);
        Ok(before.saturating_sub(self.states.len()))
    }

    async fn count(&self) -> Result<usize, StateStoreError> {
        Ok(self.states.len())
    }
}

/// SQLite-backed state store.
///
/// # Schema
/// ```sql
/// CREATE TABLE oauth_states (
///     state_token TEXT PRIMARY KEY,
///     user_id TEXT NOT NULL,
///     issued_at INTEGER NOT NULL,   -- unix millis
///     expires_at INTEGER NOT NULL   -- unix millis
/// );
/// ```
///
/// Consumption runs in a `BEGIN IMMEDIATE` transaction, which takes the
/// database write lock before the lookup. That serialises concurrent
/// consumers even across separate connections to the same file.
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_states (
                state_token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                issued_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_oauth_states_expires ON oauth_states(expires_at);
            "#,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StateStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StateStoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StateStoreError::Task("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StateStoreError::Task(e.to_string()))?
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn save_state(
        &self,
        token: &str,
        user_id: Uuid,
        ttl: Duration,
    ) -> Result<(), StateStoreError> {
        let token = token.to_string();
        let issued_at = Utc::now();
        let expires_at = issued_at + ttl;

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO oauth_states (state_token, user_id, issued_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    token,
                    user_id.to_string(),
                    issued_at.timestamp_millis(),
                    expires_at.timestamp_millis()
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StateStoreError::Duplicate
                } else {
                    StateStoreError::Storage(e)
                }
            })?;
            Ok(())
        })
        .await
    }

    async fn verify_and_consume(&self, token: &str) -> Result<Uuid, StateStoreError> {
        let token = token.to_string();

        let (user_id, expires_at) = self
            .with_conn(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let row: Option<(String, i64)> = tx
                    .query_row(
                        "SELECT user_id, expires_at FROM oauth_states WHERE state_token = ?1",
                        params![token],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                let Some(row) = row else {
                    return Err(StateStoreError::InvalidOrExpiredState);
                };

                // Delete whether or not it has expired so stale rows go away.
                tx.execute("DELETE FROM oauth_states WHERE state_token = ?1", params![token])?;
                tx.commit()?;
                Ok(row)
            })
            .await?;

        let expires_at = Utc
            .timestamp_millis_opt(expires_at)
            .single()
            .ok_or_else(|| StateStoreError::Corrupted("bad expires_at".into()))?;

        if Utc::now() > expires_at {
            return Err(StateStoreError::InvalidOrExpiredState);
        }

        Uuid::parse_str(&user_id).map_err(|_| StateStoreError::Corrupted("bad user_id".into()))
    }

    async fn purge_expired(&self) -> Result<usize, StateStoreError> {
        let now = Utc::now().timestamp_millis();
        self.with_conn(move |conn| {
            let removed =
                conn.execute("DELETE FROM oauth_states WHERE expires_at < ?1", params![now])?;
            Ok(removed)
        })
        .await
    }

    async fn count(&self) -> Result<usize, StateStoreError> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM oauth_states", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores() -> Vec<(&'static str, Arc<dyn StateStore>)> {
        vec![
            ("memory", Arc::new(MemoryStateStore::new()) as Arc<dyn StateStore>),
            (
                "sqlite",
                Arc::new(SqliteStateStore::new(":memory:").unwrap()) as Arc<dyn StateStore>,
            ),
        ]
    }

    #[tokio::test]
    async fn test_save_and_consume_state() {
        for (name, store) in stores() {
            let user = Uuid::new_v4();
            store
                .save_state("state-1", user, Duration::minutes(10))
                .await
                .unwrap();

            let consumed = store.verify_and_consume("state-1").await.unwrap();
            assert_eq!(consumed, user, "{name}");
            assert_eq!(store.count().await.unwrap(), 0, "{name}");
        }
    }

    #[tokio::test]
    async fn test_state_is_single_use() {
        for (name, store) in stores() {
            let user = Uuid::new_v4();
            store
                .save_state("state-1", user, Duration::minutes(10))
                .await
                .unwrap();

            assert!(store.verify_and_consume("state-1").await.is_ok(), "{name}");
            assert!(
                matches!(
                    store.verify_and_consume("state-1").await,
                    Err(StateStoreError::InvalidOrExpiredState)
                ),
                "{name}"
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_state_rejected() {
        for (name, store) in stores() {
            assert!(
                matches!(
                    store.verify_and_consume("never-issued").await,
                    Err(StateStoreError::InvalidOrExpiredState)
                ),
                "{name}"
            );
        }
    }

    #[tokio::test]
    async fn test_expired_state_rejected_and_removed() {
        for (name, store) in stores() {
            let user = Uuid::new_v4();
            store
                .save_state("stale", user, Duration::seconds(-1))
                .await
                .unwrap();
            assert_eq!(store.count().await.unwrap(), 1, "{name}");

            assert!(
                matches!(
                    store.verify_and_consume("stale").await,
                    Err(StateStoreError::InvalidOrExpiredState)
                ),
                "{name}"
            );
            assert_eq!(store.count().await.unwrap(), 0, "{name}");
            assert!(
                matches!(
                    store.verify_and_consume("stale").await,
                    Err(StateStoreError::InvalidOrExpiredState)
                ),
                "{name}"
            );
        }
    }

    #[tokio::test]
    async fn test_duplicate_token_not_overwritten() {
        for (name, store) in stores() {
            let first = Uuid::new_v4();
            store
                .save_state("dup", first, Duration::minutes(10))
                .await
                .unwrap();

            let second = store
                .save_state("dup", Uuid::new_v4(), Duration::minutes(10))
                .await;
            assert!(matches!(second, Err(StateStoreError::Duplicate)), "{name}");

            assert_eq!(store.verify_and_consume("dup").await.unwrap(), first, "{name}");
        }
    }

    #[tokio::test]
    async fn test_concurrent_consume_succeeds_once() {
        for (name, store) in stores() {
            let user = Uuid::new_v4();
            store
                .save_state("contested", user, Duration::minutes(10))
                .await
                .unwrap();

            let mut handles = Vec::new();
            for _ in 0..8 {
                let store = Arc::clone(&store);
                handles.push(tokio::spawn(async move {
                    store.verify_and_consume("contested").await
                }));
            }

            let mut winners = 0;
            for handle in handles {
                match handle.await.unwrap() {
                    Ok(id) => {
                        assert_eq!(id, user);
                        winners += 1;
                    }
                    Err(StateStoreError::InvalidOrExpiredState) => {}
                    Err(other) => panic!("{name}: unexpected error {other}"),
                }
            }
            assert_eq!(winners, 1, "{name}");
        }
    }

    #[tokio::test]
    async fn test_purge_expired() {
        for (name, store) in stores() {
            store
                .save_state("old-1", Uuid::new_v4(), Duration::seconds(-5))
                .await
                .unwrap();
            store
                .save_state("old-2", Uuid::new_v4(), Duration::seconds(-5))
                .await
                .unwrap();
            store
                .save_state("fresh", Uuid::new_v4(), Duration::minutes(10))
                .await
                .unwrap();

            assert_eq!(store.purge_expired().await.unwrap(), 2, "{name}");
            assert_eq!(store.count().await.unwrap(), 1, "{name}");
            assert!(store.verify_and_consume("fresh").await.is_ok(), "{name}");
        }
    }

    #[tokio::test]
    async fn test_cleanup_task_purges_on_first_tick() {
        let store = Arc::new(MemoryStateStore::new());
        store
            .save_state("stale", Uuid::new_v4(), Duration::seconds(-5))
            .await
            .unwrap();
        store
            .save_state("live", Uuid::new_v4(), Duration::minutes(10))
            .await
            .unwrap();

        let handle = tokio::spawn(run_state_cleanup(store.clone(), 3600));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        handle.abort();

        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.verify_and_consume("live").await.is_ok());
    }
}
