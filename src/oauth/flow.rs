//! Broker authorization flow.
//!
//! Two entry points, no in-process state between them:
//!
//! ```text
//! initiate(user)                         complete(query, cookie)
//!   mint state (TokenIssuer)               1. broker status + request_token
//!   save_state (StateStore)                2. cookie present
//!   Set-Cookie + broker login URL          3. verify cookie signature
//!                                          4. (cookie is cleared from here on)
//!                                          5. verify_and_consume (StateStore)
//!                                          6. exchange_request_token (broker)
//!                                          7. save_or_update (CredentialStore)
//! ```

use crate::auth::{TokenIssuer, TokenPurpose};
use crate::broker::BrokerConnect;
use crate::credentials::CredentialStore;
use crate::oauth::cookie::StateCookie;
use crate::oauth::state_store::{StateStore, StateStoreError};
use axum::http::HeaderValue;
use chrono::Duration;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Query parameters of the broker's redirect back to us
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CallbackQuery {
    pub status: Option<String>,
    pub request_token: Option<String>,
    /// Broker-supplied failure description, logged only
    pub message: Option<String>,
}

/// Timing knobs for the flow.
#[derive(Clone, Debug)]
pub struct FlowSettings {
    /// Lifetime of the state cookie and its stored row
    pub state_ttl: Duration,
    pub exchange_timeout: std::time::Duration,
    /// Bound on state store calls. Credential stores carry their own.
    pub store_timeout: std::time::Duration,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            state_ttl: Duration::minutes(10),
            exchange_timeout: std::time::Duration::from_secs(10),
            store_timeout: std::time::Duration::from_secs(5),
        }
    }
}

/// Terminal failure of a callback. Each variant maps to one redirect code.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("broker reported failure or omitted the request token")]
    CallbackFailed,

    #[error("state cookie missing")]
    MissingStateCookie,

    #[error("state cookie rejected: {0}")]
    InvalidState(String),

    #[error("state token is invalid, expired or already used")]
    InvalidOrExpiredState,

    #[error("request token exchange failed: {0}")]
    TokenExchangeFailed(String),

    #[error("failed to persist broker credentials: {0}")]
    CredentialPersistFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FlowError {
    /// Opaque code placed in the error redirect. Never carries detail.
    pub fn code(&self) -> &'static str {
        match self {
            FlowError::CallbackFailed => "callback_failed",
            FlowError::MissingStateCookie => "missing_state_cookie",
            FlowError::InvalidState(_) | FlowError::InvalidOrExpiredState => "invalid_state",
            FlowError::TokenExchangeFailed(_) => "token_exchange_failed",
            FlowError::CredentialPersistFailed(_) => "credential_persist_failed",
            FlowError::Internal(_) => "internal_error",
        }
    }
}

/// Result of [`AuthorizationFlow::initiate`].
#[derive(Debug)]
pub struct Initiation {
    /// Where to redirect the user
    pub login_url: String,
    /// `Set-Cookie` value carrying the state token
    pub set_cookie: HeaderValue,
}

/// A broker account that was just linked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerLink {
    pub user_id: Uuid,
    pub broker: String,
    pub broker_user_id: String,
}

/// Result of [`AuthorizationFlow::complete`].
#[derive(Debug)]
pub struct Completion {
    pub result: Result<BrokerLink, FlowError>,
    /// `Set-Cookie` value clearing the state cookie; present whenever the
    /// request carried one, whatever the outcome.
    pub clear_cookie: Option<HeaderValue>,
}

/// Coordinates initiation and completion for a single broker.
pub struct AuthorizationFlow {
    broker: Arc<dyn BrokerConnect>,
    api_secret: String,
    issuer: Arc<TokenIssuer>,
    state_store: Arc<dyn StateStore>,
    credential_store: Arc<dyn CredentialStore>,
    cookie: StateCookie,
    settings: FlowSettings,
}

impl AuthorizationFlow {
    pub fn new(
        broker: Arc<dyn BrokerConnect>,
        api_secret: impl Into<String>,
        issuer: Arc<TokenIssuer>,
        state_store: Arc<dyn StateStore>,
        credential_store: Arc<dyn CredentialStore>,
        cookie: StateCookie,
        settings: FlowSettings,
    ) -> Self {
        Self {
            broker,
            api_secret: api_secret.into(),
            issuer,
            state_store,
            credential_store,
            cookie,
            settings,
        }
    }

    pub fn broker_name(&self) -> &str {
        self.broker.name()
    }

    pub fn state_cookie(&self) -> &StateCookie {
        &self.cookie
    }

    /// Mints and stores a state token for `user_id` and returns the broker
    /// login URL plus the cookie delivering the state.
    pub async fn initiate(&self, user_id: Uuid) -> Result<Initiation, FlowError> {
        let broker = self.broker.name();

        let mut extra = Map::new();
        extra.insert("broker".into(), Value::String(broker.to_string()));
        // Two initiations within the same second must not mint the same token.
        extra.insert("nonce".into(), Value::String(Uuid::new_v4().to_string()));

        let state = self
            .issuer
            .issue(
                &user_id.to_string(),
                TokenPurpose::BrokerState,
                extra,
                self.settings.state_ttl,
            )
            .map_err(|e| FlowError::Internal(format!("state minting failed: {e}")))?;

        match tokio::time::timeout(
            self.settings.store_timeout,
            self.state_store
                .save_state(&state, user_id, self.settings.state_ttl),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(FlowError::Internal(format!("state save failed: {e}"))),
            Err(_) => return Err(FlowError::Internal("state save timed out".into())),
        }

        let set_cookie = self
            .cookie
            .build(&state)
            .map_err(|e| FlowError::Internal(format!("state cookie construction failed: {e}")))?;

        info!(user_id = %user_id, broker = %broker, "Initiating broker authorization");

        Ok(Initiation {
            login_url: self.broker.login_url(),
            set_cookie,
        })
    }

    /// Handles the broker's redirect back.
    pub async fn complete(&self, query: &CallbackQuery, state_cookie: Option<&str>) -> Completion {
        let clear_cookie = state_cookie.map(|_| self.cookie.clear());
        let result = self.run_completion(query, state_cookie).await;

        match &result {
            Ok(link) => info!(
                user_id = %link.user_id,
                broker = %link.broker,
                broker_user_id = %link.broker_user_id,
                "Broker authorization completed"
            ),
            Err(e) => warn!(
                broker = %self.broker.name(),
                code = e.code(),
                error = %e,
                "Broker authorization failed"
            ),
        }

        Completion {
            result,
            clear_cookie,
        }
    }

    async fn run_completion(
        &self,
        query: &CallbackQuery,
        state_cookie: Option<&str>,
    ) -> Result<BrokerLink, FlowError> {
        let broker = self.broker.name();

        // 1. Broker's own verdict
        let request_token = match (query.status.as_deref(), query.request_token.as_deref()) {
            (Some("success"), Some(token)) if !token.is_empty() => token,
            (status, _) => {
                debug!(
                    broker = %broker,
                    status = ?status,
                    message = ?query.message,
                    "Broker callback without success status or request token"
                );
                return Err(FlowError::CallbackFailed);
            }
        };

        // 2. Cookie present
        let state = state_cookie
            .filter(|s| !s.is_empty())
            .ok_or(FlowError::MissingStateCookie)?;

        // 3. Signature, expiry, purpose, broker
        let claims = self
            .issuer
            .verify_for(state, TokenPurpose::BrokerState)
            .map_err(|e| FlowError::InvalidState(e.to_string()))?;

        if claims.extra.get("broker").and_then(Value::as_str) != Some(broker) {
            return Err(FlowError::InvalidState("state minted for another broker".into()));
        }

        let claimed_user = Uuid::parse_str(&claims.sub)
            .map_err(|_| FlowError::InvalidState("subject is not a user id".into()))?;

        // 5. Single-use consumption
        let user_id = match tokio::time::timeout(
            self.settings.store_timeout,
            self.state_store.verify_and_consume(state),
        )
        .await
        {
            Ok(Ok(user_id)) => user_id,
            Ok(Err(StateStoreError::InvalidOrExpiredState)) => {
                return Err(FlowError::InvalidOrExpiredState)
            }
            Ok(Err(e)) => return Err(FlowError::Internal(format!("state verification failed: {e}"))),
            Err(_) => return Err(FlowError::Internal("state verification timed out".into())),
        };

        if user_id != claimed_user {
            return Err(FlowError::InvalidState("state bound to another user".into()));
        }

        // 6. Request token -> session
        let session = match tokio::time::timeout(
            self.settings.exchange_timeout,
            self.broker
                .exchange_request_token(request_token, &self.api_secret),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(FlowError::TokenExchangeFailed(e.to_string())),
            Err(_) => return Err(FlowError::TokenExchangeFailed("exchange timed out".into())),
        };

        // 7. Encrypt + upsert. The store bounds its own write and never
        // commits after returning an error.
        self.credential_store
            .save_or_update(
                user_id,
                broker,
                &session.access_token,
                &session.public_token,
                &session.broker_user_id,
            )
            .await
            .map_err(|e| FlowError::CredentialPersistFailed(e.to_string()))?;

        Ok(BrokerLink {
            user_id,
            broker: broker.to_string(),
            broker_user_id: session.broker_user_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, BrokerSession};
    use crate::credentials::{CredentialStoreError, SqliteCredentialStore};
    use crate::oauth::state_store::MemoryStateStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SECRET: &[u8] = b"flow-test-signing-secret";

    /// Broker double returning a fixed outcome and counting exchanges.
    struct FakeBroker {
        outcome: Result<BrokerSession, &'static str>,
        delay: Option<std::time::Duration>,
        exchanges: AtomicUsize,
    }

    impl FakeBroker {
        fn ok() -> Self {
            Self {
                outcome: Ok(BrokerSession {
                    access_token: "AT1".into(),
                    public_token: "PT1".into(),
                    broker_user_id: "BU1".into(),
                }),
                delay: None,
                exchanges: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                outcome: Err("TokenException"),
                ..Self::ok()
            }
        }
    }

    #[async_trait]
    impl BrokerConnect for FakeBroker {
        fn name(&self) -> &str {
            "kite"
        }

        fn login_url(&self) -> String {
            "https://kite.example.com/connect/login?v=3&api_key=k".into()
        }

        async fn exchange_request_token(
            &self,
            request_token: &str,
            api_secret: &str,
        ) -> Result<BrokerSession, BrokerError> {
            assert_eq!(request_token, "RT1");
            assert_eq!(api_secret, "api-secret");
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.outcome
                .clone()
                .map_err(|e| BrokerError::SessionExchangeFailed(e.into()))
        }
    }

    /// Credential store that always fails to write.
    struct BrokenCredentialStore;

    #[async_trait]
    impl CredentialStore for BrokenCredentialStore {
        async fn save_or_update(
            &self,
            _: Uuid,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<(), CredentialStoreError> {
            Err(CredentialStoreError::Task("disk full".into()))
        }

        async fn get_access_token(&self, _: Uuid, _: &str) -> Result<String, CredentialStoreError> {
            Err(CredentialStoreError::CredentialsNotFound)
        }

        async fn get_credential(
            &self,
            _: Uuid,
            _: &str,
        ) -> Result<crate::credentials::BrokerCredential, CredentialStoreError> {
            Err(CredentialStoreError::CredentialsNotFound)
        }
    }

    struct Harness {
        flow: AuthorizationFlow,
        broker: Arc<FakeBroker>,
        issuer: Arc<TokenIssuer>,
        credentials: Arc<SqliteCredentialStore>,
    }

    fn harness_with(broker: FakeBroker, credentials: Option<Arc<dyn CredentialStore>>) -> Harness {
        let broker = Arc::new(broker);
        let issuer = Arc::new(TokenIssuer::new(SECRET));
        let sqlite = Arc::new(SqliteCredentialStore::new(":memory:", [3u8; 32]).unwrap());
        let credential_store =
            credentials.unwrap_or_else(|| sqlite.clone() as Arc<dyn CredentialStore>);

        let flow = AuthorizationFlow::new(
            broker.clone(),
            "api-secret",
            issuer.clone(),
            Arc::new(MemoryStateStore::new()),
            credential_store,
            StateCookie::new("kite_oauth_state", true, Duration::minutes(10)).unwrap(),
            FlowSettings {
                exchange_timeout: std::time::Duration::from_millis(200),
                ..FlowSettings::default()
            },
        );

        Harness {
            flow,
            broker,
            issuer,
            credentials: sqlite,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeBroker::ok(), None)
    }

    fn success_query() -> CallbackQuery {
        CallbackQuery {
            status: Some("success".into()),
            request_token: Some("RT1".into()),
            message: None,
        }
    }

    /// Pulls the token back out of a `Set-Cookie` value.
    fn cookie_value(set_cookie: &HeaderValue) -> String {
        let raw = set_cookie.to_str().unwrap();
        let pair = raw.split(';').next().unwrap();
        pair.split_once('=').unwrap().1.to_string()
    }

    #[tokio::test]
    async fn test_end_to_end_links_broker() {
        let h = harness();
        let user = Uuid::new_v4();

        let initiation = h.flow.initiate(user).await.unwrap();
        assert_eq!(initiation.login_url, "https://kite.example.com/connect/login?v=3&api_key=k");
        let state = cookie_value(&initiation.set_cookie);

        let completion = h.flow.complete(&success_query(), Some(&state)).await;
        let link = completion.result.unwrap();
        assert_eq!(link.user_id, user);
        assert_eq!(link.broker, "kite");
        assert_eq!(link.broker_user_id, "BU1");
        assert!(completion.clear_cookie.is_some());

        assert_eq!(h.credentials.get_access_token(user, "kite").await.unwrap(), "AT1");
        let credential = h.credentials.get_credential(user, "kite").await.unwrap();
        assert_eq!(credential.public_token, "PT1");
        assert_eq!(credential.broker_user_id, "BU1");
    }

    #[tokio::test]
    async fn test_state_cookie_cannot_be_replayed() {
        let h = harness();
        let user = Uuid::new_v4();
        let state = cookie_value(&h.flow.initiate(user).await.unwrap().set_cookie);

        assert!(h.flow.complete(&success_query(), Some(&state)).await.result.is_ok());

        let replay = h.flow.complete(&success_query(), Some(&state)).await;
        assert!(matches!(replay.result, Err(FlowError::InvalidOrExpiredState)));
        assert!(replay.clear_cookie.is_some());
        assert_eq!(h.broker.exchanges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_each_initiation_mints_distinct_state() {
        let h = harness();
        let user = Uuid::new_v4();

        let first = cookie_value(&h.flow.initiate(user).await.unwrap().set_cookie);
        let second = cookie_value(&h.flow.initiate(user).await.unwrap().set_cookie);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_callback_failure_status() {
        let h = harness();
        let query = CallbackQuery {
            status: Some("error".into()),
            request_token: None,
            message: Some("user cancelled".into()),
        };

        let completion = h.flow.complete(&query, Some("whatever")).await;
        assert!(matches!(completion.result, Err(FlowError::CallbackFailed)));
        assert!(completion.clear_cookie.is_some());

        let missing_token = CallbackQuery {
            status: Some("success".into()),
            request_token: Some(String::new()),
            message: None,
        };
        let completion = h.flow.complete(&missing_token, None).await;
        assert!(matches!(completion.result, Err(FlowError::CallbackFailed)));
        assert!(completion.clear_cookie.is_none());
    }

    #[tokio::test]
    async fn test_missing_state_cookie() {
        let h = harness();
        let completion = h.flow.complete(&success_query(), None).await;
        assert!(matches!(completion.result, Err(FlowError::MissingStateCookie)));
        assert_eq!(completion.result.unwrap_err().code(), "missing_state_cookie");
    }

    #[tokio::test]
    async fn test_forged_state_cookie() {
        let h = harness();
        let forged = TokenIssuer::new(b"attacker-secret")
            .issue(
                &Uuid::new_v4().to_string(),
                TokenPurpose::BrokerState,
                Map::new(),
                Duration::minutes(10),
            )
            .unwrap();

        let completion = h.flow.complete(&success_query(), Some(&forged)).await;
        assert!(matches!(completion.result, Err(FlowError::InvalidState(_))));
        assert!(completion.clear_cookie.is_some());
        assert_eq!(h.broker.exchanges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_session_token_is_not_state() {
        let h = harness();
        let session = h
            .issuer
            .issue(
                &Uuid::new_v4().to_string(),
                TokenPurpose::Session,
                Map::new(),
                Duration::minutes(60),
            )
            .unwrap();

        let completion = h.flow.complete(&success_query(), Some(&session)).await;
        assert!(matches!(completion.result, Err(FlowError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_expired_state_cookie() {
        let h = harness();
        let mut extra = Map::new();
        extra.insert("broker".into(), Value::String("kite".into()));
        let expired = h
            .issuer
            .issue_at(
                &Uuid::new_v4().to_string(),
                TokenPurpose::BrokerState,
                extra,
                Duration::minutes(10),
                chrono::Utc::now() - Duration::minutes(30),
            )
            .unwrap();

        let completion = h.flow.complete(&success_query(), Some(&expired)).await;
        let err = completion.result.unwrap_err();
        assert!(matches!(err, FlowError::InvalidState(_)));
        assert_eq!(err.code(), "invalid_state");
    }

    #[tokio::test]
    async fn test_signed_but_unsaved_state_rejected() {
        let h = harness();
        let mut extra = Map::new();
        extra.insert("broker".into(), Value::String("kite".into()));
        let unsaved = h
            .issuer
            .issue(
                &Uuid::new_v4().to_string(),
                TokenPurpose::BrokerState,
                extra,
                Duration::minutes(10),
            )
            .unwrap();

        let completion = h.flow.complete(&success_query(), Some(&unsaved)).await;
        assert!(matches!(completion.result, Err(FlowError::InvalidOrExpiredState)));
    }

    #[tokio::test]
    async fn test_exchange_failure() {
        let h = harness_with(FakeBroker::failing(), None);
        let user = Uuid::new_v4();
        let state = cookie_value(&h.flow.initiate(user).await.unwrap().set_cookie);

        let completion = h.flow.complete(&success_query(), Some(&state)).await;
        let err = completion.result.unwrap_err();
        assert!(matches!(err, FlowError::TokenExchangeFailed(_)));
        assert_eq!(err.code(), "token_exchange_failed");
        assert!(matches!(
            h.credentials.get_access_token(user, "kite").await,
            Err(CredentialStoreError::CredentialsNotFound)
        ));
    }

    #[tokio::test]
    async fn test_exchange_timeout() {
        let broker = FakeBroker {
            delay: Some(std::time::Duration::from_secs(5)),
            ..FakeBroker::ok()
        };
        let h = harness_with(broker, None);
        let user = Uuid::new_v4();
        let state = cookie_value(&h.flow.initiate(user).await.unwrap().set_cookie);

        let completion = h.flow.complete(&success_query(), Some(&state)).await;
        assert!(matches!(completion.result, Err(FlowError::TokenExchangeFailed(_))));
        assert!(matches!(
            h.credentials.get_access_token(user, "kite").await,
            Err(CredentialStoreError::CredentialsNotFound)
        ));
    }

    #[tokio::test]
    async fn test_persist_failure() {
        let h = harness_with(FakeBroker::ok(), Some(Arc::new(BrokenCredentialStore)));
        let state = cookie_value(&h.flow.initiate(Uuid::new_v4()).await.unwrap().set_cookie);

        let completion = h.flow.complete(&success_query(), Some(&state)).await;
        let err = completion.result.unwrap_err();
        assert!(matches!(err, FlowError::CredentialPersistFailed(_)));
        assert_eq!(err.code(), "credential_persist_failed");
        assert!(completion.clear_cookie.is_some());
    }

    /// Another connection holds the write lock past the store's deadline.
    #[tokio::test]
    async fn test_persist_timeout_stores_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("credentials.db");
        let store = Arc::new(
            SqliteCredentialStore::new(&path, [3u8; 32])
                .unwrap()
                .with_write_timeout(std::time::Duration::from_millis(200)),
        );
        let h = harness_with(FakeBroker::ok(), Some(store.clone() as Arc<dyn CredentialStore>));
        let user = Uuid::new_v4();
        let state = cookie_value(&h.flow.initiate(user).await.unwrap().set_cookie);

        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let lock_path = path.clone();
        let holder = std::thread::spawn(move || {
            let conn = rusqlite::Connection::open(lock_path).unwrap();
            conn.execute_batch("BEGIN IMMEDIATE").unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(600));
            conn.execute_batch("COMMIT").unwrap();
        });
        locked_rx.recv().unwrap();

        let completion = h.flow.complete(&success_query(), Some(&state)).await;
        let err = completion.result.unwrap_err();
        assert!(matches!(err, FlowError::CredentialPersistFailed(_)));
        assert_eq!(err.code(), "credential_persist_failed");

        holder.join().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(matches!(
            store.get_access_token(user, "kite").await,
            Err(CredentialStoreError::CredentialsNotFound)
        ));
    }

    #[test]
    fn test_error_codes_are_distinct_and_opaque() {
        let errors = [
            FlowError::CallbackFailed,
            FlowError::MissingStateCookie,
            FlowError::InvalidState("signature mismatch".into()),
            FlowError::TokenExchangeFailed("HTTP 403 TokenException".into()),
            FlowError::CredentialPersistFailed("disk full".into()),
            FlowError::Internal("db locked".into()),
        ];

        let codes: std::collections::HashSet<_> = errors.iter().map(FlowError::code).collect();
        assert_eq!(codes.len(), errors.len());
        for code in codes {
            assert!(code.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
        assert_eq!(FlowError::InvalidOrExpiredState.code(), "invalid_state");
    }
}
