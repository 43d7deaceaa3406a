//! Broker connection endpoints.
//!
//! - GET /api/brokers/:broker/connect   (bearer session) → broker login page
//! - GET /api/brokers/:broker/callback  (broker redirect) → app redirect
//! - GET /api/brokers/:broker/status    (bearer session) → link status JSON
//!
//! The callback never renders an error page: every outcome is a redirect
//! back into the app with an opaque code.

use crate::auth::{authenticate_session, AuthError, TokenIssuer};
use crate::credentials::{CredentialStore, CredentialStoreError};
use crate::oauth::{AuthorizationFlow, CallbackQuery};
use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

const BROKER_PLACEHOLDER: &str = "{broker}";

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Application error types for broker endpoints
enum AppError {
    Unauthorized(String),
    NotFound(String),
    ServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });

        (status, body).into_response()
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::SessionExpired => AppError::Unauthorized("Session has expired".to_string()),
            other => AppError::Unauthorized(format!("Invalid token: {}", other)),
        }
    }
}

/// Where the callback sends the user afterwards.
#[derive(Clone, Debug)]
pub struct RedirectTargets {
    success: String,
    error_base: String,
}

impl RedirectTargets {
    /// Both targets may contain `{broker}`. The error code is appended to
    /// `error_base` as is.
    pub fn new(success: impl Into<String>, error_base: impl Into<String>) -> Self {
        Self {
            success: success.into(),
            error_base: error_base.into(),
        }
    }

    pub fn success_for(&self, broker: &str) -> String {
        self.success.replace(BROKER_PLACEHOLDER, broker)
    }

    pub fn error_for(&self, broker: &str, code: &str) -> String {
        format!("{}{}", self.error_base.replace(BROKER_PLACEHOLDER, broker), code)
    }
}

/// Shared application state for broker API
#[derive(Clone)]
pub struct BrokerAppState {
    /// Registered flows keyed by broker name
    pub flows: HashMap<String, Arc<AuthorizationFlow>>,
    pub issuer: Arc<TokenIssuer>,
    pub credential_store: Arc<dyn CredentialStore>,
    pub redirects: RedirectTargets,
}

impl BrokerAppState {
    pub fn new(
        issuer: Arc<TokenIssuer>,
        credential_store: Arc<dyn CredentialStore>,
        redirects: RedirectTargets,
    ) -> Self {
        Self {
            flows: HashMap::new(),
            issuer,
            credential_store,
            redirects,
        }
    }

    /// Registers a flow under its broker's name.
    pub fn with_flow(mut self, flow: Arc<AuthorizationFlow>) -> Self {
        self.flows.insert(flow.broker_name().to_string(), flow);
        self
    }

    fn flow(&self, broker: &str) -> Result<&Arc<AuthorizationFlow>, AppError> {
        self.flows.get(broker).ok_or_else(|| {
            warn!(broker = %broker, "Unknown broker requested");
            AppError::NotFound(format!("Broker '{}' not found", broker))
        })
    }
}

/// Link status of a broker for the calling user
#[derive(Debug, Serialize)]
pub struct BrokerStatusResponse {
    pub broker: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Create broker API router
pub fn create_broker_router(state: BrokerAppState) -> Router {
    Router::new()
        .route("/api/brokers/:broker/connect", get(broker_connect))
        .route("/api/brokers/:broker/callback", get(broker_callback))
        .route("/api/brokers/:broker/status", get(broker_status))
        .with_state(Arc::new(state))
}

/// GET /api/brokers/:broker/connect
///
/// Starts authorization: mints a single-use state, hands it to the browser
/// as a cookie and redirects to the broker's login page.
///
/// # Security
/// - Requires bearer session token
/// - State never appears in the redirect URL
async fn broker_connect(
    State(state): State<Arc<BrokerAppState>>,
    Path(broker): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    debug!(broker = %broker, "Broker connect requested");

    let flow = state.flow(&broker)?;
    let user_id = authenticate_session(&headers, &state.issuer)?;

    let initiation = flow.initiate(user_id).await.map_err(|e| {
        error!(broker = %broker, user_id = %user_id, error = %e, "Failed to start broker authorization");
        AppError::ServerError("Failed to start broker authorization".to_string())
    })?;

    let mut response = Redirect::temporary(&initiation.login_url).into_response();
    response
        .headers_mut()
        .insert(SET_COOKIE, initiation.set_cookie);
    Ok(response)
}

/// GET /api/brokers/:broker/callback
///
/// Completes authorization. Unauthenticated: the broker redirect carries no
/// session, the state cookie ties it to a user.
async fn broker_callback(
    State(state): State<Arc<BrokerAppState>>,
    Path(broker): Path<String>,
    query: Result<Query<CallbackQuery>, QueryRejection>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    debug!(broker = %broker, "Broker callback received");

    let flow = state.flow(&broker)?;

    // An unparseable query carries no usable request token; it still has to
    // end in a redirect that clears the cookie.
    let query = match query {
        Ok(Query(query)) => query,
        Err(rejection) => {
            warn!(broker = %broker, error = %rejection.body_text(), "Malformed broker callback query");
            CallbackQuery::default()
        }
    };
    let state_cookie = flow.state_cookie().read(&headers);

    let completion = flow.complete(&query, state_cookie.as_deref()).await;

    let target = match &completion.result {
        Ok(_) => state.redirects.success_for(&broker),
        Err(e) => state.redirects.error_for(&broker, e.code()),
    };

    let mut response = Redirect::temporary(&target).into_response();
    if let Some(clear) = completion.clear_cookie {
        response.headers_mut().append(SET_COOKIE, clear);
    }
    Ok(response)
}

/// GET /api/brokers/:broker/status
async fn broker_status(
    State(state): State<Arc<BrokerAppState>>,
    Path(broker): Path<String>,
    headers: HeaderMap,
) -> Result<Json<BrokerStatusResponse>, AppError> {
    state.flow(&broker)?;
    let user_id = authenticate_session(&headers, &state.issuer)?;

    match state.credential_store.get_credential(user_id, &broker).await {
        Ok(credential) => Ok(Json(BrokerStatusResponse {
            broker,
            connected: true,
            broker_user_id: Some(credential.broker_user_id),
            connected_at: Some(credential.created_at),
            updated_at: Some(credential.updated_at),
        })),
        Err(CredentialStoreError::CredentialsNotFound) => Ok(Json(BrokerStatusResponse {
            broker,
            connected: false,
            broker_user_id: None,
            connected_at: None,
            updated_at: None,
        })),
        Err(e) => {
            error!(broker = %broker, user_id = %user_id, error = %e, "Failed to load broker credential");
            Err(AppError::ServerError("Failed to load broker status".to_string()))
        }
    }
}
