use axum::http::HeaderMap;
use thiserror::Error;
use uuid::Uuid;

mod token;

pub use token::{Claims, TokenError, TokenIssuer, TokenPurpose, ISSUER};


/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
/// Returns the token string if present and valid.
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, BearerError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(BearerError::Missing)?
        .to_str()
        .map_err(|_| BearerError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

/// Parse bearer token from Authorization header value
fn parse_bearer_token(header_value: &str) -> Result<String, BearerError> {
    let parts: Vec<&str> = header_value.splitn(2, ' ').collect();

    if parts.len() != 2 {
        return Err(BearerError::InvalidFormat);
    }

    if parts[0].to_lowercase() != "bearer" {
        return Err(BearerError::InvalidFormat);
    }

    let token = parts[1].trim();

    if token.is_empty() {
        return Err(BearerError::Empty);
    }

    Ok(token.to_string())
}

/// Bearer header extraction errors
#[derive(Debug, Error, PartialEq, Clone)]
pub enum BearerError {
    /// Authorization header not present
    #[error("Authorization token not provided")]
    Missing,
    /// Invalid format (not "Bearer <token>")
    #[error("Invalid authorization token format")]
    InvalidFormat,
    /// Token is empty string
    #[error("Authorization token is empty")]
    Empty,
}

/// Why a request could not be tied to a user.
#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("{0}")]
    Bearer(#[from] BearerError),

    /// Session token was authentic but has expired; callers surface this
    /// as "session expired" rather than a generic rejection.
    #[error("session has expired")]
    SessionExpired,

    #[error("invalid session token")]
    InvalidSession,
}

/// Resolves the caller's user id from a bearer session token.
///
/// The identity layer that issues session tokens lives outside this crate;
/// it signs them with the same secret and `TokenPurpose::Session`.
pub fn authenticate_session(headers: &HeaderMap, issuer: &TokenIssuer) -> Result<Uuid, AuthError> {
    let token = extract_bearer_token(headers)?;

    let claims = issuer
        .verify_for(&token, TokenPurpose::Session)
        .map_err(|e| match e {
            TokenError::Expired => AuthError::SessionExpired,
            other => {
                tracing::debug!(error = %other, "Session token rejected");
                AuthError::InvalidSession
            }
        })?;

    // Prefer the dedicated claim, fall back to the standard subject.
    let subject = if claims.user_id.is_empty() {
        &claims.sub
    } else {
        &claims.user_id
    };

    Uuid::parse_str(subject).map_err(|_| AuthError::InvalidSession)
}
