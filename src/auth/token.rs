//! HMAC-signed tokens for session identity and OAuth anti-replay state.
//!
//! One [`TokenIssuer`] is built at startup from the signing secret and
//! shared by both uses. The `purpose` claim keeps them apart: a session
//! token is never accepted as state and vice versa.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Value of the `iss` claim on every token this service mints.
pub const ISSUER: &str = "brokerlink";

/// What a token may be used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPurpose {
    /// Caller identity after login, sent as a bearer token
    Session,
    /// OAuth state cookie binding a broker redirect to its initiator
    BrokerState,
}

/// Claims carried by every token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject, duplicated for consumers that read `user_id`. Tokens
    /// minted elsewhere may only carry `sub`.
    #[serde(default)]
    pub user_id: String,
    pub sub: String,
    pub purpose: TokenPurpose,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub iss: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    /// Signature was fine but `exp` has passed.
    #[error("token has expired")]
    Expired,

    /// Anything else: bad signature, wrong algorithm, malformed, not yet valid.
    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// Issues and verifies HS256 tokens under a single shared secret.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenIssuer {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_issuer(&[ISSUER]);
        validation.set_required_spec_claims(&["exp", "nbf", "sub", "iss"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Mints a token for `subject` valid for `ttl` from now.
    pub fn issue(
        &self,
        subject: &str,
        purpose: TokenPurpose,
        extra: Map<String, Value>,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        self.issue_at(subject, purpose, extra, ttl, Utc::now())
    }

    pub(crate) fn issue_at(
        &self,
        subject: &str,
        purpose: TokenPurpose,
        extra: Map<String, Value>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let issued_at = now.timestamp();
        let claims = Claims {
            user_id: subject.to_string(),
            sub: subject.to_string(),
            purpose,
            iat: issued_at,
            nbf: issued_at,
            exp: (now + ttl).timestamp(),
            iss: ISSUER.to_string(),
            extra,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    /// Verifies signature, issuer, `nbf` and `exp`, then returns the claims.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::ImmatureSignature => TokenError::Invalid("token not yet valid".into()),
                ErrorKind::InvalidSignature => TokenError::Invalid("signature mismatch".into()),
                ErrorKind::InvalidAlgorithm => TokenError::Invalid("unexpected algorithm".into()),
                ErrorKind::InvalidIssuer => TokenError::Invalid("unexpected issuer".into()),
                other => TokenError::Invalid(format!("{other:?}")),
            })
    }

    /// Verifies the token and additionally requires `purpose`.
    pub fn verify_for(&self, token: &str, purpose: TokenPurpose) -> Result<Claims, TokenError> {
        let claims = self.verify(token)?;
        if claims.purpose != purpose {
            return Err(TokenError::Invalid("token issued for another purpose".into()));
        }
        Ok(claims)
    }
}
