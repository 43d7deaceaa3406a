//! The OAuth state cookie.
//!
//! State rides in a cookie instead of the broker URL so it never shows up in
//! the broker's logs, referrers, or our own access logs.

use axum::http::header::{InvalidHeaderValue, COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use chrono::Duration;

pub const DEFAULT_COOKIE_NAME: &str = "kite_oauth_state";

/// Builds, clears and reads the `HttpOnly; SameSite=Lax` state cookie.
#[derive(Clone, Debug)]
pub struct StateCookie {
    name: String,
    secure: bool,
    max_age: Duration,
    cleared: HeaderValue,
}

impl StateCookie {
    pub fn new(
        name: impl Into<String>,
        secure: bool,
        max_age: Duration,
    ) -> Result<Self, InvalidHeaderValue> {
        let name = name.into();
        let cleared = HeaderValue::from_str(&render(&name, "", 0, secure))?;
        Ok(Self {
            name,
            secure,
            max_age,
            cleared,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `Set-Cookie` value delivering `value`.
    pub fn build(&self, value: &str) -> Result<HeaderValue, InvalidHeaderValue> {
        HeaderValue::from_str(&render(
            &self.name,
            value,
            self.max_age.num_seconds(),
            self.secure,
        ))
    }

    /// `Set-Cookie` value that deletes the cookie in the browser.
    pub fn clear(&self) -> HeaderValue {
        self.cleared.clone()
    }

    /// Reads the cookie from the request's `Cookie` headers.
    pub fn read(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.name)
            .map(|(_, value)| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

fn render(name: &str, value: &str, max_age: i64, secure: bool) -> String {
    let mut cookie = format!("{name}={value}; Path=/; Max-Age={max_age}; HttpOnly; SameSite=Lax");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}
