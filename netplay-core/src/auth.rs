//! Bearer tokens and admin credential checks.
//!
//! Tokens are two base64url segments joined by a dot:
//!
//! ```text
//!   base64url({"iat":..,"exp":..}) . base64url(HMAC-SHA256(key, segment1))
//! ```
//!
//! When no signing key is configured every token is rejected.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Issued at, seconds since the Unix epoch
    pub iat: u64,
    /// Expiry, seconds since the Unix epoch
    pub exp: u64,
}

pub struct TokenIssuer {
    key: Option<hmac::Key>,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: Option<&str>, ttl: Duration) -> Self {
        Self {
            key: secret.map(|s| hmac::Key::new(hmac::HMAC_SHA256, s.as_bytes())),
            ttl,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    pub fn issue(&self) -> Result<String, AuthError> {
        self.issue_at(unix_now())
    }

    pub fn issue_at(&self, now: u64) -> Result<String, AuthError> {
        let key = self.key.as_ref().ok_or(AuthError::NoKey)?;
        let claims = Claims {
            iat: now,
            exp: now + self.ttl.as_secs(),
        };
        let body = serde_json::to_vec(&claims).map_err(|_| AuthError::Malformed)?;
        let body = URL_SAFE_NO_PAD.encode(body);
        let tag = hmac::sign(key, body.as_bytes());
        Ok(format!("{}.{}", body, URL_SAFE_NO_PAD.encode(tag.as_ref())))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        self.verify_at(token, unix_now())
    }

    pub fn verify_at(&self, token: &str, now: u64) -> Result<Claims, AuthError> {
        let key = self.key.as_ref().ok_or(AuthError::NoKey)?;
        let (body, tag) = token.split_once('.').ok_or(AuthError::Malformed)?;
        let tag = URL_SAFE_NO_PAD.decode(tag).map_err(|_| AuthError::Malformed)?;
        hmac::verify(key, body.as_bytes(), &tag).map_err(|_| AuthError::BadSignature)?;

        let body = URL_SAFE_NO_PAD.decode(body).map_err(|_| AuthError::Malformed)?;
        let claims: Claims = serde_json::from_slice(&body).map_err(|_| AuthError::Malformed)?;
        if now >= claims.exp {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }
}

/// Constant-time comparison of a presented credential against a configured
/// one. An unconfigured credential rejects everything.
pub fn check_credential(expected: Option<&str>, presented: Option<&str>) -> Result<(), AuthError> {
    let expected = expected.ok_or(AuthError::NoKey)?;
    let presented = presented.ok_or(AuthError::InvalidCredential)?;
    // Equal tags iff equal credentials
    let key = hmac::Key::new(hmac::HMAC_SHA256, b"netplay-credential");
    let tag = hmac::sign(&key, expected.as_bytes());
    hmac::verify(&key, presented.as_bytes(), tag.as_ref()).map_err(|_| AuthError::InvalidCredential)
}

/// Extract a bearer token from an `Authorization` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
