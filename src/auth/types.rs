// Authentication types

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, Result};

/// Stored credential pair
///
/// Access and refresh tokens are independently nullable. Without a refresh
/// token the session cannot recover once the access token expires.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token,
        }
    }

    /// True when neither token is present
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }

    /// Decode the access token's claims
    pub fn claims(&self) -> Result<Claims> {
        let token = self.access_token.as_deref().ok_or(AuthError::NoCredential)?;
        Claims::decode(token)
    }

    /// Expiry (epoch seconds) of the access token, if it decodes and carries one
    pub fn expires_at(&self) -> Option<i64> {
        self.claims().ok().and_then(|c| c.exp)
    }

    /// Issue time (epoch seconds) of the access token
    pub fn issued_at(&self) -> Option<i64> {
        self.claims().ok().and_then(|c| c.iat)
    }

    /// Subject identity carried by the access token
    pub fn subject(&self) -> Option<User> {
        self.claims().ok().and_then(|c| c.user())
    }
}

/// Decoded access token claims
///
/// The signature is not verified here; the server does that on every call.
/// Only the payload is read to drive expiry decisions and identity display.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Claims {
    /// Decode the payload segment of a `header.payload.signature` token
    pub fn decode(token: &str) -> Result<Self> {
        let mut parts = token.split('.');
        let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(payload), Some(_), None) => payload,
            _ => {
                return Err(AuthError::DecodeError(
                    "token must have three segments".to_string(),
                ))
            }
        };

        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| AuthError::DecodeError(format!("payload is not base64url: {}", e)))?;

        serde_json::from_slice(&bytes)
            .map_err(|e| AuthError::DecodeError(format!("payload is not a claims object: {}", e)))
    }

    /// Identity described by these claims (requires a subject)
    pub fn user(&self) -> Option<User> {
        self.sub.as_ref().map(|id| User {
            id: id.clone(),
            email: self.email.clone(),
            name: self.name.clone(),
        })
    }
}

/// Authenticated storefront user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Derived authentication state consumed by UI and navigation guards
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub authenticated: bool,
    pub user: Option<User>,
    pub loading: bool,
}

/// Guest-cart correlation token (no refresh semantics)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestCartToken {
    pub token: String,
    pub expires_at: Option<i64>,
}

impl GuestCartToken {
    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }
}

/// Login request body
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// Registration request body
#[derive(Serialize)]
pub struct RegisterRequest<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub password: &'a str,
}

/// OTP verification request body
#[derive(Serialize)]
pub struct OtpVerifyRequest<'a> {
    pub email: &'a str,
    pub otp: &'a str,
}

/// Response of login, registration and OTP verification
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, rename = "requireOTP")]
    pub require_otp: bool,
}

/// Refresh request body (used only when no refresh cookie is present)
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<&'a str>,
}

/// Refresh response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub user: Option<User>,
}

/// Build an unsigned test token carrying the given claims
#[cfg(any(test, feature = "test-utils"))]
pub fn encode_test_token(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.signature", header, payload)
}
