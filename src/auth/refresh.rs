// Token refresh exchange

use reqwest::{header, Client};

use super::types::{Claims, Credential, RefreshRequest, RefreshResponse, User};
use crate::error::{AuthError, Result};

/// Result of a successful exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refreshed {
    pub credential: Credential,
    pub user: Option<User>,
}

/// Where the refresh token travels in the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Carrier<'a> {
    Cookie(&'a str),
    Body(&'a str),
}

/// Get refresh URL for the storefront API
fn get_refresh_url(base_url: &str) -> String {
    format!("{}/auth/refresh", base_url.trim_end_matches('/'))
}

/// Exchange a refresh token for a new access token
///
/// The cookie copy is preferred; the stored copy goes in the body only when
/// no cookie is present. Any non-success status is a rejection, and a
/// success body without an access token is treated as undecodable.
pub async fn exchange_refresh_token(
    client: &Client,
    base_url: &str,
    cookie_token: Option<&str>,
    stored_token: Option<&str>,
) -> Result<Refreshed> {
    let carrier = match (cookie_token, stored_token) {
        (Some(token), _) => Carrier::Cookie(token),
        (None, Some(token)) => Carrier::Body(token),
        (None, None) => return Err(AuthError::NoCredential),
    };

    let url = get_refresh_url(base_url);
    tracing::info!(
        url = %url,
        via_cookie = matches!(carrier, Carrier::Cookie(_)),
        "Refreshing access token..."
    );

    let request = match carrier {
        Carrier::Cookie(token) => client
            .post(&url)
            .header(header::COOKIE, format!("refreshToken={}", token))
            .json(&RefreshRequest { refresh_token: None }),
        Carrier::Body(token) => client.post(&url).json(&RefreshRequest {
            refresh_token: Some(token),
        }),
    };

    let response = request.send().await.map_err(|e| {
        tracing::warn!(error = %e, "Refresh exchange could not complete");
        AuthError::from_transport(&e)
    })?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        tracing::warn!(
            status = status.as_u16(),
            body = %error_text,
            "Refresh token rejected"
        );
        return Err(AuthError::RefreshRejected {
            status: status.as_u16(),
        });
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| AuthError::from_transport(&e))?;

    let data: RefreshResponse = serde_json::from_slice(&body)
        .map_err(|e| AuthError::DecodeError(format!("refresh response: {}", e)))?;

    let access_token = data
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            AuthError::DecodeError("refresh response does not contain accessToken".to_string())
        })?;

    let claims = Claims::decode(&access_token)?;

    // Rotation is optional; keep the token we sent when none comes back
    let refresh_token = data.refresh_token.or_else(|| match carrier {
        Carrier::Cookie(token) | Carrier::Body(token) => Some(token.to_string()),
    });

    tracing::info!(
        expires_at = ?claims.exp,
        rotated = refresh_token.as_deref() != cookie_token.or(stored_token),
        "Access token refreshed"
    );

    Ok(Refreshed {
        user: data.user.or_else(|| claims.user()),
        credential: Credential {
            access_token: Some(access_token),
            refresh_token,
        },
    })
}
