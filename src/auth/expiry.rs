// Expiry policy
// Pure classification of a credential against a caller-supplied clock

use super::types::Credential;

/// Default proactive refresh window (5 minutes before expiry)
pub const DEFAULT_NEAR_EXPIRY_SECS: i64 = 300;

/// Classification of the current access credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Missing,
    Expired,
    NearExpiry,
    Valid,
}

impl TokenStatus {
    /// Whether a refresh should be requested before using the credential
    pub fn needs_refresh(self) -> bool {
        !matches!(self, TokenStatus::Valid)
    }

    /// Whether the access token can still be attached to a request
    pub fn is_usable(self) -> bool {
        matches!(self, TokenStatus::Valid | TokenStatus::NearExpiry)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExpiryPolicy {
    near_expiry_secs: i64,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_NEAR_EXPIRY_SECS as u64)
    }
}

impl ExpiryPolicy {
    pub fn new(near_expiry_secs: u64) -> Self {
        Self {
            near_expiry_secs: near_expiry_secs.min(i64::MAX as u64) as i64,
        }
    }

    pub fn near_expiry_secs(&self) -> i64 {
        self.near_expiry_secs
    }

    /// Classify `credential` at `now` (epoch seconds)
    ///
    /// A token that fails to decode, or decodes without an `exp` claim,
    /// counts as expired.
    pub fn classify(&self, credential: Option<&Credential>, now: i64) -> TokenStatus {
        let Some(credential) = credential.filter(|c| c.access_token.is_some()) else {
            return TokenStatus::Missing;
        };

        let Some(exp) = credential.expires_at() else {
            return TokenStatus::Expired;
        };

        if exp <= now {
            TokenStatus::Expired
        } else if exp.saturating_sub(now) <= self.near_expiry_secs {
            TokenStatus::NearExpiry
        } else {
            TokenStatus::Valid
        }
    }
}

/// Current wall clock in epoch seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
