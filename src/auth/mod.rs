// Authentication module
// Credential storage, expiry classification, single-flight refresh and session state

mod coordinator;
mod credentials;
mod expiry;
mod refresh;
mod service;
mod session;
mod timer;
mod types;

pub use coordinator::{RefreshCoordinator, RefreshOutcome, RefreshTrigger};
pub use credentials::{CredentialStore, ACCESS_TOKEN_KEY, GUEST_CART_KEY, REFRESH_TOKEN_KEY};
pub use expiry::{unix_now, ExpiryPolicy, TokenStatus, DEFAULT_NEAR_EXPIRY_SECS};
pub use refresh::{exchange_refresh_token, Refreshed};
pub use service::{AuthService, LoginOutcome, OtpPurpose};
pub use session::SessionState;
pub use timer::{RefreshTimer, DEFAULT_REFRESH_INTERVAL};
pub use types::{Claims, Credential, GuestCartToken, Session, User};

// Re-export for testing
#[cfg(any(test, feature = "test-utils"))]
pub use types::encode_test_token;
