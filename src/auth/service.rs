// Login, registration, OTP verification and logout

use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::Client;
use serde::Serialize;

use super::coordinator::RefreshCoordinator;
use super::types::{
    AuthResponse, Claims, Credential, LoginRequest, OtpVerifyRequest, RegisterRequest, User,
};
use crate::error::{AuthError, Result};

/// Result of a login or registration attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Credentials stored, session authenticated
    Authenticated(Option<User>),
    /// Nothing stored yet; call `verify_otp` with the emailed code
    OtpRequired { email: String },
}

/// Which flow an OTP belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpPurpose {
    Login,
    Registration,
}

impl OtpPurpose {
    fn path(self) -> &'static str {
        match self {
            OtpPurpose::Login => "/auth/login/verify-otp",
            OtpPurpose::Registration => "/auth/register/verify-otp",
        }
    }
}

/// Explicit session overrides: everything here bypasses the refresh path
pub struct AuthService {
    client: Client,
    base_url: String,
    coordinator: RefreshCoordinator,
}

impl AuthService {
    pub fn new(client: Client, base_url: impl Into<String>, coordinator: RefreshCoordinator) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            coordinator,
        }
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome> {
        tracing::info!(email = %email, "Logging in");
        let response: AuthResponse = self
            .post("/auth/login", &LoginRequest { email, password })
            .await?;
        self.complete(email, response, true)
    }

    pub async fn register(&self, name: &str, email: &str, password: &str) -> Result<LoginOutcome> {
        tracing::info!(email = %email, "Registering");
        let response: AuthResponse = self
            .post(
                "/auth/register",
                &RegisterRequest {
                    name,
                    email,
                    password,
                },
            )
            .await?;
        self.complete(email, response, true)
    }

    pub async fn verify_otp(
        &self,
        email: &str,
        otp: &str,
        purpose: OtpPurpose,
    ) -> Result<LoginOutcome> {
        tracing::info!(email = %email, purpose = ?purpose, "Verifying OTP");
        let response: AuthResponse = self
            .post(purpose.path(), &OtpVerifyRequest { email, otp })
            .await?;
        self.complete(email, response, false)
    }

    /// End the session
    ///
    /// The server call is best-effort; local credentials and session state
    /// are cleared regardless of its outcome.
    pub async fn logout(&self) -> Result<()> {
        let access_token = self
            .coordinator
            .store()
            .get()
            .and_then(|c| c.access_token);

        let mut request = self.client.post(self.url("/auth/logout"));
        if let Some(value) = access_token
            .and_then(|t| HeaderValue::from_str(&format!("Bearer {}", t)).ok())
        {
            request = request.header(AUTHORIZATION, value);
        }

        match request.send().await {
            Ok(response) if !response.status().is_success() => {
                tracing::debug!(status = %response.status(), "Server logout not acknowledged");
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "Server logout failed"),
        }

        self.coordinator.terminate()?;
        tracing::info!("Logged out");
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<AuthResponse> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| AuthError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), path = %path, "Auth request failed");
            return Err(AuthError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| AuthError::DecodeError(format!("auth response: {}", e)))
    }

    /// Store the credential from a successful response, or report that an
    /// OTP step is still pending
    fn complete(&self, email: &str, response: AuthResponse, otp_allowed: bool) -> Result<LoginOutcome> {
        if otp_allowed && response.require_otp {
            tracing::info!(email = %email, "OTP verification required");
            return Ok(LoginOutcome::OtpRequired {
                email: email.to_string(),
            });
        }

        let access_token = response
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                AuthError::DecodeError("auth response does not contain accessToken".to_string())
            })?;
        let claims = Claims::decode(&access_token)?;

        let user = response.user.or_else(|| claims.user());
        let credential = Credential {
            access_token: Some(access_token),
            refresh_token: response.refresh_token,
        };
        self.coordinator.establish(&credential, user.clone())?;

        tracing::info!(
            user = user.as_ref().map(|u| u.id.as_str()).unwrap_or("unknown"),
            "Authenticated"
        );
        Ok(LoginOutcome::Authenticated(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::encode_test_token;
    use crate::auth::{unix_now, CredentialStore, ExpiryPolicy, SessionState};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn service(base_url: &str) -> AuthService {
        let coordinator = RefreshCoordinator::new(
            Client::new(),
            base_url,
            Arc::new(CredentialStore::in_memory().unwrap()),
            Arc::new(SessionState::new()),
            ExpiryPolicy::default(),
            Duration::from_secs(5),
        );
        AuthService::new(Client::new(), base_url, coordinator)
    }

    fn access_token() -> String {
        encode_test_token(&json!({"sub": "u1", "exp": unix_now() + 3600}))
    }

    #[tokio::test]
    async fn test_login_stores_credential() {
        let mut server = mockito::Server::new_async().await;
        let token = access_token();
        server
            .mock("POST", "/auth/login")
            .match_body(mockito::Matcher::Json(
                json!({"email": "ada@example.com", "password": "hunter2"}),
            ))
            .with_status(200)
            .with_body(
                json!({
                    "user": {"_id": "u1", "email": "ada@example.com", "name": "Ada"},
                    "accessToken": token,
                    "refreshToken": "r1"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let service = service(&server.url());
        let outcome = service.login("ada@example.com", "hunter2").await.unwrap();

        let user = match outcome {
            LoginOutcome::Authenticated(Some(user)) => user,
            other => panic!("expected authenticated outcome, got {:?}", other),
        };
        assert_eq!(user.name.as_deref(), Some("Ada"));

        let stored = service.coordinator.store().get().unwrap();
        assert_eq!(stored.access_token, Some(token));
        assert_eq!(stored.refresh_token.as_deref(), Some("r1"));
        assert!(service.coordinator.session().is_authenticated());
    }

    #[tokio::test]
    async fn test_login_requiring_otp_stores_nothing() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/login")
            .with_status(200)
            .with_body(json!({"user": {"_id": "u1"}, "requireOTP": true}).to_string())
            .create_async()
            .await;
        server
            .mock("POST", "/auth/login/verify-otp")
            .match_body(mockito::Matcher::Json(
                json!({"email": "ada@example.com", "otp": "123456"}),
            ))
            .with_status(200)
            .with_body(json!({"user": {"_id": "u1"}, "accessToken": access_token()}).to_string())
            .create_async()
            .await;

        let service = service(&server.url());
        let outcome = service.login("ada@example.com", "hunter2").await.unwrap();
        assert_eq!(
            outcome,
            LoginOutcome::OtpRequired {
                email: "ada@example.com".to_string()
            }
        );
        assert!(service.coordinator.store().get().is_none());
        assert!(!service.coordinator.session().is_authenticated());

        let outcome = service
            .verify_otp("ada@example.com", "123456", OtpPurpose::Login)
            .await
            .unwrap();
        assert!(matches!(outcome, LoginOutcome::Authenticated(_)));
        assert!(service.coordinator.session().is_authenticated());
    }

    #[tokio::test]
    async fn test_registration_otp_path() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/register")
            .with_status(201)
            .with_body(json!({"requireOTP": true}).to_string())
            .create_async()
            .await;
        let verify = server
            .mock("POST", "/auth/register/verify-otp")
            .with_status(200)
            .with_body(json!({"accessToken": access_token()}).to_string())
            .create_async()
            .await;

        let service = service(&server.url());
        let outcome = service
            .register("Ada", "ada@example.com", "hunter2")
            .await
            .unwrap();
        assert!(matches!(outcome, LoginOutcome::OtpRequired { .. }));

        let outcome = service
            .verify_otp("ada@example.com", "654321", OtpPurpose::Registration)
            .await
            .unwrap();
        verify.assert_async().await;

        // User derived from the token's claims when the body has none
        assert_eq!(
            outcome,
            LoginOutcome::Authenticated(Some(User {
                id: "u1".to_string(),
                email: None,
                name: None
            }))
        );
    }

    #[tokio::test]
    async fn test_bad_password_is_api_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/login")
            .with_status(401)
            .with_body("Invalid credentials")
            .create_async()
            .await;

        let service = service(&server.url());
        let err = service.login("ada@example.com", "wrong").await.unwrap_err();
        assert_eq!(
            err,
            AuthError::Api {
                status: 401,
                message: "Invalid credentials".to_string()
            }
        );
        assert!(service.coordinator.store().get().is_none());
    }

    #[tokio::test]
    async fn test_malformed_access_token_not_stored() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/login")
            .with_status(200)
            .with_body(json!({"accessToken": "not-a-jwt"}).to_string())
            .create_async()
            .await;

        let service = service(&server.url());
        let err = service.login("ada@example.com", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::DecodeError(_)));
        assert!(service.coordinator.store().get().is_none());
    }

    #[tokio::test]
    async fn test_logout_clears_even_when_server_unreachable() {
        let service = service("http://127.0.0.1:1");
        let credential = Credential::new(access_token(), Some("r1".to_string()));
        service.coordinator.establish(&credential, None).unwrap();

        service.logout().await.unwrap();

        assert!(service.coordinator.store().get().is_none());
        assert!(service.coordinator.store().refresh_cookie().is_none());
        assert!(!service.coordinator.session().is_authenticated());
    }
}
