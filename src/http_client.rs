use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, Request, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::auth::{Claims, GuestCartToken, RefreshCoordinator, RefreshTrigger, TokenStatus};
use crate::error::{AuthError, Result};

/// Header carrying the guest-cart correlation token on cart-scoped calls
pub const GUEST_CART_HEADER: &str = "x-guest-cart-token";

/// Storefront HTTP client with transparent credential handling
pub struct StorefrontHttpClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Storefront API base URL
    base_url: String,

    /// Refresh coordinator (single owner of credential refreshes)
    coordinator: RefreshCoordinator,
}

/// What happened to one dispatched request
struct Dispatched {
    response: Response,
    retried: bool,
    refresh_error: Option<AuthError>,
}

impl StorefrontHttpClient {
    pub fn new(client: Client, base_url: impl Into<String>, coordinator: RefreshCoordinator) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            coordinator,
        }
    }

    /// Absolute URL for an API path
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Start building a request against the API
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.url(path))
    }

    /// Send a request with credentials attached
    ///
    /// Refreshes proactively when the stored credential is near expiry or
    /// worse, and on a 401 refreshes once and retries once. Every other
    /// status is returned unchanged; a 401 whose refresh failed is returned
    /// as the original response.
    pub async fn dispatch(&self, request: Request) -> Result<Response> {
        Ok(self.dispatch_internal(request, false).await?.response)
    }

    /// Like [`dispatch`](Self::dispatch), also carrying the guest-cart token
    pub async fn dispatch_cart(&self, request: Request) -> Result<Response> {
        Ok(self.dispatch_internal(request, true).await?.response)
    }

    /// Dispatch and decode a JSON body, mapping failures to [`AuthError`]
    pub async fn dispatch_json<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        let dispatched = self.dispatch_internal(request, false).await?;
        let status = dispatched.response.status();

        if status.is_success() {
            return dispatched
                .response
                .json::<T>()
                .await
                .map_err(|e| AuthError::Api {
                    status: status.as_u16(),
                    message: format!("Failed to parse response: {}", e),
                });
        }

        if status == StatusCode::UNAUTHORIZED {
            return Err(match (dispatched.retried, dispatched.refresh_error) {
                (true, _) => AuthError::RetryExhausted {
                    status: status.as_u16(),
                },
                (false, Some(e)) => e,
                (false, None) => AuthError::NoCredential,
            });
        }

        let message = dispatched.response.text().await.unwrap_or_default();
        Err(AuthError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn dispatch_internal(&self, request: Request, cart_scoped: bool) -> Result<Dispatched> {
        let method = request.method().clone();
        let url = request.url().clone();
        tracing::debug!(method = %method, url = %url, "Dispatching request");

        let access_token = self.prepare_access_token().await;

        let attempt = request.try_clone().ok_or_else(|| {
            AuthError::InvalidRequest("Request body is not cloneable".to_string())
        })?;
        let response = self
            .send(attempt, access_token.as_deref(), cart_scoped)
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(Dispatched {
                response,
                retried: false,
                refresh_error: None,
            });
        }

        tracing::warn!(url = %url, "Received 401, refreshing credential and retrying once");

        let refreshed = self
            .coordinator
            .refresh(RefreshTrigger::Reactive {
                rejected_token: access_token,
            })
            .await;

        match refreshed {
            Ok(credential) => {
                let retry = self
                    .send(request, credential.access_token.as_deref(), cart_scoped)
                    .await?;

                if retry.status() == StatusCode::UNAUTHORIZED {
                    tracing::warn!(url = %url, "Still unauthorized after retry, giving up");
                }

                Ok(Dispatched {
                    response: retry,
                    retried: true,
                    refresh_error: None,
                })
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Refresh after 401 failed");
                Ok(Dispatched {
                    response,
                    retried: false,
                    refresh_error: Some(e),
                })
            }
        }
    }

    /// Access token to attach, refreshing first when the policy asks for it
    async fn prepare_access_token(&self) -> Option<String> {
        let store = self.coordinator.store();

        match self.coordinator.status() {
            TokenStatus::Valid => return store.get().and_then(|c| c.access_token),
            // Anonymous caller: nothing to attach and nothing to refresh with
            TokenStatus::Missing if !self.has_refresh_credential() => return None,
            _ => {}
        }

        match self.coordinator.refresh(RefreshTrigger::Proactive).await {
            Ok(credential) => credential.access_token,
            Err(e) => {
                // Keep using a token that has not actually expired yet
                let fallback = store
                    .get()
                    .filter(|_| self.coordinator.status().is_usable())
                    .and_then(|c| c.access_token);
                tracing::warn!(
                    error = %e,
                    using_existing = fallback.is_some(),
                    "Proactive refresh failed"
                );
                fallback
            }
        }
    }

    fn has_refresh_credential(&self) -> bool {
        let store = self.coordinator.store();
        store.refresh_cookie().is_some() || store.get().and_then(|c| c.refresh_token).is_some()
    }

    async fn send(
        &self,
        mut request: Request,
        access_token: Option<&str>,
        cart_scoped: bool,
    ) -> Result<Response> {
        if let Some(token) = access_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| AuthError::InvalidRequest(format!("Invalid access token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        if cart_scoped {
            if let Some(cart) = self.coordinator.store().guest_cart_token() {
                match HeaderValue::from_str(&cart.token) {
                    Ok(value) => {
                        request.headers_mut().insert(GUEST_CART_HEADER, value);
                    }
                    Err(e) => tracing::warn!("Ignoring unusable guest cart token: {}", e),
                }
            }
        }

        let url = request.url().clone();
        let response = self.client.execute(request).await.map_err(|e| {
            let err = AuthError::from_transport(&e);
            tracing::warn!(url = %url, error = %err, "HTTP request error");
            err
        })?;

        tracing::debug!(status = %response.status(), url = %url, "Received HTTP response");

        if cart_scoped {
            self.capture_guest_cart_token(&response);
        }

        Ok(response)
    }

    /// Store a guest-cart token issued by the server
    fn capture_guest_cart_token(&self, response: &Response) {
        let Some(token) = response
            .headers()
            .get(GUEST_CART_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        else {
            return;
        };

        let store = self.coordinator.store();
        if store.guest_cart_token().is_some_and(|current| current.token == token) {
            return;
        }

        let cart = GuestCartToken {
            token: token.to_string(),
            expires_at: Claims::decode(token).ok().and_then(|c| c.exp),
        };
        match store.put_guest_cart_token(&cart) {
            Ok(()) => tracing::debug!("Stored new guest cart token"),
            Err(e) => tracing::warn!("Failed to store guest cart token: {}", e),
        }
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }
}
