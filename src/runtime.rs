// Composition root
// Wires store, session, coordinator, dispatcher, auth service and navigation guard

use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{
    AuthService, CredentialStore, ExpiryPolicy, RefreshCoordinator, RefreshTimer, Session,
    SessionState,
};
use crate::config::Config;
use crate::http_client::StorefrontHttpClient;
use crate::navigation::{NavigationGuard, RouteTable};

pub struct AuthRuntime {
    coordinator: RefreshCoordinator,
    http: StorefrontHttpClient,
    auth: AuthService,
    guard: NavigationGuard,
    refresh_interval: Duration,
}

impl AuthRuntime {
    /// Open the configured credential store and build every component
    pub fn new(config: &Config) -> Result<Self> {
        let store = CredentialStore::open(&config.store_file).with_context(|| {
            format!(
                "Failed to open credential store: {}",
                config.store_file.display()
            )
        })?;
        Self::with_store(config, store)
    }

    /// Build every component around an already-open store
    pub fn with_store(config: &Config, store: CredentialStore) -> Result<Self> {
        let request_timeout = Duration::from_secs(config.http_request_timeout);
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.http_connect_timeout))
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let coordinator = RefreshCoordinator::new(
            client.clone(),
            config.api_url.clone(),
            Arc::new(store),
            Arc::new(SessionState::new()),
            ExpiryPolicy::new(config.token_refresh_threshold),
            request_timeout,
        );

        let http = StorefrontHttpClient::new(client.clone(), config.api_url.clone(), coordinator.clone());
        let auth = AuthService::new(client, config.api_url.clone(), coordinator.clone());
        let guard = NavigationGuard::new(
            coordinator.clone(),
            RouteTable::new(config.public_routes.clone(), config.login_route.clone()),
        );

        tracing::debug!(
            api_url = %config.api_url,
            threshold_secs = config.token_refresh_threshold,
            "Auth runtime initialized"
        );

        Ok(Self {
            coordinator,
            http,
            auth,
            guard,
            refresh_interval: Duration::from_secs(config.token_refresh_interval),
        })
    }

    /// Reconstruct session state from the store
    pub async fn bootstrap(&self) -> Session {
        self.coordinator.bootstrap().await
    }

    /// Spawn the periodic refresh timer; it stops when the handle is dropped
    pub fn start_refresh_timer(&self) -> RefreshTimer {
        RefreshTimer::spawn(self.coordinator.clone(), self.refresh_interval)
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn http(&self) -> &StorefrontHttpClient {
        &self.http
    }

    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    pub fn guard(&self) -> &NavigationGuard {
        &self.guard
    }

    pub fn session(&self) -> &Arc<SessionState> {
        self.coordinator.session()
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        self.coordinator.store()
    }
}
