use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

use super::credentials::{CredentialStore, StoreChange};
use super::expiry::{unix_now, ExpiryPolicy, TokenStatus};
use super::refresh::{self, Refreshed};
use super::session::SessionState;
use super::types::{Claims, Credential, Session, User};
use crate::error::{AuthError, Result};

/// Outcome shared by every waiter of one refresh
pub type RefreshOutcome = Result<Credential>;

/// Why a refresh was requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// Dispatcher saw a near-expiry or worse credential before sending
    Proactive,
    /// Server answered 401 to a request sent with `rejected_token`
    Reactive { rejected_token: Option<String> },
    /// Background timer tick
    Periodic,
    /// Route change into a protected route
    Navigation,
    /// Session reconstruction at process start
    Bootstrap,
}

impl RefreshTrigger {
    fn label(&self) -> &'static str {
        match self {
            RefreshTrigger::Proactive => "proactive",
            RefreshTrigger::Reactive { .. } => "reactive",
            RefreshTrigger::Periodic => "periodic",
            RefreshTrigger::Navigation => "navigation",
            RefreshTrigger::Bootstrap => "bootstrap",
        }
    }
}

/// In-flight refresh marker; at most one exists at a time
struct RefreshTicket {
    id: u64,
    outcome: watch::Receiver<Option<RefreshOutcome>>,
}

/// What a caller got from the slot
enum Acquired {
    /// The store already holds a credential that needs no exchange
    Current(Credential),
    /// Outcome of the in-flight exchange
    Waiting(watch::Receiver<Option<RefreshOutcome>>),
}

struct Inner {
    client: Client,
    base_url: String,
    store: Arc<CredentialStore>,
    session: Arc<SessionState>,
    policy: ExpiryPolicy,
    exchange_timeout: Duration,

    /// Slot holding the current ticket, if a refresh is in flight
    in_flight: Mutex<Option<RefreshTicket>>,

    next_ticket: AtomicU64,

    /// Bumped by login/logout; settlements from an older epoch are discarded.
    /// Held across check-and-commit so overrides and settlements serialize.
    epoch: Mutex<u64>,
}

/// Refresh coordinator
///
/// Sole writer of the credential store and session state besides explicit
/// login/logout. Guarantees at most one refresh exchange in flight: callers
/// arriving while one runs attach to its ticket and receive the same outcome.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        store: Arc<CredentialStore>,
        session: Arc<SessionState>,
        policy: ExpiryPolicy,
        exchange_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                base_url: base_url.into(),
                store,
                session,
                policy,
                exchange_timeout,
                in_flight: Mutex::new(None),
                next_ticket: AtomicU64::new(0),
                epoch: Mutex::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.inner.store
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.inner.session
    }

    pub fn policy(&self) -> ExpiryPolicy {
        self.inner.policy
    }

    /// Classify the stored credential right now
    pub fn status(&self) -> TokenStatus {
        self.inner
            .policy
            .classify(self.inner.store.get().as_ref(), unix_now())
    }

    /// Whether a refresh exchange is currently in flight
    pub fn is_refreshing(&self) -> bool {
        self.lock_slot().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Obtain a usable credential, refreshing if needed
    ///
    /// A caller already holding a valid credential never causes an exchange.
    /// Otherwise the caller either starts the single in-flight exchange or
    /// waits on the one already running.
    pub async fn refresh(&self, trigger: RefreshTrigger) -> RefreshOutcome {
        self.reject_malformed()?;

        if let Some(credential) = self.short_circuit(&trigger) {
            tracing::trace!(trigger = trigger.label(), "Credential still valid, no refresh");
            return self.adopt(credential);
        }

        let mut outcome = match self.acquire_ticket(&trigger)? {
            Acquired::Current(credential) => {
                tracing::trace!(trigger = trigger.label(), "Refreshed meanwhile, no refresh");
                return self.adopt(credential);
            }
            Acquired::Waiting(outcome) => outcome,
        };
        let settled = outcome
            .wait_for(|o| o.is_some())
            .await
            .map(|o| o.clone())
            .ok()
            .flatten();

        settled.unwrap_or_else(|| {
            Err(AuthError::NetworkFailure(
                "refresh task ended without settling".to_string(),
            ))
        })
    }

    /// Reconstruct the session from the store at process start
    pub async fn bootstrap(&self) -> Session {
        let inner = &self.inner;
        let Some(stored) = inner.store.get() else {
            inner.session.set_unauthenticated();
            return inner.session.current();
        };

        if self.reject_malformed().is_err() {
            return inner.session.current();
        }

        let status = inner.policy.classify(Some(&stored), unix_now());
        if status.is_usable() {
            tracing::info!(status = ?status, "Restored session from stored credential");
            inner.session.set_authenticated(stored.subject());
        } else if let Err(e) = self.refresh(RefreshTrigger::Bootstrap).await {
            tracing::info!(error = %e, "No session restored");
        }

        inner.session.current()
    }

    /// Immediate override on login / OTP verification success
    pub(crate) fn establish(&self, credential: &Credential, user: Option<User>) -> Result<()> {
        let mut epoch = self.lock_epoch()?;
        *epoch += 1;

        let user = user.or_else(|| credential.subject());
        let session = &self.inner.session;
        self.inner
            .store
            .commit(StoreChange::Put(credential), || session.set_authenticated(user))
    }

    /// Immediate override on logout
    pub(crate) fn terminate(&self) -> Result<()> {
        let mut epoch = self.lock_epoch()?;
        *epoch += 1;

        let session = &self.inner.session;
        self.inner
            .store
            .commit(StoreChange::Clear, || session.set_unauthenticated())
    }

    /// Clear everything after detecting a malformed stored token
    pub(crate) fn discard_malformed(&self, reason: &AuthError) -> Result<()> {
        tracing::warn!(error = %reason, "Discarding malformed stored credential");
        self.terminate()
    }

    /// Clear the store when the stored access token does not decode
    fn reject_malformed(&self) -> Result<()> {
        let Some(token) = self.inner.store.get().and_then(|c| c.access_token) else {
            return Ok(());
        };
        let Err(e) = Claims::decode(&token) else {
            return Ok(());
        };

        if let Err(clear_err) = self.discard_malformed(&e) {
            tracing::error!(error = %clear_err, "Failed to clear malformed credential");
        }
        Err(e)
    }

    /// Mirror a still-usable stored credential into the session
    fn adopt(&self, credential: Credential) -> RefreshOutcome {
        if self.inner.session.is_authenticated() {
            return Ok(credential);
        }

        // Under the epoch lock a concurrent logout cannot interleave
        let _epoch = self.lock_epoch()?;
        if self.inner.store.get().as_ref() == Some(&credential) {
            tracing::debug!("Session adopted from stored credential");
            self.inner.session.set_authenticated(credential.subject());
            Ok(credential)
        } else {
            self.inner
                .store
                .get()
                .filter(|c| self.inner.policy.classify(Some(c), unix_now()).is_usable())
                .ok_or(AuthError::NoCredential)
        }
    }

    /// Credential that makes an exchange unnecessary, checked against the
    /// clock at the moment of the call
    fn short_circuit(&self, trigger: &RefreshTrigger) -> Option<Credential> {
        let stored = self.inner.store.get()?;
        let status = self.inner.policy.classify(Some(&stored), unix_now());

        match trigger {
            // The server refused this exact token; only a different usable
            // token (rotated by someone else meanwhile) avoids an exchange
            RefreshTrigger::Reactive { rejected_token } => {
                (status.is_usable() && stored.access_token != *rejected_token).then_some(stored)
            }
            _ if status == TokenStatus::Valid => Some(stored),
            // Nothing to exchange with; keep using the near-expiry token
            _ if status == TokenStatus::NearExpiry
                && stored.refresh_token.is_none()
                && self.inner.store.refresh_cookie().is_none() =>
            {
                Some(stored)
            }
            _ => None,
        }
    }

    /// Attach to the in-flight ticket or create one and start the exchange
    ///
    /// A settled ticket commits the store before leaving the slot, so the
    /// store is re-checked under the slot lock: a caller that lost the race
    /// against a just-finished exchange picks up its credential instead of
    /// starting another one.
    fn acquire_ticket(&self, trigger: &RefreshTrigger) -> Result<Acquired> {
        let mut slot = self.lock_slot()?;

        if let Some(ticket) = slot.as_ref() {
            tracing::debug!(
                ticket = ticket.id,
                trigger = trigger.label(),
                "Refresh already in flight, waiting"
            );
            return Ok(Acquired::Waiting(ticket.outcome.clone()));
        }

        if let Some(credential) = self.short_circuit(trigger) {
            return Ok(Acquired::Current(credential));
        }

        let id = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed) + 1;
        let epoch = *self.lock_epoch()?;
        let (tx, rx) = watch::channel(None);
        *slot = Some(RefreshTicket {
            id,
            outcome: rx.clone(),
        });
        drop(slot);

        tracing::debug!(ticket = id, trigger = trigger.label(), "Starting refresh");
        self.inner.session.set_loading(true);

        // Exchanges are not cancellable: the task outlives any waiter
        let coordinator = self.clone();
        tokio::spawn(async move {
            let _release = TicketRelease {
                coordinator: coordinator.clone(),
                id,
            };
            let outcome = coordinator.run_exchange(id, epoch).await;
            coordinator.release(id);
            tx.send_replace(Some(outcome));
        });

        Ok(Acquired::Waiting(rx))
    }

    async fn run_exchange(&self, id: u64, epoch: u64) -> RefreshOutcome {
        let inner = &self.inner;
        let cookie = inner.store.refresh_cookie();
        let stored = inner.store.get().and_then(|c| c.refresh_token);

        let exchange = refresh::exchange_refresh_token(
            &inner.client,
            &inner.base_url,
            cookie.as_deref(),
            stored.as_deref(),
        );

        let result = match tokio::time::timeout(inner.exchange_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(AuthError::NetworkFailure(format!(
                "refresh exchange timed out after {:?}",
                inner.exchange_timeout
            ))),
        };

        self.settle(id, epoch, result)
    }

    /// Apply a finished exchange to store and session
    fn settle(&self, id: u64, ticket_epoch: u64, result: Result<Refreshed>) -> RefreshOutcome {
        let inner = &self.inner;
        let epoch = self.lock_epoch()?;

        if *epoch != ticket_epoch {
            tracing::info!(ticket = id, "Session overridden during refresh, discarding result");
            inner.session.set_loading(false);
            let now = unix_now();
            return inner
                .store
                .get()
                .filter(|c| inner.policy.classify(Some(c), now).is_usable())
                .ok_or(AuthError::NoCredential);
        }

        match result {
            Ok(Refreshed { credential, user }) => {
                inner.store.commit(StoreChange::Put(&credential), || {
                    inner.session.set_authenticated(user)
                })?;
                tracing::info!(ticket = id, "Refresh succeeded");
                Ok(credential)
            }
            Err(e) if e.is_unrecoverable() => {
                tracing::warn!(ticket = id, error = %e, "Refresh failed, clearing session");
                inner
                    .store
                    .commit(StoreChange::Clear, || inner.session.set_unauthenticated())?;
                Err(e)
            }
            Err(e) => {
                // Availability over premature logout: keep the stored tokens and
                // stay authenticated while the access token is still usable
                let stored = inner.store.get();
                let status = inner.policy.classify(stored.as_ref(), unix_now());
                tracing::warn!(
                    ticket = id,
                    error = %e,
                    status = ?status,
                    "Refresh could not complete"
                );
                if status.is_usable() {
                    inner.session.set_loading(false);
                } else {
                    inner.session.set_unauthenticated();
                }
                Err(e)
            }
        }
    }

    /// Drop the ticket from the slot if it is still the current one
    fn release(&self, id: u64) -> bool {
        match self.lock_slot() {
            Ok(mut slot) if slot.as_ref().map(|t| t.id) == Some(id) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    fn lock_slot(&self) -> Result<MutexGuard<'_, Option<RefreshTicket>>> {
        self.inner
            .in_flight
            .lock()
            .map_err(|_| AuthError::Storage("refresh slot lock poisoned".to_string()))
    }

    fn lock_epoch(&self) -> Result<MutexGuard<'_, u64>> {
        self.inner
            .epoch
            .lock()
            .map_err(|_| AuthError::Storage("session epoch lock poisoned".to_string()))
    }
}

/// Frees the slot even if the exchange task unwinds
struct TicketRelease {
    coordinator: RefreshCoordinator,
    id: u64,
}

impl Drop for TicketRelease {
    fn drop(&mut self) {
        if self.coordinator.release(self.id) {
            tracing::error!(ticket = self.id, "Refresh task ended without settling");
            self.coordinator.inner.session.set_loading(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::encode_test_token;
    use serde_json::json;
    use std::io::Write;

    fn token(sub: &str, exp: i64) -> String {
        encode_test_token(&json!({"sub": sub, "exp": exp}))
    }

    fn coordinator(base_url: &str) -> RefreshCoordinator {
        RefreshCoordinator::new(
            Client::new(),
            base_url,
            Arc::new(CredentialStore::in_memory().unwrap()),
            Arc::new(SessionState::new()),
            ExpiryPolicy::default(),
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn test_valid_credential_short_circuits() {
        // Unroutable base URL: any exchange attempt would fail
        let coordinator = coordinator("http://127.0.0.1:1");
        let cred = Credential::new(token("u1", unix_now() + 3600), Some("r".to_string()));
        coordinator.store().put(&cred).unwrap();

        let outcome = coordinator.refresh(RefreshTrigger::Proactive).await;
        assert_eq!(outcome, Ok(cred));
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_near_expiry_without_refresh_token_keeps_credential() {
        let coordinator = coordinator("http://127.0.0.1:1");
        let cred = Credential::new(token("u1", unix_now() + 60), None);
        coordinator.store().put(&cred).unwrap();

        assert_eq!(coordinator.refresh(RefreshTrigger::Periodic).await, Ok(cred));
    }

    #[tokio::test]
    async fn test_reactive_refresh_with_rotated_token_short_circuits() {
        let coordinator = coordinator("http://127.0.0.1:1");
        let fresh = Credential::new(token("u1", unix_now() + 3600), Some("r".to_string()));
        coordinator.store().put(&fresh).unwrap();

        let outcome = coordinator
            .refresh(RefreshTrigger::Reactive {
                rejected_token: Some("older.token.value".to_string()),
            })
            .await;
        assert_eq!(outcome, Ok(fresh));
    }

    #[tokio::test]
    async fn test_reactive_refresh_of_rejected_token_exchanges() {
        let mut server = mockito::Server::new_async().await;
        let new_access = token("u1", unix_now() + 7200);
        let mock = server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_body(json!({"accessToken": new_access}).to_string())
            .expect(1)
            .create_async()
            .await;

        let coordinator = coordinator(&server.url());
        let rejected = token("u1", unix_now() + 3600);
        coordinator
            .store()
            .put(&Credential::new(rejected.clone(), Some("r".to_string())))
            .unwrap();

        let outcome = coordinator
            .refresh(RefreshTrigger::Reactive {
                rejected_token: Some(rejected),
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(outcome.access_token, Some(new_access));
        assert!(coordinator.session().is_authenticated());
    }

    #[tokio::test]
    async fn test_missing_refresh_token_fails_without_network() {
        let coordinator = coordinator("http://127.0.0.1:1");
        let outcome = coordinator.refresh(RefreshTrigger::Navigation).await;
        assert_eq!(outcome, Err(AuthError::NoCredential));
        assert!(!coordinator.session().is_authenticated());
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_network_failure_keeps_usable_credential() {
        let coordinator = coordinator("http://127.0.0.1:1");
        let near = Credential::new(token("u1", unix_now() + 60), Some("r".to_string()));
        coordinator.establish(&near, None).unwrap();

        let outcome = coordinator.refresh(RefreshTrigger::Proactive).await;
        assert!(matches!(outcome, Err(AuthError::NetworkFailure(_))));

        // Store untouched, still authenticated
        assert_eq!(coordinator.store().get(), Some(near));
        let session = coordinator.session().current();
        assert!(session.authenticated);
        assert!(!session.loading);
    }

    #[tokio::test]
    async fn test_network_failure_with_expired_token_unauthenticates_but_keeps_refresh() {
        let coordinator = coordinator("http://127.0.0.1:1");
        let expired = Credential::new(token("u1", unix_now() - 60), Some("r".to_string()));
        coordinator.establish(&expired, None).unwrap();

        let outcome = coordinator.refresh(RefreshTrigger::Periodic).await;
        assert!(matches!(outcome, Err(AuthError::NetworkFailure(_))));
        assert!(!coordinator.session().is_authenticated());
        assert_eq!(
            coordinator.store().get().and_then(|c| c.refresh_token).as_deref(),
            Some("r")
        );
    }

    #[tokio::test]
    async fn test_timeout_is_network_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/refresh")
            .with_chunked_body(|w| {
                std::thread::sleep(std::time::Duration::from_millis(500));
                w.write_all(b"{}")
            })
            .create_async()
            .await;

        let coordinator = RefreshCoordinator::new(
            Client::new(),
            server.url(),
            Arc::new(CredentialStore::in_memory().unwrap()),
            Arc::new(SessionState::new()),
            ExpiryPolicy::default(),
            Duration::from_millis(50),
        );
        coordinator
            .store()
            .put(&Credential {
                access_token: None,
                refresh_token: Some("r".to_string()),
            })
            .unwrap();

        let outcome = coordinator.refresh(RefreshTrigger::Bootstrap).await;
        assert!(matches!(outcome, Err(AuthError::NetworkFailure(_))));
    }

    #[tokio::test]
    async fn test_override_during_refresh_discards_settlement() {
        let mut server = mockito::Server::new_async().await;
        let refreshed_access = token("someone-else", unix_now() + 7200);
        let body = json!({"accessToken": refreshed_access}).to_string();
        server
            .mock("POST", "/auth/refresh")
            .with_chunked_body(move |w| {
                std::thread::sleep(std::time::Duration::from_millis(200));
                w.write_all(body.as_bytes())
            })
            .create_async()
            .await;

        let coordinator = coordinator(&server.url());
        coordinator
            .store()
            .put(&Credential {
                access_token: None,
                refresh_token: Some("r".to_string()),
            })
            .unwrap();

        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh(RefreshTrigger::Navigation).await })
        };

        // Wait for the ticket, then log in over it
        while !coordinator.is_refreshing() {
            tokio::task::yield_now().await;
        }
        let login = Credential::new(token("u1", unix_now() + 3600), Some("r-login".to_string()));
        coordinator.establish(&login, None).unwrap();

        let outcome = pending.await.unwrap();
        assert_eq!(outcome, Ok(login.clone()));
        assert_eq!(coordinator.store().get(), Some(login));
        assert_eq!(coordinator.session().user().unwrap().id, "u1");
    }

    #[tokio::test]
    async fn test_bootstrap_restores_valid_session() {
        let coordinator = coordinator("http://127.0.0.1:1");
        coordinator
            .store()
            .put(&Credential::new(token("u1", unix_now() + 3600), None))
            .unwrap();

        let session = coordinator.bootstrap().await;
        assert!(session.authenticated);
        assert_eq!(session.user.unwrap().id, "u1");
    }

    #[tokio::test]
    async fn test_bootstrap_discards_malformed_token() {
        let coordinator = coordinator("http://127.0.0.1:1");
        coordinator
            .store()
            .put(&Credential::new("definitely-not-a-jwt", Some("r".to_string())))
            .unwrap();

        let session = coordinator.bootstrap().await;
        assert!(!session.authenticated);
        assert!(coordinator.store().get().is_none());
    }

    #[tokio::test]
    async fn test_bootstrap_refreshes_expired_token() {
        let mut server = mockito::Server::new_async().await;
        let fresh = token("u1", unix_now() + 3600);
        let mock = server
            .mock("POST", "/auth/refresh")
            .match_header("cookie", "refreshToken=r")
            .with_status(200)
            .with_body(json!({"accessToken": fresh, "refreshToken": "r2"}).to_string())
            .expect(1)
            .create_async()
            .await;

        let coordinator = coordinator(&server.url());
        coordinator
            .store()
            .put(&Credential::new(token("u1", unix_now() - 60), Some("r".to_string())))
            .unwrap();

        let session = coordinator.bootstrap().await;
        mock.assert_async().await;
        assert!(session.authenticated);
        assert!(!session.loading);
        assert_eq!(
            coordinator.store().get(),
            Some(Credential::new(fresh, Some("r2".to_string())))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_staggered_burst_issues_one_exchange() {
        for _ in 0..20 {
            let mut server = mockito::Server::new_async().await;
            let body = json!({"accessToken": token("u1", unix_now() + 3600)}).to_string();
            let mock = server
                .mock("POST", "/auth/refresh")
                .with_chunked_body(move |w| {
                    std::thread::sleep(std::time::Duration::from_millis(3));
                    w.write_all(body.as_bytes())
                })
                .expect(1)
                .create_async()
                .await;

            let coordinator = coordinator(&server.url());
            coordinator
                .store()
                .put(&Credential::new(token("u1", unix_now() - 10), Some("r".to_string())))
                .unwrap();

            // Callers keep arriving before, during and right after the exchange
            let callers: Vec<_> = (0..200u64)
                .map(|i| {
                    let coordinator = coordinator.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_micros(i * 30)).await;
                        coordinator.refresh(RefreshTrigger::Proactive).await
                    })
                })
                .collect();

            for caller in callers {
                assert!(caller.await.unwrap().is_ok());
            }
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn test_valid_credential_authenticates_session() {
        let coordinator = coordinator("http://127.0.0.1:1");
        let cred = Credential::new(token("u1", unix_now() + 3600), None);
        coordinator.store().put(&cred).unwrap();
        assert!(!coordinator.session().is_authenticated());

        let outcome = coordinator.refresh(RefreshTrigger::Navigation).await;

        assert_eq!(outcome, Ok(cred));
        let session = coordinator.session().current();
        assert!(session.authenticated);
        assert_eq!(session.user.unwrap().id, "u1");
    }

    #[tokio::test]
    async fn test_malformed_token_is_discarded_without_exchange() {
        let coordinator = coordinator("http://127.0.0.1:1");
        coordinator
            .store()
            .put(&Credential::new("definitely-not-a-jwt", Some("r".to_string())))
            .unwrap();

        let outcome = coordinator.refresh(RefreshTrigger::Proactive).await;

        assert!(matches!(outcome, Err(AuthError::DecodeError(_))));
        assert!(coordinator.store().get().is_none());
        assert!(coordinator.store().refresh_cookie().is_none());
        assert!(!coordinator.is_refreshing());
    }

    #[test]
    fn test_trigger_labels() {
        assert_eq!(RefreshTrigger::Proactive.label(), "proactive");
        assert_eq!(
            RefreshTrigger::Reactive {
                rejected_token: None
            }
            .label(),
            "reactive"
        );
        assert_eq!(RefreshTrigger::Bootstrap.label(), "bootstrap");
    }
}
