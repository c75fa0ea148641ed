// Navigation guard
// Enforces authentication on route changes into protected routes

use reqwest::Url;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::auth::{RefreshCoordinator, RefreshTrigger, TokenStatus};

/// Query parameter carrying the originally requested path to the login route
pub const REDIRECT_PARAM: &str = "redirect";

/// Outcome of a navigation check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationDecision {
    /// Render the target route
    Allow,
    /// Send the user elsewhere (login, carrying the intended path)
    Redirect { to: String },
    /// A newer navigation started while this one was being checked
    Superseded,
}

/// Public routes and the login route
#[derive(Debug, Clone)]
pub struct RouteTable {
    public: Vec<String>,
    login_route: String,
}

impl RouteTable {
    pub fn new(public: Vec<String>, login_route: impl Into<String>) -> Self {
        let login_route = login_route.into();
        let mut public = public;
        if !public.contains(&login_route) {
            public.push(login_route.clone());
        }
        Self {
            public,
            login_route,
        }
    }

    /// Exact match, or a path below a public route (except `/` itself)
    pub fn is_public(&self, path: &str) -> bool {
        let path = strip_query(path);
        self.public.iter().any(|route| {
            let route = route.trim_end_matches('/');
            if route.is_empty() {
                return path == "/";
            }
            path == route
                || path
                    .strip_prefix(route)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    pub fn login_route(&self) -> &str {
        &self.login_route
    }

    /// Login route carrying `intended` so the flow can resume after login
    pub fn login_redirect(&self, intended: &str) -> String {
        let base = format!("http://storefront.local{}", self.login_route);
        match Url::parse_with_params(&base, &[(REDIRECT_PARAM, intended)]) {
            Ok(url) => format!("{}?{}", url.path(), url.query().unwrap_or_default()),
            Err(e) => {
                tracing::warn!("Invalid login route {}: {}", self.login_route, e);
                self.login_route.clone()
            }
        }
    }
}

fn strip_query(path: &str) -> &str {
    path.split(['?', '#']).next().unwrap_or(path)
}

/// One route change
///
/// Holds the "already checked" latch for exactly one navigation. A new
/// cycle starts with the latch open, so a credential that expired between
/// navigations is always re-validated.
#[derive(Debug)]
pub struct NavigationCycle {
    id: u64,
    path: String,
    decision: Option<NavigationDecision>,
}

impl NavigationCycle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_checked(&self) -> bool {
        self.decision.is_some()
    }
}

pub struct NavigationGuard {
    coordinator: RefreshCoordinator,
    routes: RouteTable,
    current_cycle: AtomicU64,
}

impl NavigationGuard {
    pub fn new(coordinator: RefreshCoordinator, routes: RouteTable) -> Self {
        Self {
            coordinator,
            routes,
            current_cycle: AtomicU64::new(0),
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Start a new navigation cycle, superseding any previous one
    pub fn begin(&self, path: impl Into<String>) -> NavigationCycle {
        let id = self.current_cycle.fetch_add(1, Ordering::SeqCst) + 1;
        NavigationCycle {
            id,
            path: path.into(),
            decision: None,
        }
    }

    /// Begin and check a route change in one step
    pub async fn navigate(&self, path: &str) -> NavigationDecision {
        let mut cycle = self.begin(path);
        self.check(&mut cycle).await
    }

    /// Decide whether the cycle's route may render
    ///
    /// Repeated checks within one cycle return the latched decision without
    /// consulting the coordinator again.
    pub async fn check(&self, cycle: &mut NavigationCycle) -> NavigationDecision {
        if let Some(decision) = &cycle.decision {
            return decision.clone();
        }

        let decision = self.evaluate(&cycle.path).await;

        let decision = if self.current_cycle.load(Ordering::SeqCst) != cycle.id {
            tracing::debug!(cycle = cycle.id, path = %cycle.path, "Navigation superseded");
            NavigationDecision::Superseded
        } else {
            decision
        };

        tracing::debug!(cycle = cycle.id, path = %cycle.path, decision = ?decision, "Navigation checked");
        cycle.decision = Some(decision.clone());
        decision
    }

    async fn evaluate(&self, path: &str) -> NavigationDecision {
        if self.routes.is_public(path) {
            return NavigationDecision::Allow;
        }

        let authenticated = self.coordinator.session().is_authenticated();
        let status = self.coordinator.status();
        if authenticated && !matches!(status, TokenStatus::Expired | TokenStatus::Missing) {
            return NavigationDecision::Allow;
        }

        match self.coordinator.refresh(RefreshTrigger::Navigation).await {
            Ok(_) => NavigationDecision::Allow,
            // Transient failure with a token that still works: stay put
            Err(e) if !e.is_unrecoverable() && self.coordinator.status().is_usable() => {
                tracing::warn!(error = %e, "Refresh failed during navigation, token still usable");
                NavigationDecision::Allow
            }
            Err(e) => {
                tracing::info!(path = %path, error = %e, "Not authenticated, redirecting to login");
                NavigationDecision::Redirect {
                    to: self.routes.login_redirect(path),
                }
            }
        }
    }
}
