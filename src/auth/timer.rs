// Periodic refresh timer
// Keeps long-lived sessions alive without user-triggered traffic

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::coordinator::{RefreshCoordinator, RefreshTrigger};

/// Default tick interval (5 minutes)
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Background refresh task; ticks only while the session is authenticated.
/// Aborted when dropped.
pub struct RefreshTimer {
    handle: JoinHandle<()>,
}

impl RefreshTimer {
    pub fn spawn(coordinator: RefreshCoordinator, interval: Duration) -> Self {
        tracing::debug!(interval_secs = interval.as_secs(), "Starting periodic refresh timer");
        Self {
            handle: tokio::spawn(run(coordinator, interval)),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(coordinator: RefreshCoordinator, interval: Duration) {
    let mut session = coordinator.session().subscribe();

    loop {
        if session.wait_for(|s| s.authenticated).await.is_err() {
            return;
        }
        tracing::debug!("Session authenticated, periodic refresh armed");

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => tick(&coordinator).await,
                changed = session.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if !session.borrow_and_update().authenticated {
                        tracing::debug!("Session ended, periodic refresh paused");
                        break;
                    }
                }
            }
        }
    }
}

async fn tick(coordinator: &RefreshCoordinator) {
    let status = coordinator.status();
    if !status.needs_refresh() {
        tracing::trace!("Periodic check: credential valid");
        return;
    }

    tracing::debug!(status = ?status, "Periodic check: refreshing");
    if let Err(e) = coordinator.refresh(RefreshTrigger::Periodic).await {
        tracing::warn!(error = %e, "Periodic refresh failed");
    }
}
