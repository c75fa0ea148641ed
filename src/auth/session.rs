// Session state
// Process-wide "authenticated / as whom / loading" with change notification

use tokio::sync::watch;

use super::types::{Session, User};

/// Single source of truth for the current session
///
/// Readers take snapshots or subscribe for changes. Mutators are crate-private:
/// only the refresh coordinator and explicit login/logout write here.
pub struct SessionState {
    tx: watch::Sender<Session>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Session::default());
        Self { tx }
    }

    /// Current snapshot
    pub fn current(&self) -> Session {
        self.tx.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.tx.borrow().authenticated
    }

    pub fn user(&self) -> Option<User> {
        self.tx.borrow().user.clone()
    }

    /// Receive every subsequent change
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.tx.subscribe()
    }

    pub(crate) fn set_authenticated(&self, user: Option<User>) {
        self.tx.send_replace(Session {
            authenticated: true,
            user,
            loading: false,
        });
    }

    pub(crate) fn set_unauthenticated(&self) {
        self.tx.send_replace(Session::default());
    }

    pub(crate) fn set_loading(&self, loading: bool) {
        self.tx.send_if_modified(|session| {
            if session.loading == loading {
                return false;
            }
            session.loading = loading;
            true
        });
    }
}
