//! crates/triage_core/src/session.rs
//!
//! The station's authentication session: a single observable value fed by
//! the identity provider's auth-state notifications.
//!
//! The value starts in the `loading` phase and settles on the first
//! notification. Every consumer (route guards, views) reads the same cell
//! through a `watch` channel and can await changes.

use crate::domain::User;
use crate::ports::{IdentityProvider, PortResult};
use futures::StreamExt;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Snapshot of the session value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub user: Option<User>,
    pub loading: bool,
}

impl SessionState {
    fn initial() -> Self {
        Self {
            user: None,
            loading: true,
        }
    }
}

/// What a protected view should do for a given session value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// The provider has not reported yet: render a neutral waiting state and
    /// make no navigation decision.
    Wait,
    RedirectToLogin,
    Allow(User),
}

pub fn guard(state: &SessionState) -> Guard {
    match (&state.user, state.loading) {
        (_, true) => Guard::Wait,
        (None, false) => Guard::RedirectToLogin,
        (Some(user), false) => Guard::Allow(user.clone()),
    }
}

pub struct AuthSession {
    provider: Arc<dyn IdentityProvider>,
    state: Arc<watch::Sender<SessionState>>,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl AuthSession {
    /// Subscribes to the provider and starts tracking its notifications.
    /// Must be called from within a tokio runtime.
    pub fn mount(provider: Arc<dyn IdentityProvider>) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::initial());
        let session = Arc::new(Self {
            provider,
            state: Arc::new(state),
            cancel: CancellationToken::new(),
            listener: Mutex::new(None),
        });

        let mut changes = session.provider.auth_state_changes();
        let cancel = session.cancel.clone();
        let tx = session.state.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = changes.next() => match next {
                        Some(user) => {
                            info!(
                                "Auth state changed: {}",
                                user.as_ref()
                                    .and_then(|u| u.email.as_deref())
                                    .unwrap_or("signed out")
                            );
                            tx.send_replace(SessionState { user, loading: false });
                        }
                        None => break,
                    },
                }
            }
        });
        if let Ok(mut listener) = session.listener.lock() {
            *listener = Some(handle);
        }
        session
    }

    /// Stops listening to the provider. The last value stays readable.
    pub fn unmount(&self) {
        self.cancel.cancel();
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(handle) = listener.take() {
                handle.abort();
            }
        }
    }

    pub fn current(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn guard(&self) -> Guard {
        guard(&self.state.borrow())
    }

    /// Waits until the session has left the `loading` phase.
    pub async fn settled(&self) -> SessionState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|s| !s.loading).await {
            Ok(state) => state.clone(),
            // The sender lives as long as `self`, so this only happens
            // during teardown.
            Err(_) => self.current(),
        };
        state
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> PortResult<User> {
        let user = self.provider.sign_in(email.trim(), password).await?;
        info!("Signed in as {}", user.email.as_deref().unwrap_or("unknown"));
        Ok(user)
    }

    /// Signs out on a best-effort basis: the session always ends up signed
    /// out and settled, even if the provider call fails.
    pub async fn sign_out(&self) {
        self.state.send_modify(|s| s.loading = true);
        if let Err(e) = self.provider.sign_out().await {
            warn!("Identity provider sign-out failed: {}", e);
        }
        self.state.send_replace(SessionState {
            user: None,
            loading: false,
        });
    }
}

impl Drop for AuthSession {
    fn drop(&mut self) {
        self.unmount();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{operator, FakeIdentity};

    #[test]
    fn guard_waits_while_loading() {
        let loading = SessionState { user: Some(operator()), loading: true };
        assert_eq!(guard(&loading), Guard::Wait);
        assert_eq!(guard(&SessionState::initial()), Guard::Wait);

        let signed_out = SessionState { user: None, loading: false };
        assert_eq!(guard(&signed_out), Guard::RedirectToLogin);

        let signed_in = SessionState { user: Some(operator()), loading: false };
        assert_eq!(guard(&signed_in), Guard::Allow(operator()));
    }

    #[tokio::test]
    async fn settled_returns_at_once_for_a_settled_session() {
        let provider = Arc::new(FakeIdentity::default());
        let session = AuthSession::mount(provider.clone());
        provider.emit(None);
        session.settled().await;

        let again = tokio::time::timeout(std::time::Duration::from_millis(50), session.settled())
            .await
            .unwrap();
        assert_eq!(again.user, None);
        assert!(!again.loading);
    }

    #[tokio::test]
    async fn provider_notifications_settle_the_session() {
        let provider = Arc::new(FakeIdentity::default());
        let session = AuthSession::mount(provider.clone());
        assert!(session.current().loading);

        provider.emit(Some(operator()));
        let state = session.settled().await;
        assert_eq!(state.user, Some(operator()));
        assert_eq!(session.guard(), Guard::Allow(operator()));

        let mut rx = session.subscribe();
        provider.emit(None);
        rx.wait_for(|s| s.user.is_none()).await.unwrap();
        assert_eq!(session.guard(), Guard::RedirectToLogin);
    }

    #[tokio::test]
    async fn sign_in_is_reported_through_the_provider() {
        let provider = Arc::new(FakeIdentity::default());
        let session = AuthSession::mount(provider.clone());
        provider.emit(None);
        session.settled().await;

        assert!(session.sign_in("  nurse@clinic.test ", "wrong").await.is_err());

        let user = session.sign_in("  nurse@clinic.test ", "correct horse").await.unwrap();
        assert_eq!(user.email.as_deref(), Some("nurse@clinic.test"));

        let mut rx = session.subscribe();
        rx.wait_for(|s| s.user.is_some()).await.unwrap();
    }

    #[tokio::test]
    async fn sign_out_clears_user_even_when_provider_fails() {
        let provider = Arc::new(FakeIdentity::default());
        let session = AuthSession::mount(provider.clone());
        provider.emit(Some(operator()));
        session.settled().await;

        provider.fail_sign_out();
        session.sign_out().await;

        assert_eq!(session.current(), SessionState { user: None, loading: false });
    }

    #[tokio::test]
    async fn unmount_stops_tracking_changes() {
        let provider = Arc::new(FakeIdentity::default());
        let session = AuthSession::mount(provider.clone());
        provider.emit(Some(operator()));
        session.settled().await;

        session.unmount();
        provider.emit(None);
        tokio::task::yield_now().await;

        assert_eq!(session.current().user, Some(operator()));
    }
}
