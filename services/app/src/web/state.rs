//! services/app/src/web/state.rs
//!
//! Defines the station's shared state and the registry of open result views.

use crate::config::Config;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::info;
use triage_core::ports::{AssessmentStore, InferenceService};
use triage_core::{AuthSession, IntakeMachine, NavigationState, ResultView};
use uuid::Uuid;

//=========================================================================================
// AppState (Shared Across All Requests)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub session: Arc<AuthSession>,
    pub store: Arc<dyn AssessmentStore>,
    pub backend: Arc<dyn InferenceService>,
    /// The station's one intake form. Held across a submission.
    pub intake: tokio::sync::Mutex<IntakeMachine>,
    pub results: ResultRegistry,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        session: Arc<AuthSession>,
        store: Arc<dyn AssessmentStore>,
        backend: Arc<dyn InferenceService>,
    ) -> Self {
        let results = ResultRegistry::new(config.result_view_idle, config.max_result_views);
        Self {
            config,
            session,
            store,
            backend,
            intake: tokio::sync::Mutex::new(IntakeMachine::new()),
            results,
        }
    }

    /// Opens a result view and starts loading it in the background.
    pub fn open_result(&self, navigation: NavigationState) -> (Uuid, Arc<ResultView>) {
        let view = Arc::new(ResultView::open(
            navigation,
            self.backend.clone(),
            self.store.clone(),
            self.config.report_retry,
        ));
        let loader = {
            let view = view.clone();
            tokio::spawn(async move { view.load().await })
        };
        let view_id = Uuid::new_v4();
        self.results.insert(
            view_id,
            OpenView {
                view: view.clone(),
                loader,
                last_seen: Instant::now(),
            },
        );
        info!("Opened result view {}", view_id);
        (view_id, view)
    }
}

//=========================================================================================
// Result Views
//=========================================================================================

struct OpenView {
    view: Arc<ResultView>,
    loader: JoinHandle<()>,
    last_seen: Instant,
}

/// Result views currently open on the station, keyed by view id.
///
/// Views idle for longer than `idle` are closed on the next access, and
/// opening a view past `max_views` closes the least recently used one.
pub struct ResultRegistry {
    views: Mutex<HashMap<Uuid, OpenView>>,
    idle: Duration,
    max_views: usize,
}

impl ResultRegistry {
    pub fn new(idle: Duration, max_views: usize) -> Self {
        Self {
            views: Mutex::new(HashMap::new()),
            idle,
            max_views: max_views.max(1),
        }
    }

    fn insert(&self, view_id: Uuid, view: OpenView) {
        let evicted = match self.views.lock() {
            Ok(mut views) => {
                let mut evicted = take_idle(&mut views, self.idle, view.last_seen);
                while views.len() >= self.max_views {
                    let oldest = views
                        .iter()
                        .min_by_key(|(_, v)| v.last_seen)
                        .map(|(id, _)| *id);
                    match oldest.and_then(|id| views.remove(&id).map(|v| (id, v))) {
                        Some(entry) => evicted.push(entry),
                        None => break,
                    }
                }
                views.insert(view_id, view);
                evicted
            }
            Err(_) => Vec::new(),
        };
        abort_all(evicted);
    }

    pub fn get(&self, view_id: &Uuid) -> Option<Arc<ResultView>> {
        self.get_at(view_id, Instant::now())
    }

    fn get_at(&self, view_id: &Uuid, now: Instant) -> Option<Arc<ResultView>> {
        let (found, evicted) = match self.views.lock() {
            Ok(mut views) => {
                let evicted = take_idle(&mut views, self.idle, now);
                let found = views.get_mut(view_id).map(|open| {
                    open.last_seen = now;
                    open.view.clone()
                });
                (found, evicted)
            }
            Err(_) => (None, Vec::new()),
        };
        abort_all(evicted);
        found
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.views.lock().map(|views| views.len()).unwrap_or(0)
    }

    /// Discards a view, aborting any loading still in flight.
    pub fn close(&self, view_id: &Uuid) -> bool {
        let removed = self.views.lock().ok().and_then(|mut views| views.remove(view_id));
        match removed {
            Some(open) => {
                open.loader.abort();
                info!("Closed result view {}", view_id);
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let drained: Vec<OpenView> = match self.views.lock() {
            Ok(mut views) => views.drain().map(|(_, v)| v).collect(),
            Err(_) => Vec::new(),
        };
        for open in drained {
            open.loader.abort();
        }
    }
}

fn take_idle(
    views: &mut HashMap<Uuid, OpenView>,
    idle: Duration,
    now: Instant,
) -> Vec<(Uuid, OpenView)> {
    let expired: Vec<Uuid> = views
        .iter()
        .filter(|(_, v)| now.saturating_duration_since(v.last_seen) > idle)
        .map(|(id, _)| *id)
        .collect();
    expired
        .into_iter()
        .filter_map(|id| views.remove(&id).map(|v| (id, v)))
        .collect()
}

fn abort_all(evicted: Vec<(Uuid, OpenView)>) {
    for (view_id, open) in evicted {
        open.loader.abort();
        info!("Evicted result view {}", view_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::AbortHandle;
    use triage_core::testing::{FakeBackend, FakeStore};
    use triage_core::RetryPolicy;

    async fn settle(handle: &AbortHandle) {
        for _ in 0..16 {
            if handle.is_finished() {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    fn parked_view(at: Instant) -> (OpenView, AbortHandle) {
        let view = Arc::new(ResultView::open(
            NavigationState::default(),
            Arc::new(FakeBackend::default()),
            Arc::new(FakeStore::default()),
            RetryPolicy::default(),
        ));
        let loader = tokio::spawn(std::future::pending::<()>());
        let handle = loader.abort_handle();
        (
            OpenView {
                view,
                loader,
                last_seen: at,
            },
            handle,
        )
    }

    #[tokio::test]
    async fn idle_views_are_closed_on_next_access() {
        let registry = ResultRegistry::new(Duration::from_secs(60), 8);
        let opened = Instant::now();
        let (stale, stale_loader) = parked_view(opened);
        let (fresh, _) = parked_view(opened + Duration::from_secs(50));
        let (stale_id, fresh_id) = (Uuid::new_v4(), Uuid::new_v4());
        registry.insert(stale_id, stale);
        registry.insert(fresh_id, fresh);

        let later = opened + Duration::from_secs(90);
        assert!(registry.get_at(&fresh_id, later).is_some());
        assert!(registry.get_at(&stale_id, later).is_none());
        assert_eq!(registry.len(), 1);

        settle(&stale_loader).await;
        assert!(stale_loader.is_finished());
    }

    #[tokio::test]
    async fn opening_past_the_cap_evicts_the_least_recently_used() {
        let registry = ResultRegistry::new(Duration::from_secs(3600), 2);
        let start = Instant::now();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

        let (first, first_loader) = parked_view(start);
        let (second, second_loader) = parked_view(start + Duration::from_secs(1));
        registry.insert(ids[0], first);
        registry.insert(ids[1], second);
        // Touching the first view makes the second the oldest.
        assert!(registry.get_at(&ids[0], start + Duration::from_secs(2)).is_some());

        let (third, _) = parked_view(start + Duration::from_secs(3));
        registry.insert(ids[2], third);

        assert_eq!(registry.len(), 2);
        assert!(registry.get_at(&ids[1], start + Duration::from_secs(4)).is_none());
        assert!(registry.get_at(&ids[0], start + Duration::from_secs(4)).is_some());
        settle(&second_loader).await;
        assert!(second_loader.is_finished());
        assert!(!first_loader.is_finished());
    }
}
