//! # Refresh Coordinator
//!
//! Serializes credential refresh so that a burst of 401 responses produces
//! exactly one refresh call.
//!
//! ## State machine
//!
//! ```text
//!            auth failure                      refresh settles
//!   Idle ─────────────────────> Refreshing ─────────────────────> Idle
//!             (spawn refresh)     │    ^        (drain queue)
//!                                 └────┘
//!                          auth failure: enqueue
//! ```
//!
//! - The first failing request flips the state to `Refreshing`, enqueues its
//!   own retry and spawns the refresh. Spawning means a caller that gives up
//!   waiting cannot strand the other waiters.
//! - Later failures only enqueue.
//! - On success the queue is replayed in FIFO order, one request at a time,
//!   each with the new credential. On failure the credential is cleared and
//!   every waiter receives [`RefreshOutcome::Expired`].
//!
//! The flag reset and the queue hand-off happen under one lock, so a record
//! is either drained by the current settlement or starts the next refresh,
//! never both and never neither.

use crate::dispatcher::ApiRequest;
use crate::error::{AuthError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

/// How a request suspended behind a refresh was completed.
#[derive(Debug)]
pub enum RefreshOutcome {
    /// The refresh succeeded and the request was sent once more.
    Retried(Result<Value>),
    /// The refresh failed; the request was not sent again.
    Expired,
}

/// The side effects the coordinator drives.
///
/// The request dispatcher is the production implementation.
#[async_trait]
pub trait RefreshHandler: Send + Sync + 'static {
    /// Issue the refresh call and store the new credential.
    ///
    /// Returns the new expiry, if the server sent one.
    async fn refresh_credential(&self) -> Result<Option<DateTime<Utc>>>;

    /// Send a suspended request again with the current credential.
    async fn replay(&self, request: ApiRequest) -> Result<Value>;

    /// Clear the credential and announce the expired session.
    async fn expire_session(&self, reason: &str);
}

struct PendingRequest {
    request: ApiRequest,
    completion: oneshot::Sender<RefreshOutcome>,
}

#[derive(Default)]
struct RefreshState {
    refreshing: bool,
    queue: VecDeque<PendingRequest>,
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    state: Arc<Mutex<RefreshState>>,
    event_bus: EventBus,
}

impl RefreshCoordinator {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            state: Arc::new(Mutex::new(RefreshState::default())),
            event_bus,
        }
    }

    /// Suspend `request` until a refresh settles, starting one if none is in
    /// flight.
    pub async fn submit(
        &self,
        request: ApiRequest,
        handler: Arc<dyn RefreshHandler>,
    ) -> RefreshOutcome {
        let (completion, outcome) = oneshot::channel();

        let start_refresh = {
            let mut state = self.state.lock().await;
            state.queue.push_back(PendingRequest {
                request,
                completion,
            });
            let start = !state.refreshing;
            state.refreshing = true;
            debug!(
                queued = state.queue.len(),
                leader = start,
                "Request suspended behind credential refresh"
            );
            start
        };

        if start_refresh {
            let coordinator = self.clone();
            let handler = handler.clone();
            tokio::spawn(async move { coordinator.settle(handler).await });
        }

        match outcome.await {
            Ok(outcome) => outcome,
            Err(_) => {
                // The settle task died before answering
                warn!("Credential refresh aborted");
                handler.expire_session("refresh_aborted").await;
                RefreshOutcome::Expired
            }
        }
    }

    /// True while a refresh call is in flight.
    pub async fn is_refreshing(&self) -> bool {
        self.state.lock().await.refreshing
    }

    /// Number of requests waiting for the current refresh.
    pub async fn queued(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    async fn settle(&self, handler: Arc<dyn RefreshHandler>) {
        let _ = self.event_bus.emit(CoreEvent::Auth(AuthEvent::TokenRefreshing));
        info!("Refreshing credential");

        // A panicking refresh counts as a failed one
        let refresh = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.refresh_credential().await })
        };
        let refreshed = refresh.await.unwrap_or_else(|e| {
            Err(AuthError::TransportError(format!("refresh task failed: {}", e)))
        });

        match &refreshed {
            Ok(expires_at) => {
                info!("Credential refreshed");
                let _ = self.event_bus.emit(CoreEvent::Auth(AuthEvent::TokenRefreshed {
                    expires_at: expires_at.map(|t| t.timestamp_millis()),
                }));
            }
            Err(e) => {
                warn!(error = %e, "Credential refresh failed");
                // Cleared before any waiter observes the failure
                handler.expire_session("refresh_failed").await;
            }
        }

        let pending = {
            let mut state = self.state.lock().await;
            state.refreshing = false;
            std::mem::take(&mut state.queue)
        };

        debug!(
            count = pending.len(),
            refreshed = refreshed.is_ok(),
            "Draining suspended requests"
        );

        match refreshed {
            Ok(_) => {
                for record in pending {
                    let result = handler.replay(record.request).await;
                    let _ = record.completion.send(RefreshOutcome::Retried(result));
                }
            }
            Err(_) => {
                for record in pending {
                    let _ = record.completion.send(RefreshOutcome::Expired);
                }
            }
        }
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    /// Handler whose refresh blocks until released, recording every call.
    struct ScriptedHandler {
        succeed: bool,
        panic_on_refresh: bool,
        panic_on_replay: bool,
        gate: Notify,
        refresh_calls: AtomicUsize,
        replayed: StdMutex<Vec<String>>,
        log: StdMutex<Vec<String>>,
    }

    impl ScriptedHandler {
        fn new(succeed: bool) -> Arc<Self> {
            Self::build(succeed, false, false)
        }

        fn build(succeed: bool, panic_on_refresh: bool, panic_on_replay: bool) -> Arc<Self> {
            Arc::new(Self {
                succeed,
                panic_on_refresh,
                panic_on_replay,
                gate: Notify::new(),
                refresh_calls: AtomicUsize::new(0),
                replayed: StdMutex::new(Vec::new()),
                log: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RefreshHandler for ScriptedHandler {
        async fn refresh_credential(&self) -> Result<Option<DateTime<Utc>>> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            if self.panic_on_refresh {
                panic!("refresh handler crashed");
            }
            if self.succeed {
                Ok(None)
            } else {
                Err(AuthError::AuthFailure)
            }
        }

        async fn replay(&self, request: ApiRequest) -> Result<Value> {
            if self.panic_on_replay {
                panic!("replay handler crashed");
            }
            self.replayed.lock().unwrap().push(request.path.clone());
            Ok(Value::String(request.path))
        }

        async fn expire_session(&self, reason: &str) {
            self.log.lock().unwrap().push(format!("expired:{}", reason));
        }
    }

    async fn wait_for_queue(coordinator: &RefreshCoordinator, len: usize) {
        for _ in 0..200 {
            if coordinator.queued().await == len {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("queue never reached {}", len);
    }

    #[tokio::test]
    async fn test_single_refresh_and_fifo_replay() {
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let coordinator = RefreshCoordinator::new(bus);
        let handler = ScriptedHandler::new(true);

        let mut waiters = Vec::new();
        for path in ["/a", "/b", "/c"] {
            let waiter = coordinator.clone();
            let handler: Arc<dyn RefreshHandler> = handler.clone();
            waiters.push(tokio::spawn(async move {
                waiter.submit(ApiRequest::get(path), handler).await
            }));
            // Fix the enqueue order
            wait_for_queue(&coordinator, waiters.len()).await;
        }

        assert!(coordinator.is_refreshing().await);
        handler.gate.notify_one();

        for (waiter, path) in waiters.into_iter().zip(["/a", "/b", "/c"]) {
            match waiter.await.unwrap() {
                RefreshOutcome::Retried(Ok(Value::String(p))) => assert_eq!(p, path),
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        assert_eq!(handler.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*handler.replayed.lock().unwrap(), vec!["/a", "/b", "/c"]);
        assert!(!coordinator.is_refreshing().await);
        assert_eq!(coordinator.queued().await, 0);

        assert_eq!(
            events.recv().await.unwrap(),
            CoreEvent::Auth(AuthEvent::TokenRefreshing)
        );
        assert_eq!(
            events.recv().await.unwrap(),
            CoreEvent::Auth(AuthEvent::TokenRefreshed { expires_at: None })
        );
    }

    #[tokio::test]
    async fn test_failed_refresh_expires_every_waiter() {
        let coordinator = RefreshCoordinator::new(EventBus::new(16));
        let handler = ScriptedHandler::new(false);

        let mut waiters = Vec::new();
        for path in ["/a", "/b"] {
            let waiter = coordinator.clone();
            let handler: Arc<dyn RefreshHandler> = handler.clone();
            waiters.push(tokio::spawn(async move {
                waiter.submit(ApiRequest::get(path), handler).await
            }));
            wait_for_queue(&coordinator, waiters.len()).await;
        }

        handler.gate.notify_one();

        for waiter in waiters {
            assert!(matches!(waiter.await.unwrap(), RefreshOutcome::Expired));
        }

        assert!(handler.replayed.lock().unwrap().is_empty());
        assert_eq!(
            *handler.log.lock().unwrap(),
            vec!["expired:refresh_failed".to_string()]
        );
        assert!(!coordinator.is_refreshing().await);
    }

    #[tokio::test]
    async fn test_next_failure_after_settlement_starts_new_refresh() {
        let coordinator = RefreshCoordinator::new(EventBus::new(16));
        let handler = ScriptedHandler::new(true);

        for _ in 0..2 {
            let task = {
                let coordinator = coordinator.clone();
                let handler: Arc<dyn RefreshHandler> = handler.clone();
                tokio::spawn(async move {
                    coordinator.submit(ApiRequest::get("/x"), handler).await
                })
            };
            wait_for_queue(&coordinator, 1).await;
            handler.gate.notify_one();
            assert!(matches!(
                task.await.unwrap(),
                RefreshOutcome::Retried(Ok(_))
            ));
        }

        assert_eq!(handler.refresh_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_refresh_expires_waiters_and_resets() {
        let coordinator = RefreshCoordinator::new(EventBus::new(16));
        let handler = ScriptedHandler::build(true, true, false);

        let task = {
            let waiter = coordinator.clone();
            let handler: Arc<dyn RefreshHandler> = handler.clone();
            tokio::spawn(async move { waiter.submit(ApiRequest::get("/a"), handler).await })
        };
        wait_for_queue(&coordinator, 1).await;
        handler.gate.notify_one();

        assert!(matches!(task.await.unwrap(), RefreshOutcome::Expired));
        assert_eq!(
            *handler.log.lock().unwrap(),
            vec!["expired:refresh_failed".to_string()]
        );
        assert!(!coordinator.is_refreshing().await);
    }

    #[tokio::test]
    async fn test_dead_settle_task_expires_the_session() {
        let coordinator = RefreshCoordinator::new(EventBus::new(16));
        let handler = ScriptedHandler::build(true, false, true);

        let task = {
            let waiter = coordinator.clone();
            let handler: Arc<dyn RefreshHandler> = handler.clone();
            tokio::spawn(async move { waiter.submit(ApiRequest::get("/a"), handler).await })
        };
        wait_for_queue(&coordinator, 1).await;
        handler.gate.notify_one();

        assert!(matches!(task.await.unwrap(), RefreshOutcome::Expired));
        assert_eq!(
            *handler.log.lock().unwrap(),
            vec!["expired:refresh_aborted".to_string()]
        );
    }
}
