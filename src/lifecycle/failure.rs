use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::types::IsolateId;

/// What a restart attempt ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    Running,
    Failed,
    /// The id is not managed here; its streak is dropped.
    Unmanaged,
}

/// Restarts an isolate on behalf of the failure handler.
#[async_trait]
pub trait Restarter: Send + Sync {
    async fn restart(&self, isolate_id: &str) -> RestartOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePolicy {
    pub max_tries_per_streak: u32,
    pub wait_in_streak: Duration,
    pub wait_between_streaks: Duration,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            max_tries_per_streak: 3,
            wait_in_streak: Duration::from_secs(1),
            wait_between_streaks: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
struct Streak {
    tries: u32,
    pending: bool,
}

/// Schedules restarts of failed isolates in streaks of quick retries
/// separated by longer pauses.
pub struct FailureHandler {
    policy: FailurePolicy,
    restarter: Weak<dyn Restarter>,
    streaks: Mutex<HashMap<IsolateId, Streak>>,
    cancel: CancellationToken,
}

impl FailureHandler {
    pub fn new(policy: FailurePolicy, restarter: Weak<dyn Restarter>) -> Self {
        Self {
            policy,
            restarter,
            streaks: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IsolateId, Streak>> {
        self.streaks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedules a restart of `isolate_id`. Returns `false` when nothing was
    /// scheduled: handler stopped, or a restart already pending.
    pub fn isolate_failed(self: &Arc<Self>, isolate_id: &str) -> bool {
        if self.cancel.is_cancelled() {
            debug!("Failure of {} ignored: handler stopped", isolate_id);
            return false;
        }

        let delay = {
            let mut streaks = self.lock();
            let streak = streaks.entry(isolate_id.to_string()).or_default();
            if streak.pending {
                debug!("Restart of {} already pending", isolate_id);
                return false;
            }

            let delay = if streak.tries >= self.policy.max_tries_per_streak {
                info!("Isolate {} keeps failing, pausing its restarts", isolate_id);
                streak.tries = 0;
                self.policy.wait_between_streaks
            } else {
                self.policy.wait_in_streak
            };
            streak.tries += 1;
            streak.pending = true;
            delay
        };

        let handler = self.clone();
        let isolate_id = isolate_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = handler.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            handler.retry(&isolate_id).await;
        });
        true
    }

    async fn retry(self: &Arc<Self>, isolate_id: &str) {
        if let Some(streak) = self.lock().get_mut(isolate_id) {
            streak.pending = false;
        }

        let Some(restarter) = self.restarter.upgrade() else {
            return;
        };

        info!("Restarting isolate {}", isolate_id);
        match restarter.restart(isolate_id).await {
            RestartOutcome::Running => {
                self.lock().remove(isolate_id);
            }
            RestartOutcome::Unmanaged => {
                warn!("Isolate {} is not managed, giving up its restarts", isolate_id);
                self.lock().remove(isolate_id);
            }
            RestartOutcome::Failed if !self.cancel.is_cancelled() => {
                warn!("Restart of isolate {} failed", isolate_id);
                self.isolate_failed(isolate_id);
            }
            RestartOutcome::Failed => {}
        }
    }

    /// Retries scheduled in the current streak of an isolate.
    pub fn tries(&self, isolate_id: &str) -> u32 {
        self.lock()
            .get(isolate_id)
            .map(|streak| streak.tries)
            .unwrap_or(0)
    }

    pub fn is_pending(&self, isolate_id: &str) -> bool {
        self.lock()
            .get(isolate_id)
            .map(|streak| streak.pending)
            .unwrap_or(false)
    }

    /// Cancels pending restarts; later failures are ignored.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    struct MockRestarter {
        started: Instant,
        calls: Mutex<Vec<u128>>,
        outcome: RestartOutcome,
    }

    impl MockRestarter {
        fn new(succeeds: bool) -> Arc<Self> {
            Self::with_outcome(if succeeds {
                RestartOutcome::Running
            } else {
                RestartOutcome::Failed
            })
        }

        fn with_outcome(outcome: RestartOutcome) -> Arc<Self> {
            Arc::new(Self {
                started: Instant::now(),
                calls: Mutex::new(Vec::new()),
                outcome,
            })
        }

        fn calls(&self) -> Vec<u128> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Restarter for MockRestarter {
        async fn restart(&self, _isolate_id: &str) -> RestartOutcome {
            let elapsed = self.started.elapsed().as_millis();
            self.calls.lock().unwrap().push(elapsed);
            self.outcome
        }
    }

    fn create_handler(restarter: &Arc<MockRestarter>) -> Arc<FailureHandler> {
        let restarter: Arc<dyn Restarter> = restarter.clone();
        Arc::new(FailureHandler::new(
            FailurePolicy::default(),
            Arc::downgrade(&restarter),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_wait_in_streak() {
        let restarter = MockRestarter::new(true);
        let handler = create_handler(&restarter);

        assert!(handler.isolate_failed("iso-a"));
        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(restarter.calls().is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(restarter.calls(), vec![1000]);
        // Success resets the streak
        assert_eq!(handler.tries("iso-a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaks_are_spaced() {
        let restarter = MockRestarter::new(false);
        let handler = create_handler(&restarter);

        handler.isolate_failed("iso-a");
        tokio::time::sleep(Duration::from_millis(9500)).await;

        assert_eq!(restarter.calls(), vec![1000, 2000, 3000, 8000, 9000]);
        handler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmanaged_isolate_is_not_retried() {
        let restarter = MockRestarter::with_outcome(RestartOutcome::Unmanaged);
        let handler = create_handler(&restarter);

        assert!(handler.isolate_failed("iso-ghost"));
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(restarter.calls(), vec![1000]);
        assert!(!handler.is_pending("iso-ghost"));
        assert_eq!(handler.tries("iso-ghost"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_failures_are_coalesced() {
        let restarter = MockRestarter::new(true);
        let handler = create_handler(&restarter);

        assert!(handler.isolate_failed("iso-a"));
        assert!(!handler.isolate_failed("iso-a"));
        assert!(handler.is_pending("iso-a"));
        assert!(handler.isolate_failed("iso-b"));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(restarter.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_restarts() {
        let restarter = MockRestarter::new(true);
        let handler = create_handler(&restarter);

        handler.isolate_failed("iso-a");
        handler.stop();
        assert!(!handler.isolate_failed("iso-b"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(restarter.calls().is_empty());
    }
}
