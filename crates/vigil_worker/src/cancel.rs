use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use vigil_protocol::defaults::CANCELLED_BY_USER_MESSAGE;
use vigil_protocol::{FailureKind, RunId};

/// Why a run is being stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    User,
    Timeout,
    ScopeViolation(String),
    AuthorizationExpired,
}

impl CancelReason {
    /// Failure kind and message the attempt is nacked with.
    pub fn failure(&self) -> (FailureKind, String) {
        match self {
            CancelReason::User => (FailureKind::Cancelled, CANCELLED_BY_USER_MESSAGE.to_string()),
            CancelReason::Timeout => (
                FailureKind::Timeout,
                "run exceeded its wall-clock timeout".to_string(),
            ),
            CancelReason::ScopeViolation(detail) => (FailureKind::ScopeViolation, detail.clone()),
            CancelReason::AuthorizationExpired => (
                FailureKind::Authorization,
                "target authorization expired during the run".to_string(),
            ),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
}

/// Token for cooperative cancellation of a run attempt.
///
/// Uses an AtomicBool internally. Clone is cheap and shares state. The first
/// reason recorded wins.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Create a new cancellation token (not cancelled).
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Request cancellation. Returns false if the token was already cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        {
            let mut slot = self.inner.reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        true
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Tokens for runs executing in this process, keyed by run.
///
/// The orchestrator signals through here for immediate effect; executors also
/// poll the run row so cancellation works across processes.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<Mutex<HashMap<RunId, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, run_id: &RunId) -> CancellationToken {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.entry(run_id.clone()).or_default().clone()
    }

    pub fn unregister(&self, run_id: &RunId) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.remove(run_id);
    }

    /// Cancel a locally executing run. Returns false when the run is not
    /// executing here.
    pub fn cancel(&self, run_id: &RunId, reason: CancelReason) -> bool {
        let token = {
            let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
            tokens.get(run_id).cloned()
        };
        match token {
            Some(token) => {
                token.cancel(reason);
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> usize {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_reason_wins() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel(CancelReason::Timeout));
        assert!(!token.cancel(CancelReason::User));
        assert_eq!(token.reason(), Some(CancelReason::Timeout));
    }

    #[test]
    fn clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel(CancelReason::User);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn waiters_wake_on_cancel() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel(CancelReason::User);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn registry_reaches_registered_runs_only() {
        let registry = CancellationRegistry::new();
        let run = RunId::new();
        let token = registry.register(&run);
        assert!(!registry.cancel(&RunId::new(), CancelReason::User));
        assert!(registry.cancel(&run, CancelReason::User));
        assert!(token.is_cancelled());
        registry.unregister(&run);
        assert_eq!(registry.active(), 0);
    }

    #[test]
    fn reasons_map_to_failure_kinds() {
        assert_eq!(CancelReason::User.failure().0, FailureKind::Cancelled);
        assert_eq!(CancelReason::Timeout.failure().0, FailureKind::Timeout);
        assert_eq!(
            CancelReason::AuthorizationExpired.failure().0,
            FailureKind::Authorization
        );
    }
}
