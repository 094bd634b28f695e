//! Nested abort scopes with a recorded cause
//!
//! A scope wraps a [`CancellationToken`]. Child scopes are cancelled with
//! their parent, but each scope remembers why it was aborted so callers can
//! tell a user interrupt from a timeout or a blown budget.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::BudgetExceeded;

/// Which deadline fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutScope {
    /// A single retry attempt
    Attempt,
    /// The whole turn / stage call
    Turn,
}

impl fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutScope::Attempt => write!(f, "attempt"),
            TimeoutScope::Turn => write!(f, "turn"),
        }
    }
}

/// Why a scope was aborted
#[derive(Debug, Clone, PartialEq)]
pub enum AbortCause {
    /// The user cancelled the turn
    UserInterrupt,
    /// A deadline elapsed
    Timeout(TimeoutScope),
    /// An execution budget ceiling was crossed
    Budget(BudgetExceeded),
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortCause::UserInterrupt => write!(f, "interrupted by user"),
            AbortCause::Timeout(scope) => write!(f, "{} timed out", scope),
            AbortCause::Budget(exceeded) => write!(f, "budget exceeded: {}", exceeded),
        }
    }
}

#[derive(Debug)]
struct ScopeInner {
    token: CancellationToken,
    cause: Mutex<Option<AbortCause>>,
    parent: Option<AbortScope>,
}

/// Cancellation scope shared by everything working on one turn or attempt
#[derive(Debug, Clone)]
pub struct AbortScope {
    inner: Arc<ScopeInner>,
}

impl Default for AbortScope {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortScope {
    /// Create a root scope
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                token: CancellationToken::new(),
                cause: Mutex::new(None),
                parent: None,
            }),
        }
    }

    /// Create a child scope, aborted whenever this one is
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                token: self.inner.token.child_token(),
                cause: Mutex::new(None),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Abort this scope (and its children). The first cause wins.
    pub fn abort(&self, cause: AbortCause) {
        if self.inner.token.is_cancelled() {
            return;
        }
        if let Ok(mut slot) = self.inner.cause.lock() {
            if slot.is_none() {
                debug!("Aborting scope: {}", cause);
                *slot = Some(cause);
            }
        }
        self.inner.token.cancel();
    }

    /// Whether this scope has been aborted, directly or through a parent
    pub fn is_aborted(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The cause of the abort, looking through parents when this scope was
    /// cancelled from above
    pub fn cause(&self) -> Option<AbortCause> {
        if !self.is_aborted() {
            return None;
        }
        let own = self.inner.cause.lock().ok().and_then(|c| c.clone());
        own.or_else(|| self.inner.parent.as_ref().and_then(|p| p.cause()))
    }

    /// Whether this scope's own deadline (not a parent's) fired
    pub fn timed_out_here(&self) -> Option<TimeoutScope> {
        match self.inner.cause.lock().ok().and_then(|c| c.clone()) {
            Some(AbortCause::Timeout(scope)) => Some(scope),
            _ => None,
        }
    }

    /// Resolve once the scope is aborted
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// Underlying token, for APIs that take one directly
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Arm a timer that aborts this scope with a timeout cause.
    ///
    /// The timer is disarmed when the returned guard is dropped.
    pub fn arm_deadline(&self, after: Duration, scope: TimeoutScope) -> DeadlineGuard {
        self.arm_abort(after, AbortCause::Timeout(scope))
    }

    /// Arm a timer that aborts this scope with `cause` once `after` elapses
    pub fn arm_abort(&self, after: Duration, cause: AbortCause) -> DeadlineGuard {
        let target = self.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {
                    target.abort(cause);
                }
                _ = target.cancelled() => {}
            }
        });
        DeadlineGuard { handle }
    }
}

/// Disarms a deadline timer on drop
#[derive(Debug)]
pub struct DeadlineGuard {
    handle: JoinHandle<()>,
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Sleep for `duration` unless the scope is aborted first
pub async fn sleep_or_abort(
    duration: Duration,
    scope: &AbortScope,
) -> std::result::Result<(), AbortCause> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = scope.cancelled() => Err(scope.cause().unwrap_or(AbortCause::UserInterrupt)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_inherits_parent_cause() {
        let parent = AbortScope::new();
        let child = parent.child();
        parent.abort(AbortCause::UserInterrupt);

        assert!(child.is_aborted());
        assert_eq!(child.cause(), Some(AbortCause::UserInterrupt));
        assert_eq!(child.timed_out_here(), None);
    }

    #[test]
    fn test_child_abort_does_not_reach_parent() {
        let parent = AbortScope::new();
        let child = parent.child();
        child.abort(AbortCause::Timeout(TimeoutScope::Attempt));

        assert!(child.is_aborted());
        assert!(!parent.is_aborted());
        assert_eq!(child.timed_out_here(), Some(TimeoutScope::Attempt));
    }

    #[test]
    fn test_first_cause_wins() {
        let scope = AbortScope::new();
        scope.abort(AbortCause::Timeout(TimeoutScope::Turn));
        scope.abort(AbortCause::UserInterrupt);
        assert_eq!(scope.cause(), Some(AbortCause::Timeout(TimeoutScope::Turn)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires() {
        let scope = AbortScope::new();
        let _guard = scope.arm_deadline(Duration::from_millis(50), TimeoutScope::Attempt);
        scope.cancelled().await;
        assert_eq!(scope.cause(), Some(AbortCause::Timeout(TimeoutScope::Attempt)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_guard_disarms_deadline() {
        let scope = AbortScope::new();
        let guard = scope.arm_deadline(Duration::from_millis(50), TimeoutScope::Attempt);
        drop(guard);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!scope.is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_or_abort_reports_cause() {
        let scope = AbortScope::new();
        let sleeper = scope.clone();
        let task = tokio::spawn(async move {
            sleep_or_abort(Duration::from_secs(60), &sleeper).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        scope.abort(AbortCause::UserInterrupt);
        let result = task.await.unwrap();
        assert_eq!(result, Err(AbortCause::UserInterrupt));
    }
}
