//! Staged retry harness
//!
//! Runs one model-backed stage under nested abort scopes:
//!
//! ```text
//! outer (turn cancel)
//!   └─ stage scope (turn_timeout)
//!        └─ attempt scope (attempt_timeout + execution budget)
//! ```
//!
//! Attempts are strictly sequential. Retry happens while attempts remain,
//! the outer scope is live and the caller classifies the error as worth
//! another try. A persistent error may swap in the fallback backend once.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{BackendErrorKind, FailoverSlot, ModelBackend};
use crate::budget::{
    compute_retry_delay, compute_retry_delay_with, sleep_or_abort, AbortCause, AbortScope,
    BudgetExceeded, BudgetHandle, BudgetLimits, TimeoutScope,
};
use crate::config::RetryConfig;
use crate::{Error, Result};

/// How the caller wants a failure handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Try again after backoff
    Retryable,
    /// Try again on the fallback backend, if one is left
    Persistent,
    /// Give up now
    Fatal,
}

/// Default classification for backend-driven stages
pub fn classify_backend_error(err: &Error) -> RetryClass {
    match err {
        Error::Cancelled => RetryClass::Fatal,
        Error::Backend {
            kind: BackendErrorKind::Quota,
            ..
        } => RetryClass::Persistent,
        e if e.is_transient() => RetryClass::Retryable,
        _ => RetryClass::Fatal,
    }
}

/// Limits for one harness call
#[derive(Debug, Clone)]
pub struct StagePolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
    pub attempt_timeout: Duration,
    pub turn_timeout: Duration,
    /// No jitter, for reproducible runs
    pub deterministic: bool,
    /// Consecutive retryable failures before failing over (0 = never)
    pub failover_after: u32,
    pub budget: BudgetLimits,
}

impl StagePolicy {
    pub fn from_config(retry: &RetryConfig, budget: &BudgetLimits) -> Self {
        Self {
            max_retries: retry.max_retries,
            base_delay: retry.base_delay,
            max_delay: retry.max_delay,
            jitter: retry.jitter,
            attempt_timeout: retry.attempt_timeout,
            turn_timeout: retry.turn_timeout,
            deterministic: retry.deterministic,
            failover_after: retry.failover_after,
            budget: *budget,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.deterministic {
            compute_retry_delay_with(attempt, self.base_delay, self.max_delay, 0.0, 0.5)
        } else {
            compute_retry_delay(attempt, self.base_delay, self.max_delay, self.jitter)
        }
    }
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default(), &BudgetLimits::default())
    }
}

/// Everything one attempt gets to work with
pub struct StageAttempt {
    /// Zero-based attempt number
    pub attempt: u32,
    /// Aborted on attempt timeout, budget overrun, or any outer abort
    pub scope: AbortScope,
    pub budget: BudgetHandle,
    pub backend: Arc<dyn ModelBackend>,
}

/// Successful harness result
#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    /// Retries used before the successful attempt
    pub retries: u32,
    pub failed_over: bool,
}

/// Run `stage` under the policy's timeouts, budget and retry rules
pub async fn run_staged<T, F, Fut, C>(
    name: &str,
    policy: &StagePolicy,
    slot: &FailoverSlot,
    outer: &AbortScope,
    classify: C,
    mut stage: F,
) -> Result<StageOutcome<T>>
where
    F: FnMut(StageAttempt) -> Fut,
    Fut: Future<Output = Result<T>>,
    C: Fn(&Error) -> RetryClass,
{
    let stage_scope = outer.child();
    let _stage_deadline = stage_scope.arm_deadline(policy.turn_timeout, TimeoutScope::Turn);

    let mut attempt = 0u32;
    let mut consecutive = 0u32;

    loop {
        if stage_scope.is_aborted() {
            return Err(abort_error(&stage_scope));
        }

        let scope = stage_scope.child();
        let _deadline = scope.arm_deadline(policy.attempt_timeout, TimeoutScope::Attempt);
        let _budget_deadline = scope.arm_abort(
            policy.budget.deadline,
            AbortCause::Budget(BudgetExceeded::deadline(&policy.budget)),
        );
        let budget = BudgetHandle::new(policy.budget, scope.clone());
        let backend = slot.current();
        debug!(
            "{}: attempt {} on {} ({})",
            name,
            attempt + 1,
            backend.name(),
            backend.model()
        );

        let result = tokio::select! {
            biased;
            result = stage(StageAttempt {
                attempt,
                scope: scope.clone(),
                budget,
                backend,
            }) => result,
            _ = scope.cancelled() => Err(abort_error(&scope)),
        };

        let err = match result {
            Ok(value) => {
                if attempt > 0 {
                    info!("{}: succeeded after {} retries", name, attempt);
                }
                return Ok(StageOutcome {
                    value,
                    retries: attempt,
                    failed_over: slot.has_failed_over(),
                });
            }
            // An aborted scope's cause replaces whatever the stage reported
            Err(e) => match scope.cause() {
                Some(cause) => Error::from_abort(&cause),
                None => e,
            },
        };

        if outer.is_aborted() || err.is_cancelled() {
            info!("{}: cancelled", name);
            return Err(abort_error(outer));
        }
        if stage_scope.timed_out_here().is_some() {
            warn!("{}: stage deadline reached after {} attempts", name, attempt + 1);
            return Err(Error::Timeout(TimeoutScope::Turn));
        }

        match classify(&err) {
            RetryClass::Fatal => {
                warn!("{}: giving up on non-retryable error: {}", name, err);
                return Err(err);
            }
            RetryClass::Persistent => {
                if !slot.failover() {
                    warn!("{}: persistent error and no fallback left: {}", name, err);
                    return Err(err);
                }
                consecutive = 0;
            }
            RetryClass::Retryable => {
                consecutive += 1;
                if policy.failover_after > 0
                    && consecutive >= policy.failover_after
                    && slot.failover()
                {
                    consecutive = 0;
                }
            }
        }

        if attempt >= policy.max_retries {
            warn!("{}: retries exhausted after {} attempts: {}", name, attempt + 1, err);
            return Err(err);
        }

        let delay = policy.delay_for(attempt);
        warn!(
            "{}: attempt {} failed ({}), retrying in {}",
            name,
            attempt + 1,
            err,
            humantime::format_duration(delay)
        );
        if let Err(cause) = sleep_or_abort(delay, &stage_scope).await {
            return Err(match cause {
                AbortCause::Timeout(_) => Error::Timeout(TimeoutScope::Turn),
                other => Error::from_abort(&other),
            });
        }
        attempt += 1;
    }
}

fn abort_error(scope: &AbortScope) -> Error {
    scope
        .cause()
        .map(|cause| Error::from_abort(&cause))
        .unwrap_or(Error::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ModelRequest, ScriptStep, ScriptedBackend};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> StagePolicy {
        StagePolicy {
            max_retries,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: 0.25,
            attempt_timeout: Duration::from_secs(5),
            turn_timeout: Duration::from_secs(60),
            deterministic: true,
            failover_after: 0,
            budget: BudgetLimits {
                max_events: 3,
                max_tool_calls: 1,
                deadline: Duration::from_secs(60),
            },
        }
    }

    fn slot() -> FailoverSlot {
        FailoverSlot::new(Arc::new(ScriptedBackend::named("primary", vec![])))
    }

    fn overloaded() -> Error {
        Error::backend(BackendErrorKind::Overloaded, "busy")
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let outcome = run_staged(
            "test",
            &policy(3),
            &slot(),
            &AbortScope::new(),
            classify_backend_error,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt.attempt < 2 {
                        Err(overloaded())
                    } else {
                        Ok("done")
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.value, "done");
        assert_eq!(outcome.retries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Deterministic backoff: 1s then 2s
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = run_staged(
            "test",
            &policy(3),
            &slot(),
            &AbortScope::new(),
            classify_backend_error,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::backend(BackendErrorKind::Auth, "bad key")) }
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            Error::Backend {
                kind: BackendErrorKind::Auth,
                ..
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_returns_last_error() {
        let calls = AtomicU32::new(0);
        let err = run_staged(
            "test",
            &policy(2),
            &slot(),
            &AbortScope::new(),
            classify_backend_error,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(overloaded()) }
            },
        )
        .await
        .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_substitutes_error() {
        let err = run_staged(
            "test",
            &policy(1),
            &slot(),
            &AbortScope::new(),
            classify_backend_error,
            |attempt| async move {
                // Stage that ignores cancellation and would report garbage
                tokio::time::sleep(Duration::from_secs(30)).await;
                drop(attempt);
                Err::<(), _>(Error::Tool("unreachable".to_string()))
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Timeout(TimeoutScope::Attempt)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_deadline_stops_retries() {
        let mut p = policy(10);
        p.attempt_timeout = Duration::from_secs(4);
        p.turn_timeout = Duration::from_secs(6);
        let calls = AtomicU32::new(0);
        let err = run_staged(
            "test",
            &p,
            &slot(),
            &AbortScope::new(),
            classify_backend_error,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    attempt.scope.cancelled().await;
                    Err::<(), _>(Error::Cancelled)
                }
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Timeout(TimeoutScope::Turn)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_overrun_is_distinct_from_timeout() {
        let err = run_staged(
            "test",
            &policy(0),
            &slot(),
            &AbortScope::new(),
            classify_backend_error,
            |attempt| async move {
                for _ in 0..10 {
                    attempt.budget.record_event()?;
                }
                Ok::<(), Error>(())
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            Error::BudgetExceeded(BudgetExceeded::Events { limit: 3 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_deadline_aborts_silent_attempt() {
        let mut p = policy(0);
        p.budget.deadline = Duration::from_millis(50);
        let err = run_staged(
            "test",
            &p,
            &slot(),
            &AbortScope::new(),
            classify_backend_error,
            |attempt| async move {
                // No events charged, so only the timer can stop it
                tokio::time::sleep(Duration::from_millis(300)).await;
                drop(attempt);
                Ok::<_, Error>("finished")
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            Error::BudgetExceeded(BudgetExceeded::Deadline { limit }) if limit == Duration::from_millis(50)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_error_fails_over_once() {
        let slot = FailoverSlot::new(Arc::new(ScriptedBackend::named(
            "primary",
            vec![ScriptStep::fail(BackendErrorKind::Quota, "out of quota")],
        )))
        .with_fallback(Arc::new(ScriptedBackend::named(
            "fallback",
            vec![ScriptStep::text("from fallback")],
        )));

        let request = ModelRequest::new("sys", vec![]);
        let outcome = run_staged(
            "test",
            &policy(3),
            &slot,
            &AbortScope::new(),
            classify_backend_error,
            |attempt| {
                let request = request.clone();
                async move { attempt.backend.complete(&request, &attempt.scope).await }
            },
        )
        .await
        .unwrap();

        assert!(outcome.failed_over);
        assert_eq!(outcome.retries, 1);
        assert_eq!(outcome.value.joined_text(), "from fallback");
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_without_fallback_is_fatal() {
        let calls = AtomicU32::new(0);
        let err = run_staged(
            "test",
            &policy(3),
            &slot(),
            &AbortScope::new(),
            classify_backend_error,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::backend(BackendErrorKind::Quota, "quota")) }
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Backend { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outer_cancel_stops_immediately() {
        let outer = AbortScope::new();
        let trigger = outer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.abort(AbortCause::UserInterrupt);
        });

        let calls = AtomicU32::new(0);
        let err = run_staged(
            "test",
            &policy(5),
            &slot(),
            &outer,
            classify_backend_error,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    attempt.scope.cancelled().await;
                    Err::<(), _>(Error::Cancelled)
                }
            },
        )
        .await
        .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deterministic_delay_has_no_jitter() {
        let p = policy(3);
        assert_eq!(p.delay_for(0), Duration::from_secs(1));
        assert_eq!(p.delay_for(1), Duration::from_secs(2));
        assert_eq!(p.delay_for(5), Duration::from_secs(10));
    }
}
