//! Execution budgets, abort scopes and backoff
//!
//! These are the leaf primitives used by the retry harness and the turn loop:
//! - **ExecutionBudget**: per-attempt counters with fixed ceilings
//! - **AbortScope**: nested cancellation with a recorded cause
//! - **Backoff**: jittered exponential retry delays

mod abort;
mod backoff;

pub use abort::{sleep_or_abort, AbortCause, AbortScope, DeadlineGuard, TimeoutScope};
pub use backoff::{compute_retry_delay, compute_retry_delay_with};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::duration_str;
use crate::{Error, Result};

/// Fixed ceilings for one attempt
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    /// Maximum stream events (text, tool-call, tool-response)
    #[serde(default = "default_max_events")]
    pub max_events: u32,
    /// Maximum tool calls the model may emit
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u32,
    /// Wall-clock allowance for one attempt, enforced by a timer on the
    /// attempt scope and rechecked as events arrive
    #[serde(default = "default_deadline", with = "duration_str")]
    pub deadline: Duration,
}

fn default_max_events() -> u32 {
    4096
}

fn default_max_tool_calls() -> u32 {
    32
}

fn default_deadline() -> Duration {
    Duration::from_secs(90)
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            max_tool_calls: default_max_tool_calls(),
            deadline: default_deadline(),
        }
    }
}

/// Which ceiling was crossed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetExceeded {
    Events { limit: u32 },
    ToolCalls { limit: u32 },
    Deadline { limit: Duration },
}

impl BudgetExceeded {
    pub fn deadline(limits: &BudgetLimits) -> Self {
        BudgetExceeded::Deadline {
            limit: limits.deadline,
        }
    }
}

impl fmt::Display for BudgetExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetExceeded::Events { limit } => write!(f, "more than {} stream events", limit),
            BudgetExceeded::ToolCalls { limit } => write!(f, "more than {} tool calls", limit),
            BudgetExceeded::Deadline { limit } => {
                write!(f, "ran past {}", humantime::format_duration(*limit))
            }
        }
    }
}

/// Mutable counters for one retry attempt
#[derive(Debug)]
pub struct ExecutionBudget {
    limits: BudgetLimits,
    events: u32,
    tool_calls: u32,
    started: Instant,
}

impl ExecutionBudget {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            events: 0,
            tool_calls: 0,
            started: Instant::now(),
        }
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    /// (events, tool calls) consumed so far
    pub fn usage(&self) -> (u32, u32) {
        (self.events, self.tool_calls)
    }

    /// Charge one stream event
    pub fn charge_event(&mut self) -> std::result::Result<(), BudgetExceeded> {
        self.events += 1;
        if self.events > self.limits.max_events {
            return Err(BudgetExceeded::Events {
                limit: self.limits.max_events,
            });
        }
        self.check_deadline()
    }

    /// Charge one tool call
    pub fn charge_tool_call(&mut self) -> std::result::Result<(), BudgetExceeded> {
        self.tool_calls += 1;
        if self.tool_calls > self.limits.max_tool_calls {
            return Err(BudgetExceeded::ToolCalls {
                limit: self.limits.max_tool_calls,
            });
        }
        Ok(())
    }

    pub fn check_deadline(&self) -> std::result::Result<(), BudgetExceeded> {
        if self.started.elapsed() > self.limits.deadline {
            return Err(BudgetExceeded::deadline(&self.limits));
        }
        Ok(())
    }
}

/// Shared handle to an attempt's budget. Crossing a ceiling aborts the
/// attempt scope with a budget cause.
#[derive(Debug, Clone)]
pub struct BudgetHandle {
    budget: Arc<Mutex<ExecutionBudget>>,
    scope: AbortScope,
}

impl BudgetHandle {
    pub fn new(limits: BudgetLimits, scope: AbortScope) -> Self {
        Self {
            budget: Arc::new(Mutex::new(ExecutionBudget::new(limits))),
            scope,
        }
    }

    /// Budget that never runs out, for callers outside the retry harness
    pub fn unlimited() -> Self {
        Self::new(
            BudgetLimits {
                max_events: u32::MAX,
                max_tool_calls: u32::MAX,
                deadline: Duration::from_secs(60 * 60 * 24 * 365),
            },
            AbortScope::new(),
        )
    }

    pub fn record_event(&self) -> Result<()> {
        self.charge(|b| b.charge_event())
    }

    pub fn record_tool_call(&self) -> Result<()> {
        self.charge(|b| b.charge_tool_call())
    }

    pub fn usage(&self) -> (u32, u32) {
        self.budget.lock().map(|b| b.usage()).unwrap_or((0, 0))
    }

    fn charge<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ExecutionBudget) -> std::result::Result<(), BudgetExceeded>,
    {
        let outcome = {
            let mut budget = self
                .budget
                .lock()
                .map_err(|_| Error::Config("execution budget lock poisoned".to_string()))?;
            f(&mut budget)
        };
        if let Err(exceeded) = outcome {
            self.scope.abort(AbortCause::Budget(exceeded.clone()));
            return Err(Error::BudgetExceeded(exceeded));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(events: u32, tools: u32) -> BudgetLimits {
        BudgetLimits {
            max_events: events,
            max_tool_calls: tools,
            deadline: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_event_ceiling() {
        let mut budget = ExecutionBudget::new(limits(2, 10));
        assert!(budget.charge_event().is_ok());
        assert!(budget.charge_event().is_ok());
        assert_eq!(
            budget.charge_event(),
            Err(BudgetExceeded::Events { limit: 2 })
        );
    }

    #[test]
    fn test_tool_call_ceiling() {
        let mut budget = ExecutionBudget::new(limits(100, 1));
        assert!(budget.charge_tool_call().is_ok());
        assert_eq!(
            budget.charge_tool_call(),
            Err(BudgetExceeded::ToolCalls { limit: 1 })
        );
        assert_eq!(budget.usage(), (0, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_follows_tokio_clock() {
        let mut budget = ExecutionBudget::new(limits(100, 10));
        assert!(budget.check_deadline().is_ok());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(
            budget.charge_event(),
            Err(BudgetExceeded::Deadline {
                limit: Duration::from_secs(60)
            })
        );
    }

    #[test]
    fn test_default_deadline_fits_inside_attempt_timeout() {
        let retry = crate::config::RetryConfig::default();
        assert!(BudgetLimits::default().deadline < retry.attempt_timeout);
    }

    #[test]
    fn test_handle_aborts_scope_with_budget_cause() {
        let scope = AbortScope::new();
        let handle = BudgetHandle::new(limits(1, 1), scope.clone());
        handle.record_event().unwrap();
        let err = handle.record_event().unwrap_err();

        assert!(matches!(err, Error::BudgetExceeded(BudgetExceeded::Events { .. })));
        assert!(scope.is_aborted());
        assert!(matches!(scope.cause(), Some(AbortCause::Budget(_))));
    }
}
