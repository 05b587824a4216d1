use std::time::Duration;

/// Failure counter shared by every push a worker processes.
///
/// The count is not tracked per message: consecutive failures on different
/// messages accumulate toward the same ceiling, which makes the ceiling a
/// circuit breaker for systemic trouble rather than a per-item budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub retries: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// What the consumer does with a message after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `backoff`, then return the message to its queue
    Requeue { backoff: Duration },
    /// Ceiling exceeded: stop the worker and leave the message to the broker
    Escalate,
}

/// Worker health derived from the retry state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// Terminal; the process is expected to exit
    Escalated,
}

/// Retry ceiling and linear backoff unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 5,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_unit: Duration) -> Self {
        RetryPolicy {
            max_retries,
            backoff_unit,
        }
    }

    /// Any successful push resets the counter
    pub fn on_success(&self, _state: RetryState) -> RetryState {
        RetryState { retries: 0 }
    }

    /// Count a failure and decide between requeue and escalation
    pub fn on_failure(&self, state: RetryState) -> (RetryState, RetryDecision) {
        let next = RetryState {
            retries: state.retries.saturating_add(1),
        };

        let decision = if next.retries > self.max_retries {
            RetryDecision::Escalate
        } else {
            RetryDecision::Requeue {
                backoff: self.backoff_for(next),
            }
        };

        (next, decision)
    }

    /// Backoff grows linearly: `retries` units
    pub fn backoff_for(&self, state: RetryState) -> Duration {
        self.backoff_unit.saturating_mul(state.retries)
    }

    pub fn health(&self, state: RetryState) -> Health {
        if state.retries > self.max_retries {
            Health::Escalated
        } else {
            Health::Healthy
        }
    }
}
