//
// Copyright (c) The Rvrd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::future::Future;
use std::time::Duration;

use tokio::time;

/// A wait-for-stabilization step exhausted its retry budget.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConvergenceTimeout {
    pub attempts: usize,
    pub interval: Duration,
}

/// Bounded retry counter for event-driven convergence polling.
///
/// Pollers that can't block (e.g. timer-tick driven state machines) consume
/// one attempt per tick and fail the enclosing operation once the budget is
/// exhausted, instead of silently retrying forever.
#[derive(Clone, Copy, Debug)]
pub struct RetryBudget {
    attempts: usize,
    remaining: usize,
    interval: Duration,
}

// ===== impl ConvergenceTimeout =====

impl std::fmt::Display for ConvergenceTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to converge within {} polling intervals of {:?}",
            self.attempts, self.interval
        )
    }
}

impl std::error::Error for ConvergenceTimeout {}

// ===== impl RetryBudget =====

impl RetryBudget {
    pub fn new(attempts: usize, interval: Duration) -> RetryBudget {
        RetryBudget {
            attempts,
            remaining: attempts,
            interval,
        }
    }

    /// Consumes one retry attempt. Returns an error once the budget is
    /// exhausted.
    pub fn consume(&mut self) -> Result<(), ConvergenceTimeout> {
        if self.remaining == 0 {
            return Err(self.timeout());
        }
        self.remaining -= 1;
        Ok(())
    }

    /// Restores the full budget (used when an operation enters a new
    /// convergence phase).
    pub fn refill(&mut self) {
        self.remaining = self.attempts;
    }

    fn timeout(&self) -> ConvergenceTimeout {
        ConvergenceTimeout {
            attempts: self.attempts,
            interval: self.interval,
        }
    }
}

// ===== global functions =====

/// Polls the given condition until it yields a value, sleeping `interval`
/// between attempts, for at most `attempts` attempts.
///
/// This is the blocking counterpart of [`RetryBudget`], usable wherever an
/// async context is available (tests, sequential orchestration steps).
pub async fn wait_for<T, F, Fut>(
    interval: Duration,
    attempts: usize,
    mut poll: F,
) -> Result<T, ConvergenceTimeout>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..attempts {
        if let Some(value) = poll().await {
            return Ok(value);
        }
        time::sleep(interval).await;
    }

    Err(ConvergenceTimeout {
        attempts,
        interval,
    })
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_converges() {
        let mut polls = 0;
        let result = wait_for(Duration::from_millis(1), 10, || {
            polls += 1;
            let value = (polls == 3).then_some(polls);
            async move { value }
        })
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let result =
            wait_for(Duration::from_millis(1), 4, || async { None::<()> })
                .await;
        assert_eq!(
            result,
            Err(ConvergenceTimeout {
                attempts: 4,
                interval: Duration::from_millis(1),
            })
        );
    }

    #[test]
    fn test_retry_budget() {
        let mut budget = RetryBudget::new(2, Duration::from_millis(10));
        assert!(budget.consume().is_ok());
        assert!(budget.consume().is_ok());
        assert!(budget.consume().is_err());
        budget.refill();
        assert!(budget.consume().is_ok());
    }
}
