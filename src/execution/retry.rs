//! Retry Controller
//!
//! Bounded re-invocation of a failed step with a fixed delay between
//! attempts. The delay is an async sleep, so other executions keep running.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::{Map, Value};
use tokio::time::sleep;

use super::context::ExecutionContext;
use super::dispatch::{ActionRegistry, DispatchOutcome, StepResult};
use crate::config::EngineConfig;
use crate::workflow::model::StepDefinition;

/// Retry bounds for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Resolves the bounds: error policy first, then the step's own
    /// defaults, then the engine defaults.
    pub fn for_step(step: &StepDefinition, config: &EngineConfig) -> Self {
        let max_retries = step
            .error_handling
            .max_retries
            .or(step.max_retries)
            .unwrap_or(config.default_max_retries);

        let delay_ms = step
            .error_handling
            .retry_delay_ms
            .or(step.retry_delay_ms)
            .unwrap_or(config.default_retry_delay_ms);

        Self {
            max_retries,
            delay: Duration::from_millis(delay_ms),
        }
    }

    /// Delay before the next attempt; a result's `retryAfterMs` wins.
    pub fn delay_after(&self, previous: &StepResult) -> Duration {
        previous
            .retry_after_ms
            .map(Duration::from_millis)
            .unwrap_or(self.delay)
    }
}

/// One retry attempt.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// 1 for the first retry
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub outcome: DispatchOutcome,
}

/// Re-dispatches `step` up to `policy.max_retries` times.
///
/// Every attempt is pushed onto `attempts` as soon as it finishes, so the
/// caller still sees them if this future is dropped by a timeout. Returns the
/// first successful outcome, or a failure noting the retry count.
pub async fn retry(
    registry: &ActionRegistry,
    step: &StepDefinition,
    input: &Map<String, Value>,
    ctx: &ExecutionContext,
    policy: &RetryPolicy,
    last: &DispatchOutcome,
    attempts: &mut Vec<Attempt>,
) -> DispatchOutcome {
    let mut previous = last.clone();

    for number in 1..=policy.max_retries {
        let delay = policy.delay_after(&previous.result);
        info!(
            "Retrying step '{}' ({}/{}) in {:?}",
            step.id, number, policy.max_retries, delay
        );
        sleep(delay).await;

        let started_at = Utc::now();
        let outcome = registry.dispatch(step, input, ctx).await;
        attempts.push(Attempt {
            number,
            started_at,
            outcome: outcome.clone(),
        });

        if outcome.succeeded() {
            info!("Step '{}' succeeded on retry {}", step.id, number);
            return outcome;
        }

        warn!(
            "Step '{}' retry {}/{} failed: {}",
            step.id,
            number,
            policy.max_retries,
            outcome.result.error_message()
        );
        previous = outcome;
    }

    DispatchOutcome {
        result: StepResult::failure(format!(
            "failed after {} retries: {}",
            policy.max_retries,
            previous.result.error_message()
        )),
        raised: previous.raised,
        duration: previous.duration,
    }
}
