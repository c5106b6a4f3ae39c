//! Error Policy Engine
//!
//! Translates a failed step's configured reaction into a control-flow
//! decision for the scheduler. Pure: no I/O, no mutation.

use log::warn;

use super::dispatch::DispatchOutcome;
use super::scheduler::Scheduler;
use crate::workflow::model::{OnError, StepDefinition, StepType};

/// What the scheduler does after a failed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// End the execution as failed
    Abort { message: String },
    /// Count the step as failed and move on
    Advance,
    /// Count the step as skipped and move on
    Skip,
    /// Count the step as failed and relocate the cursor
    Jump(usize),
    /// Hand the step to the retry controller
    Retry,
}

/// The step's own `onError`, else the workflow default.
pub fn effective_action(step: &StepDefinition, workflow_default: OnError) -> OnError {
    let action = step.error_handling.on_error.unwrap_or(workflow_default);
    // Parallel steps run as one atomic unit and are never re-dispatched.
    if action == OnError::Retry && step.step_type == StepType::Parallel {
        return OnError::Stop;
    }
    action
}

/// Decides how to react to a failed outcome.
///
/// A critical step whose handler raised always aborts, whatever its
/// `onError` says.
pub fn decide(
    step: &StepDefinition,
    outcome: &DispatchOutcome,
    workflow_default: OnError,
    scheduler: &Scheduler,
) -> PolicyDecision {
    let message = outcome.result.error_message();

    if step.is_critical && outcome.raised {
        return PolicyDecision::Abort {
            message: format!("critical step '{}' raised: {}", step.id, message),
        };
    }

    match effective_action(step, workflow_default) {
        OnError::Stop => PolicyDecision::Abort { message },
        OnError::Continue => match step.error_handling.continue_step_id.as_deref() {
            Some(target) => match scheduler.position_of(target) {
                Some(position) => PolicyDecision::Jump(position),
                None => {
                    warn!("Step '{}': continueStepId '{}' not found", step.id, target);
                    PolicyDecision::Advance
                }
            },
            None => PolicyDecision::Advance,
        },
        OnError::Retry => PolicyDecision::Retry,
        OnError::Skip => PolicyDecision::Skip,
        OnError::GotoStep => match step
            .error_handling
            .fallback_step_id
            .as_deref()
            .and_then(|target| scheduler.position_of(target))
        {
            Some(position) => PolicyDecision::Jump(position),
            None => PolicyDecision::Abort { message },
        },
    }
}
