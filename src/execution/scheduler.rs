//! Step Scheduler
//!
//! An explicit cursor over the workflow's steps sorted by execution order.
//! Branches, fallbacks and handler-requested jumps relocate the cursor by
//! index; the cursor only ever rests on an active, main-line step or past
//! the end.
//!
//! The scheduler also keeps the latest outcome of every step so the
//! execution record's counts stay consistent when a step is revisited.

use std::collections::{HashMap, HashSet};

use crate::workflow::model::{StepDefinition, WorkflowDefinition};

/// Final disposition of a step within one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Failed,
    Skipped,
}

/// Completed, failed and skipped step counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepCounts {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StepCounts {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.skipped
    }
}

pub struct Scheduler {
    steps: Vec<StepDefinition>,
    index: HashMap<String, usize>,
    // Positions of sub-steps run by a parallel step.
    owned: HashSet<usize>,
    cursor: usize,
    outcomes: HashMap<String, StepOutcome>,
}

impl Scheduler {
    pub fn new(workflow: &WorkflowDefinition) -> Self {
        let steps = workflow.ordered_steps();

        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            index.entry(step.id.clone()).or_insert(i);
        }

        let owned = steps
            .iter()
            .flat_map(|step| step.parallel_step_ids())
            .filter_map(|id| index.get(id).copied())
            .collect();

        let mut scheduler = Self {
            steps,
            index,
            owned,
            cursor: 0,
            outcomes: HashMap::new(),
        };
        scheduler.settle();
        scheduler
    }

    /// Total number of steps, including inactive and parallel-owned ones.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// The step under the cursor, `None` once past the end.
    pub fn current(&self) -> Option<&StepDefinition> {
        self.steps.get(self.cursor)
    }

    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.position_of(id).and_then(|i| self.steps.get(i))
    }

    /// Position of a step in the sorted order.
    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Whether the step only runs inside a parallel step.
    pub fn is_owned(&self, id: &str) -> bool {
        self.position_of(id)
            .is_some_and(|i| self.owned.contains(&i))
    }

    /// Moves to the next runnable step.
    pub fn advance(&mut self) {
        self.cursor += 1;
        self.settle();
    }

    /// Relocates the cursor; lands on the first runnable step at or after
    /// `position`.
    pub fn jump_to(&mut self, position: usize) {
        self.cursor = position.min(self.steps.len());
        self.settle();
    }

    /// Ends the walk.
    pub fn stop(&mut self) {
        self.cursor = self.steps.len();
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.steps.len()
    }

    fn settle(&mut self) {
        while let Some(step) = self.steps.get(self.cursor) {
            if step.is_active && !self.owned.contains(&self.cursor) {
                break;
            }
            self.cursor += 1;
        }
    }

    /// Records a step's outcome, replacing any earlier one.
    pub fn record(&mut self, step_id: &str, outcome: StepOutcome) {
        self.outcomes.insert(step_id.to_string(), outcome);
    }

    pub fn outcome(&self, step_id: &str) -> Option<StepOutcome> {
        self.outcomes.get(step_id).copied()
    }

    pub fn counts(&self) -> StepCounts {
        let mut counts = StepCounts::default();
        for step in &self.steps {
            match self.outcomes.get(&step.id) {
                Some(StepOutcome::Completed) => counts.completed += 1,
                Some(StepOutcome::Failed) => counts.failed += 1,
                Some(StepOutcome::Skipped) => counts.skipped += 1,
                None => {}
            }
        }
        counts
    }

    /// Percentage of steps with an outcome.
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 100.0;
        }
        let done = self.counts().total() as f64;
        (done / self.steps.len() as f64 * 10000.0).round() / 100.0
    }

    /// Tallies every step that never ran as skipped.
    pub fn finish(&mut self) {
        for step in &self.steps {
            self.outcomes
                .entry(step.id.clone())
                .or_insert(StepOutcome::Skipped);
        }
    }
}
