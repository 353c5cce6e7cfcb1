//! Plan/execute loop for `toolrun run`.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::core::budget::{DEFAULT_MAX_ITERATIONS, IterationBudget};
use crate::core::types::FixIdentity;
use crate::executor::{StepReport, TaskExecutor};
use crate::planner::{Planner, PlannerDecision, RunHistory};

/// Per-run settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub max_iterations: u32,
    pub goal: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            goal: None,
        }
    }
}

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stop", rename_all = "snake_case")]
pub enum RunStop {
    /// The planner declared the goal done.
    Finished { summary: String },
    /// The planner asked for another operation after `max_iterations`.
    IterationLimitExceeded { iterations: u32, max_iterations: u32 },
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub steps_executed: u32,
    pub stop: RunStop,
    pub history: RunHistory,
    /// Identities that ran out of retries during the run.
    pub exhausted: Vec<FixIdentity>,
}

/// Ask the planner for operations and execute them until it finishes or the
/// iteration budget runs out.
///
/// Failed operations are fed back to the planner through the history. Only
/// planner errors and dispatch defects end the run with `Err`.
#[instrument(skip_all, fields(run_id))]
pub async fn run_loop<P, F>(
    planner: &mut P,
    executor: &mut TaskExecutor,
    config: &RunConfig,
    mut on_step: F,
) -> Result<RunOutcome>
where
    P: Planner + ?Sized,
    F: FnMut(&StepReport),
{
    let run_id = Uuid::new_v4();
    tracing::Span::current().record("run_id", tracing::field::display(run_id));
    executor.begin_run();

    let mut budget = IterationBudget::new(config.max_iterations);
    let mut history = RunHistory::new(config.goal.clone());

    let stop = loop {
        let decision = planner
            .next(&history)
            .await
            .with_context(|| format!("planner failed after {} steps", budget.used()))?;
        let request = match decision {
            PlannerDecision::Finish { summary } => break RunStop::Finished { summary },
            PlannerDecision::Operation(request) => request,
        };
        let Some(iteration) = budget.try_begin() else {
            warn!(max_iterations = budget.max_iterations(), "iteration limit reached");
            break RunStop::IterationLimitExceeded {
                iterations: budget.used(),
                max_iterations: budget.max_iterations(),
            };
        };

        let report = executor
            .execute(&request)
            .await
            .with_context(|| format!("dispatch {}", request.tool))?;
        info!(iteration, identity = %report.identity, success = report.outcome.is_success(), "step");
        history.push(iteration, &report);
        on_step(&report);
    };

    Ok(RunOutcome {
        run_id,
        steps_executed: budget.used(),
        stop,
        history,
        exhausted: executor.tracker().exhausted(),
    })
}
