//! Planner seam and the run history it plans from.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::core::fix_cycle::FixState;
use crate::core::types::{FixIdentity, OperationRequest, Outcome};
use crate::executor::StepReport;

/// What the planner wants next.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerDecision {
    Operation(OperationRequest),
    Finish { summary: String },
}

/// Chooses the next operation from the history so far.
#[async_trait]
pub trait Planner: Send {
    async fn next(&mut self, history: &RunHistory) -> Result<PlannerDecision>;
}

/// One executed step as the planner sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub iteration: u32,
    pub request: OperationRequest,
    pub identity: FixIdentity,
    pub outcome: Outcome,
    pub fix_state: FixState,
    pub skipped: bool,
    pub verifications: Vec<(FixIdentity, Outcome)>,
}

/// Ordered record of a run's steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunHistory {
    pub goal: Option<String>,
    pub entries: Vec<HistoryEntry>,
}

impl RunHistory {
    pub fn new(goal: Option<String>) -> Self {
        Self {
            goal,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, iteration: u32, report: &StepReport) {
        self.entries.push(HistoryEntry {
            iteration,
            request: report.request.clone(),
            identity: report.identity.clone(),
            outcome: report.outcome.clone(),
            fix_state: report.fix_state,
            skipped: report.skipped,
            verifications: report
                .verifications
                .iter()
                .map(|v| (v.identity.clone(), v.outcome.clone()))
                .collect(),
        });
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Text form of the history. Failure detail follows each failed step.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(goal) = &self.goal {
            out.push_str(&format!("Goal: {goal}\n"));
        }
        for entry in &self.entries {
            out.push_str(&format!(
                "[{}] {} -> {}: {}\n",
                entry.iteration,
                entry.identity,
                label(&entry.outcome),
                entry.outcome.summary()
            ));
            let detail = entry
                .outcome
                .failure_detail()
                .filter(|d| !d.is_empty() && *d != entry.outcome.summary());
            if let Some(detail) = detail {
                for line in detail.lines() {
                    out.push_str(&format!("    {line}\n"));
                }
            }
            match entry.fix_state {
                FixState::Exhausted => out.push_str(&format!(
                    "    retries exhausted for {}; choose a different approach\n",
                    entry.identity
                )),
                FixState::Failing(n) => {
                    out.push_str(&format!("    failed attempts so far: {n}\n"));
                }
                FixState::Clean => {}
            }
            for (identity, outcome) in &entry.verifications {
                out.push_str(&format!(
                    "    verify {identity} -> {}: {}\n",
                    label(outcome),
                    outcome.summary()
                ));
            }
        }
        out
    }
}

fn label(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Success { .. } => "SUCCESS",
        Outcome::Failure { .. } => "FAILURE",
        Outcome::InfrastructureError { .. } => "ERROR",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::InfraKind;
    use crate::executor::VerificationReport;
    use serde_json::json;

    fn report(outcome: Outcome, fix_state: FixState) -> StepReport {
        let request = OperationRequest::new("run_shell", json!({"command": "tsc"}));
        StepReport {
            identity: request.fix_identity(),
            request,
            outcome,
            fix_state,
            skipped: false,
            verifications: Vec::new(),
            interactive_task: None,
        }
    }

    #[test]
    fn render_lists_steps_with_failure_detail() {
        let mut history = RunHistory::new(Some("fix the build".to_string()));
        history.push(
            1,
            &report(
                Outcome::Failure {
                    summary: "Command 'tsc' failed with return code 2.".to_string(),
                    detail: "Stderr:\nerror TS2304\nStdout:\n".to_string(),
                },
                FixState::Failing(1),
            ),
        );
        history.push(
            2,
            &report(
                Outcome::Success {
                    summary: "Command 'tsc' executed successfully.".to_string(),
                },
                FixState::Clean,
            ),
        );

        let text = history.render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Goal: fix the build");
        assert_eq!(
            lines[1],
            "[1] run_shell(tsc) -> FAILURE: Command 'tsc' failed with return code 2."
        );
        assert!(lines.contains(&"    error TS2304"));
        assert!(lines.contains(&"    failed attempts so far: 1"));
        assert_eq!(
            *lines.last().expect("lines"),
            "[2] run_shell(tsc) -> SUCCESS: Command 'tsc' executed successfully."
        );
    }

    #[test]
    fn render_flags_exhaustion_and_verifications() {
        let mut step = report(
            Outcome::InfrastructureError {
                kind: InfraKind::Spawn,
                detail: "tsc not found".to_string(),
            },
            FixState::Exhausted,
        );
        step.verifications.push(VerificationReport {
            identity: step.identity.clone(),
            outcome: Outcome::Success {
                summary: "ok".to_string(),
            },
            fix_state: FixState::Clean,
        });
        let mut history = RunHistory::default();
        history.push(3, &step);

        let text = history.render();
        assert!(text.starts_with("[3] run_shell(tsc) -> ERROR: tsc not found\n"));
        assert_eq!(text.matches("tsc not found").count(), 1);
        assert!(text.contains("retries exhausted for run_shell(tsc)"));
        assert!(text.contains("verify run_shell(tsc) -> SUCCESS: ok"));
        assert_eq!(history.last().map(|e| e.iteration), Some(3));
    }
}
