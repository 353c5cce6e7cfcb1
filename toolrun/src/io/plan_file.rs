//! JSON plan files replayed by `toolrun run`.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::types::OperationRequest;
use crate::planner::{Planner, PlannerDecision, RunHistory};

/// A fixed list of operations toward a goal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanFile {
    #[serde(default)]
    pub goal: Option<String>,
    pub steps: Vec<OperationRequest>,
    /// Reported when every step has been issued.
    #[serde(default)]
    pub finish_summary: Option<String>,
}

pub fn load_plan(path: &Path) -> Result<PlanFile> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let plan: PlanFile =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    if let Some(step) = plan.steps.iter().find(|step| step.tool.trim().is_empty()) {
        bail!("plan step {:?} has an empty tool name", step.id);
    }
    Ok(plan)
}

/// Issues the plan's steps in order.
///
/// Stops early when the previous step hit an identity whose retries are
/// exhausted; replaying further would build on a broken step.
pub struct PlanFilePlanner {
    steps: VecDeque<OperationRequest>,
    finish_summary: String,
}

impl PlanFilePlanner {
    pub fn new(plan: PlanFile) -> Self {
        Self {
            steps: plan.steps.into(),
            finish_summary: plan
                .finish_summary
                .unwrap_or_else(|| "plan complete".to_string()),
        }
    }
}

#[async_trait]
impl Planner for PlanFilePlanner {
    async fn next(&mut self, history: &RunHistory) -> Result<PlannerDecision> {
        if let Some(last) = history.last().filter(|entry| entry.skipped) {
            return Ok(PlannerDecision::Finish {
                summary: format!("stopped: {} exhausted its retries", last.identity),
            });
        }
        Ok(match self.steps.pop_front() {
            Some(request) => PlannerDecision::Operation(request),
            None => PlannerDecision::Finish {
                summary: self.finish_summary.clone(),
            },
        })
    }
}
