// ABOUTME: Mutable working memory of a single workflow run and its serializable snapshot
// ABOUTME: Only the scheduler loop mutates ExecutionState; readers get ExecutionSnapshot copies

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

use super::graph::WorkflowGraph;
use super::result::{StepError, StepResult, StepStatus, WorkflowStatus};

/// The failing step and message recorded when a run fails
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionFailure {
    pub step_id: Option<String>,
    pub message: String,
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step_id {
            Some(step) => write!(f, "step '{}' failed: {}", step, self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub run_id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub input: Value,
    pub variables: Map<String, Value>,
    pub status: WorkflowStatus,
    pub error: Option<ExecutionFailure>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    ids: Vec<String>,
    results: Vec<StepResult>,
    completed: BTreeSet<String>,
    failed: BTreeSet<String>,
}

impl ExecutionState {
    pub fn new(
        run_id: impl Into<String>,
        graph: &WorkflowGraph,
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
        input: Value,
        variables: Map<String, Value>,
    ) -> Self {
        let ids: Vec<String> = graph
            .node_indices()
            .map(|index| graph.id_of(index).to_string())
            .collect();
        let results = ids.iter().map(StepResult::new).collect();

        Self {
            run_id: run_id.into(),
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            input,
            variables,
            status: WorkflowStatus::Running,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            ids,
            results,
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
        }
    }

    pub fn step_status(&self, index: NodeIndex) -> StepStatus {
        self.results[index.index()].status
    }

    pub fn set_status(&mut self, index: NodeIndex, status: StepStatus) {
        self.results[index.index()].status = status;
    }

    pub fn result(&self, index: NodeIndex) -> &StepResult {
        &self.results[index.index()]
    }

    pub fn result_mut(&mut self, index: NodeIndex) -> &mut StepResult {
        &mut self.results[index.index()]
    }

    pub fn mark_running(&mut self, index: NodeIndex) {
        self.results[index.index()].mark_started();
    }

    /// Record a completed step and publish its output under its id
    pub fn record_completed(&mut self, index: NodeIndex, output: Value) {
        let id = self.ids[index.index()].clone();
        self.failed.remove(&id);
        self.variables.insert(id.clone(), output.clone());
        self.results[index.index()].mark_completed(output);
        self.completed.insert(id);
    }

    pub fn record_failed(&mut self, index: NodeIndex, error: StepError) {
        let id = self.ids[index.index()].clone();
        self.results[index.index()].mark_failed(error);
        self.failed.insert(id);
    }

    pub fn record_skipped(&mut self, index: NodeIndex) {
        self.failed.remove(&self.ids[index.index()]);
        self.results[index.index()].mark_skipped();
    }

    /// Drop a step from the failed set ahead of a recovery retry
    pub fn clear_failed(&mut self, index: NodeIndex) {
        self.failed.remove(&self.ids[index.index()]);
    }

    /// Return a step to Pending for the next loop iteration
    pub fn reset_step(&mut self, index: NodeIndex) {
        let id = &self.ids[index.index()];
        self.completed.remove(id);
        self.failed.remove(id);
        self.variables.remove(id);
        self.results[index.index()].reset();
    }

    /// Outputs of completed steps keyed by step id, exposed as `$node`
    pub fn node_outputs(&self) -> Map<String, Value> {
        self.results
            .iter()
            .filter(|r| r.status == StepStatus::Completed)
            .filter_map(|r| r.output.clone().map(|o| (r.step_id.clone(), o)))
            .collect()
    }

    pub fn is_completed(&self, index: NodeIndex) -> bool {
        self.completed.contains(&self.ids[index.index()])
    }

    pub fn fail(&mut self, step_id: Option<&str>, message: impl Into<String>) {
        self.error = Some(ExecutionFailure {
            step_id: step_id.map(str::to_string),
            message: message.into(),
        });
        self.finish(WorkflowStatus::Failed);
    }

    pub fn finish(&mut self, status: WorkflowStatus) {
        self.status = status;
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            run_id: self.run_id.clone(),
            workflow_id: self.workflow_id.clone(),
            workflow_name: self.workflow_name.clone(),
            status: self.status,
            input: self.input.clone(),
            variables: self.variables.clone(),
            step_results: self
                .results
                .iter()
                .map(|r| (r.step_id.clone(), r.clone()))
                .collect(),
            completed: self.completed.iter().cloned().collect(),
            failed: self.failed.iter().cloned().collect(),
            error: self.error.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            updated_at: Utc::now(),
        }
    }
}

/// Point-in-time copy of a run, safe to hand to callers and stores
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    pub run_id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    pub input: Value,
    pub variables: Map<String, Value>,
    pub step_results: IndexMap<String, StepResult>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub error: Option<ExecutionFailure>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SnapshotSummary {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub unfinished_steps: usize,
}

impl ExecutionSnapshot {
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.get(step_id)
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.step(step_id).map(|r| r.status)
    }

    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.step(step_id).and_then(|r| r.output.as_ref())
    }

    pub fn summary(&self) -> SnapshotSummary {
        let mut summary = SnapshotSummary {
            total_steps: self.step_results.len(),
            ..SnapshotSummary::default()
        };
        for result in self.step_results.values() {
            match result.status {
                StepStatus::Completed => summary.completed_steps += 1,
                StepStatus::Failed => summary.failed_steps += 1,
                StepStatus::Skipped => summary.skipped_steps += 1,
                _ => summary.unfinished_steps += 1,
            }
        }
        summary
    }

    pub fn duration(&self) -> Option<std::time::Duration> {
        self.completed_at
            .and_then(|end| (end - self.started_at).to_std().ok())
    }
}
