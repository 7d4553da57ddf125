// ABOUTME: Step and workflow status types plus per-step result records
// ABOUTME: Includes error classification used by error-handler filters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Paused,
    Stopped,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Stopped
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowStatus::Running => "Running",
            WorkflowStatus::Completed => "Completed",
            WorkflowStatus::Failed => "Failed",
            WorkflowStatus::Paused => "Paused",
            WorkflowStatus::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

/// Where a step failure originated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Evaluation,
    Execution,
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Evaluation => "evaluation",
            ErrorKind::Execution => "execution",
            ErrorKind::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    Authentication,
    Validation,
    ResourceLimit,
    BusinessLogic,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Validation => "validation",
            ErrorCategory::ResourceLimit => "resource_limit",
            ErrorCategory::BusinessLogic => "business_logic",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Classify an error message by the keywords it contains
    pub fn classify(message: &str) -> Self {
        let message = message.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| message.contains(w));

        if has(&["timeout", "timed out", "deadline"]) {
            ErrorCategory::Timeout
        } else if has(&["connection", "network", "unreachable", "dns", "socket"]) {
            ErrorCategory::Network
        } else if has(&["unauthorized", "forbidden", "authentication", "api key", "401", "403"]) {
            ErrorCategory::Authentication
        } else if has(&["rate limit", "quota", "too many requests", "429", "out of memory"]) {
            ErrorCategory::ResourceLimit
        } else if has(&["invalid", "validation", "missing", "required", "malformed"]) {
            ErrorCategory::Validation
        } else if has(&["business", "rule", "policy", "not allowed"]) {
            ErrorCategory::BusinessLogic
        } else {
            ErrorCategory::Unknown
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepError {
    pub kind: ErrorKind,
    pub category: ErrorCategory,
    pub message: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let category = match kind {
            ErrorKind::Timeout => ErrorCategory::Timeout,
            ErrorKind::Evaluation => ErrorCategory::Validation,
            ErrorKind::Execution => ErrorCategory::classify(&message),
        };
        Self {
            kind,
            category,
            message,
        }
    }

    /// Whether an error-handler filter entry names this error's kind or category
    pub fn matches_filter(&self, filter: &[String]) -> bool {
        filter.is_empty()
            || filter.iter().any(|entry| {
                entry.eq_ignore_ascii_case(self.kind.as_str())
                    || entry.eq_ignore_ascii_case(self.category.as_str())
            })
    }

    pub fn is_retryable(&self) -> bool {
        self.kind != ErrorKind::Evaluation
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind.as_str(), self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IterationResult {
    pub index: usize,
    pub item: Value,
    /// Body step outputs for this iteration keyed by step id
    pub outputs: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<StepError>,
    /// 1-based number of the latest attempt
    pub attempt: u32,
    pub retry_delays: Vec<Duration>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iterations: Vec<IterationResult>,
    /// Error handler that recovered this step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered_by: Option<String>,
}

impl StepResult {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            output: None,
            error: None,
            attempt: 0,
            retry_delays: Vec::new(),
            started_at: None,
            completed_at: None,
            iterations: Vec::new(),
            recovered_by: None,
        }
    }

    pub fn mark_started(&mut self) {
        self.status = StepStatus::Running;
        self.attempt += 1;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn mark_completed(&mut self, output: Value) {
        self.status = StepStatus::Completed;
        self.output = Some(output);
        self.error = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: StepError) {
        self.status = StepStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_skipped(&mut self) {
        self.status = StepStatus::Skipped;
        self.completed_at = Some(Utc::now());
    }

    /// Forget the previous loop iteration's run of this step
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.step_id));
    }

    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
