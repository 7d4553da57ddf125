// ABOUTME: Step definition structures as they appear in workflow JSON/YAML
// ABOUTME: Defines step kinds plus loop, retry and error-handler configuration

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(alias = "type")]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub input_mapping: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub false_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_config: Option<LoopConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_config: Option<ErrorConfig>,
    #[serde(
        with = "humantime_serde",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    /// Opaque settings handed to the step executor
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StepKind {
    #[serde(alias = "start")]
    Start,
    #[serde(alias = "end")]
    End,
    #[serde(alias = "agent")]
    Agent,
    #[serde(alias = "action")]
    Action,
    #[serde(alias = "condition")]
    Condition,
    #[serde(alias = "loop")]
    Loop,
    #[serde(alias = "error_handler", alias = "errorHandler")]
    ErrorHandler,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Start => "Start",
            StepKind::End => "End",
            StepKind::Agent => "Agent",
            StepKind::Action => "Action",
            StepKind::Condition => "Condition",
            StepKind::Loop => "Loop",
            StepKind::ErrorHandler => "ErrorHandler",
        }
    }

    /// Kinds whose work is delegated to a step executor
    pub fn is_executable(&self) -> bool {
        matches!(
            self,
            StepKind::Agent | StepKind::Action | StepKind::ErrorHandler
        )
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    pub collection_expr: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// First step of the loop body subgraph
    pub body: String,
}

fn default_max_iterations() -> usize {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorConfig {
    /// Error kinds or categories this handler catches; empty catches everything
    #[serde(default)]
    pub error_type_filter: Vec<String>,
    pub recovery_action: RecoveryAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    Continue,
    Retry,
    Fallback,
    Stop,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            depends_on: Vec::new(),
            input_mapping: IndexMap::new(),
            condition: None,
            true_branch: None,
            false_branch: None,
            loop_config: None,
            retry_policy: None,
            error_config: None,
            timeout: None,
            config: Value::Null,
        }
    }

    /// Display name, falling back to the id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Every step id this definition refers to, with the field it came from
    pub fn references(&self) -> Vec<(&'static str, &str)> {
        let mut refs: Vec<(&'static str, &str)> = self
            .depends_on
            .iter()
            .map(|dep| ("dependsOn", dep.as_str()))
            .collect();
        if let Some(target) = &self.true_branch {
            refs.push(("trueBranch", target));
        }
        if let Some(target) = &self.false_branch {
            refs.push(("falseBranch", target));
        }
        if let Some(loop_config) = &self.loop_config {
            refs.push(("loopConfig.body", &loop_config.body));
        }
        refs
    }
}
