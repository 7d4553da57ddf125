// ABOUTME: Read-only data context that expressions are evaluated against
// ABOUTME: Exposes the whitelisted roots ($json, $node, $context, $now, ...) as JSON values

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

/// Names accepted after a `$` prefix
pub const ROOTS: &[&str] = &[
    "json",
    "node",
    "context",
    "now",
    "today",
    "timestamp",
    "workflow",
    "execution",
];

#[derive(Debug, Clone)]
pub struct DataContext {
    /// Current loop item, or the run input outside loops
    pub json: Value,
    /// Outputs of prior steps keyed by step id
    pub node: Map<String, Value>,
    /// Shared run variables
    pub context: Map<String, Value>,
    pub workflow: Value,
    pub execution: Value,
    pub now: DateTime<Utc>,
}

impl DataContext {
    pub fn new(json: Value) -> Self {
        Self {
            json,
            node: Map::new(),
            context: Map::new(),
            workflow: Value::Object(Map::new()),
            execution: Value::Object(Map::new()),
            now: Utc::now(),
        }
    }

    pub fn with_node_outputs(mut self, node: Map<String, Value>) -> Self {
        self.node = node;
        self
    }

    pub fn with_variables(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_workflow(mut self, id: &str, name: &str) -> Self {
        self.workflow = json!({ "id": id, "name": name });
        self
    }

    pub fn with_execution(mut self, execution: Value) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Resolve a `$root`; `None` means the name is not whitelisted
    pub fn root(&self, name: &str) -> Option<Value> {
        match name {
            "json" => Some(self.json.clone()),
            "node" => Some(Value::Object(self.node.clone())),
            "context" => Some(Value::Object(self.context.clone())),
            "now" => Some(Value::String(self.now.to_rfc3339())),
            "today" => Some(Value::String(self.now.date_naive().to_string())),
            "timestamp" => Some(json!(self.now.timestamp_millis() as f64 / 1000.0)),
            "workflow" => Some(self.workflow.clone()),
            "execution" => Some(self.execution.clone()),
            _ => None,
        }
    }
}

impl Default for DataContext {
    fn default() -> Self {
        Self::new(Value::Null)
    }
}
