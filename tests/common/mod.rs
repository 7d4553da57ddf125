// ABOUTME: Common utilities and helpers for integration tests
// ABOUTME: Provides a workflow builder and scripted step executors for driving the engine

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::fs;
use tokio::sync::Notify;

use agentflow::parser::{
    ErrorConfig, LoopConfig, RecoveryAction, RetryPolicy, StepDefinition, StepKind,
    WorkflowDefinition,
};
use agentflow::steps::{StepExecutionError, StepExecutor, StepInvocation};

pub struct TestWorkflowBuilder {
    name: String,
    variables: Map<String, Value>,
    steps: Vec<StepDefinition>,
}

impl TestWorkflowBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            variables: Map::new(),
            steps: Vec::new(),
        }
    }

    pub fn with_variable(mut self, key: &str, value: Value) -> Self {
        self.variables.insert(key.to_string(), value);
        self
    }

    pub fn start(self) -> Self {
        self.step(StepDefinition::new("start", StepKind::Start))
    }

    pub fn end(self, depends_on: &[&str]) -> Self {
        self.step(with_deps(StepDefinition::new("end", StepKind::End), depends_on))
    }

    pub fn agent(self, id: &str, depends_on: &[&str]) -> Self {
        self.step(with_deps(StepDefinition::new(id, StepKind::Agent), depends_on))
    }

    pub fn action(self, id: &str, depends_on: &[&str]) -> Self {
        self.step(with_deps(StepDefinition::new(id, StepKind::Action), depends_on))
    }

    pub fn condition(self, id: &str, depends_on: &[&str], expr: &str, yes: &str, no: &str) -> Self {
        let mut step = with_deps(StepDefinition::new(id, StepKind::Condition), depends_on);
        step.condition = Some(expr.to_string());
        step.true_branch = Some(yes.to_string());
        step.false_branch = Some(no.to_string());
        self.step(step)
    }

    pub fn loop_over(self, id: &str, depends_on: &[&str], collection: &str, body: &str) -> Self {
        let mut step = with_deps(StepDefinition::new(id, StepKind::Loop), depends_on);
        step.loop_config = Some(LoopConfig {
            collection_expr: collection.to_string(),
            max_iterations: 1000,
            body: body.to_string(),
        });
        self.step(step)
    }

    pub fn handler(
        self,
        id: &str,
        guards: &[&str],
        action: RecoveryAction,
        fallback: Option<Value>,
    ) -> Self {
        let mut step = with_deps(StepDefinition::new(id, StepKind::ErrorHandler), guards);
        step.error_config = Some(ErrorConfig {
            error_type_filter: Vec::new(),
            recovery_action: action,
            fallback_value: fallback,
        });
        self.step(step)
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Modify the most recently added step
    pub fn with_last<F: FnOnce(&mut StepDefinition)>(mut self, f: F) -> Self {
        if let Some(step) = self.steps.last_mut() {
            f(step);
        }
        self
    }

    pub fn map(self, param: &str, expr: &str) -> Self {
        let (param, expr) = (param.to_string(), expr.to_string());
        self.with_last(move |step| {
            step.input_mapping.insert(param, expr);
        })
    }

    pub fn retries(self, max_retries: u32) -> Self {
        self.with_last(move |step| {
            step.retry_policy = Some(RetryPolicy {
                max_retries,
                ..RetryPolicy::default()
            });
        })
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        self.with_last(move |step| step.timeout = Some(timeout))
    }

    pub fn build(self) -> WorkflowDefinition {
        let mut definition = WorkflowDefinition::new(self.name, self.steps);
        definition.variables = self.variables;
        definition
    }

    pub async fn write_to_file(self, path: &Path) -> std::io::Result<()> {
        let content = serde_json::to_string_pretty(&self.build())?;
        fs::write(path, content).await
    }
}

fn with_deps(mut step: StepDefinition, depends_on: &[&str]) -> StepDefinition {
    step.depends_on = depends_on.iter().map(|d| d.to_string()).collect();
    step
}

pub struct TestEnvironment {
    pub temp_dir: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub async fn create_workflow_file(&self, name: &str, builder: TestWorkflowBuilder) -> PathBuf {
        let path = self.path().join(format!("{}.json", name));
        builder
            .write_to_file(&path)
            .await
            .expect("Failed to write workflow file");
        path
    }
}

/// One scripted reaction of a step: succeed with an output, fail, or sleep first
#[derive(Clone)]
pub enum Reply {
    Output(Value),
    Fail(String),
    Sleep(Duration, Box<Reply>),
}

/// Executor driven by per-step scripts; echoes the input once a script runs out
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, step_id: &str, replies: Vec<Reply>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(step_id.to_string(), replies.into());
        self
    }

    pub fn fail_always(self, step_id: &str, message: &str) -> Self {
        let replies = (0..64).map(|_| Reply::Fail(message.to_string())).collect();
        self.script(step_id, replies)
    }

    /// Every invocation so far as (step id, resolved input)
    pub fn calls(&self) -> Vec<(String, Map<String, Value>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, step_id: &str) -> Vec<Map<String, Value>> {
        self.calls()
            .into_iter()
            .filter(|(id, _)| id == step_id)
            .map(|(_, input)| input)
            .collect()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        invocation: StepInvocation,
    ) -> Result<Map<String, Value>, StepExecutionError> {
        self.calls
            .lock()
            .unwrap()
            .push((invocation.step_id.clone(), invocation.input.clone()));

        let reply = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&invocation.step_id)
            .and_then(|queue| queue.pop_front());

        let mut reply = match reply {
            Some(reply) => reply,
            None => return Ok(invocation.input),
        };
        loop {
            match reply {
                Reply::Output(Value::Object(map)) => return Ok(map),
                Reply::Output(other) => {
                    let mut map = Map::new();
                    map.insert("value".to_string(), other);
                    return Ok(map);
                }
                Reply::Fail(message) => return Err(StepExecutionError::failed(message)),
                Reply::Sleep(duration, next) => {
                    tokio::time::sleep(duration).await;
                    reply = *next;
                }
            }
        }
    }
}

/// Executor that blocks every step until the test releases it
pub struct GatedExecutor {
    pub gate: Arc<Notify>,
    pub started: Arc<Notify>,
}

impl GatedExecutor {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(Notify::new()),
            started: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl StepExecutor for GatedExecutor {
    async fn execute(
        &self,
        invocation: StepInvocation,
    ) -> Result<Map<String, Value>, StepExecutionError> {
        self.started.notify_one();
        self.gate.notified().await;
        Ok(invocation.input)
    }
}

/// Executor tracking how many invocations run at the same time
#[derive(Default)]
pub struct ConcurrencyGauge {
    current: Mutex<usize>,
    pub peak: Mutex<usize>,
}

#[async_trait]
impl StepExecutor for ConcurrencyGauge {
    async fn execute(
        &self,
        invocation: StepInvocation,
    ) -> Result<Map<String, Value>, StepExecutionError> {
        {
            let mut current = self.current.lock().unwrap();
            *current += 1;
            let mut peak = self.peak.lock().unwrap();
            *peak = (*peak).max(*current);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        *self.current.lock().unwrap() -= 1;
        Ok(json!({ "step": invocation.step_id }).as_object().cloned().unwrap_or_default())
    }
}
