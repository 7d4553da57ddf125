// ABOUTME: Step executor interface the scheduler calls for Agent, Action and ErrorHandler steps
// ABOUTME: Provides the StepExecutor trait, invocation/error types, and a kind-keyed registry

pub mod echo;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;

use crate::parser::StepKind;

pub use echo::EchoExecutor;

/// Everything an executor needs to run one attempt of a step
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub run_id: String,
    pub step_id: String,
    pub kind: StepKind,
    /// Input resolved from the step's input mapping
    pub input: Map<String, Value>,
    /// The step's opaque `config` block
    pub config: Value,
    pub deadline: Option<Instant>,
    /// 1-based attempt number
    pub attempt: u32,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No executor registered for step kind {0}")]
    Unsupported(StepKind),
}

impl StepExecutionError {
    pub fn failed(message: impl Into<String>) -> Self {
        StepExecutionError::Failed(message.into())
    }
}

pub type Result<T> = std::result::Result<T, StepExecutionError>;

#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, invocation: StepInvocation) -> Result<Map<String, Value>>;
}

/// Dispatches invocations to the executor registered for their step kind
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<StepKind, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry where every executable kind echoes its input
    pub fn with_builtins() -> Self {
        let echo: Arc<dyn StepExecutor> = Arc::new(EchoExecutor);
        let mut registry = Self::new();
        for kind in [StepKind::Agent, StepKind::Action, StepKind::ErrorHandler] {
            registry.register(kind, Arc::clone(&echo));
        }
        registry
    }

    pub fn register(&mut self, kind: StepKind, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(kind, executor);
    }

    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(&kind).cloned()
    }

    pub fn supported_kinds(&self) -> Vec<StepKind> {
        let mut kinds: Vec<StepKind> = self.executors.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

#[async_trait]
impl StepExecutor for ExecutorRegistry {
    async fn execute(&self, invocation: StepInvocation) -> Result<Map<String, Value>> {
        match self.executors.get(&invocation.kind) {
            Some(executor) => executor.execute(invocation).await,
            None => Err(StepExecutionError::Unsupported(invocation.kind)),
        }
    }
}
