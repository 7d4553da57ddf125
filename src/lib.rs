// ABOUTME: Main library module for the agentflow workflow execution engine
// ABOUTME: Exports all core modules and provides the public API

pub mod cli;
pub mod engine;
pub mod expression;
pub mod parser;
pub mod steps;

// Re-export commonly used types
pub use cli::{App, Args, Config};
pub use engine::{
    ExecutionSnapshot, RuntimeConfig, StepStatus, WorkflowGraph, WorkflowRuntime, WorkflowStatus,
};
pub use expression::DataContext;
pub use parser::{StepDefinition, StepKind, WorkflowDefinition, WorkflowParser, WorkflowValidator};
pub use steps::{ExecutorRegistry, StepExecutor, StepInvocation};

// Error handling
pub type Result<T> = anyhow::Result<T>;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
