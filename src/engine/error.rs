// ABOUTME: Error types for workflow scheduling and the run-control service
// ABOUTME: ExecutionError describes run-level failures, RuntimeError covers submit/control/inspect calls

use thiserror::Error;

use super::graph::CompileError;
use super::result::WorkflowStatus;
use super::store::StoreError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Deadlock: no step is ready or running, but steps remain unfinished: {pending:?}")]
    Deadlock { pending: Vec<String> },

    #[error("Step '{step_id}' failed: {message}")]
    StepFailed { step_id: String, message: String },

    #[error("Step '{step_id}' failed: {message} (stopped by error handler '{handler}')")]
    StoppedByHandler {
        step_id: String,
        handler: String,
        message: String,
    },
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Workflow compilation failed: {0}")]
    Compile(#[from] CompileError),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {run_id} already finished with status {status}")]
    RunFinished {
        run_id: String,
        status: WorkflowStatus,
    },

    #[error("Scheduler of run {run_id} stopped while the run was {status}")]
    SchedulerLost {
        run_id: String,
        status: WorkflowStatus,
    },

        #[error("Execution store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
