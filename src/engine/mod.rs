// ABOUTME: Workflow execution engine: graph compilation, scheduling and run control
// ABOUTME: Drives compiled step graphs to completion with retries, loops and error handlers

pub mod error;
pub mod graph;
pub mod result;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod store;

pub use error::{ExecutionError, Result, RuntimeError};
pub use graph::{CompileError, CompileOptions, CompiledStep, EdgeKind, WorkflowGraph};
pub use result::{
    ErrorCategory, ErrorKind, IterationResult, StepError, StepResult, StepStatus, WorkflowStatus,
};
pub use retry::{calculate_delay, next_attempt};
pub use runtime::{RuntimeConfig, WorkflowRuntime};
pub use scheduler::{ControlCommand, Scheduler, SchedulerConfig};
pub use state::{ExecutionFailure, ExecutionSnapshot, ExecutionState, SnapshotSummary};
pub use store::{ExecutionStore, FileStore, InMemoryStore, StoreError};
