// ABOUTME: Parser module for JSON and YAML workflow definitions
// ABOUTME: Exports step/workflow data structures, parsing and pre-execution validation

pub mod error;
pub mod step;
pub mod validation;
pub mod workflow;

pub use error::{ParserError, ValidationError};
pub use step::{ErrorConfig, LoopConfig, RecoveryAction, RetryPolicy, StepDefinition, StepKind};
pub use validation::{ValidationReport, WorkflowValidator};
pub use workflow::{DefinitionFormat, WorkflowDefinition, WorkflowParser, WorkflowSettings};
