// ABOUTME: Error types for workflow definition parsing and validation
// ABOUTME: Separates malformed input from graph compilation failures

use thiserror::Error;

use crate::engine::graph::CompileError;

#[derive(Error, Debug)]
pub enum ParserError {
    #[error("Failed to read workflow file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Empty workflow: no steps defined")]
    EmptyWorkflow,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("Invalid expression in step '{step}' field '{field}': {error}")]
    InvalidExpression {
        step: String,
        field: String,
        error: String,
    },
}

pub type Result<T> = std::result::Result<T, ParserError>;
