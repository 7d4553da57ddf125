// ABOUTME: Error types for expression parsing and evaluation
// ABOUTME: Every failure of the sandboxed evaluator surfaces as a typed EvaluationError

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("Syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("Unterminated expression: missing '}}}}' after position {position}")]
    UnterminatedTemplate { position: usize },

    #[error("Unknown identifier: {0}")]
    UnknownIdentifier(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Unknown method '{method}' for {target}")]
    UnknownMethod { method: String, target: String },

    #[error("Undefined path: {0}")]
    UndefinedPath(String),

    #[error("Type error: {0}")]
    TypeError(String),

    #[error("Invalid arguments for {function}: {reason}")]
    InvalidArguments { function: String, reason: String },

    #[error("Numeric result is not a finite number: {0}")]
    NonFiniteNumber(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Condition must evaluate to a scalar, got {0}")]
    NonBooleanCondition(String),

    #[error("Expected an array to iterate over, got {0}")]
    NotIterable(String),
}

impl EvaluationError {
    pub(crate) fn syntax(position: usize, message: impl Into<String>) -> Self {
        EvaluationError::Syntax {
            position,
            message: message.into(),
        }
    }

    pub(crate) fn type_error(message: impl Into<String>) -> Self {
        EvaluationError::TypeError(message.into())
    }

    pub(crate) fn invalid_args(function: &str, reason: impl Into<String>) -> Self {
        EvaluationError::InvalidArguments {
            function: function.to_string(),
            reason: reason.into(),
        }
    }

    /// True when the error only reports a missing value rather than a broken expression
    pub fn is_undefined_path(&self) -> bool {
        matches!(self, EvaluationError::UndefinedPath(_))
    }
}

pub type Result<T> = std::result::Result<T, EvaluationError>;
