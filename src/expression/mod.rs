// ABOUTME: Safe expression language for input mappings, conditions and loop collections
// ABOUTME: Parses {{ }} regions into a restricted AST and interprets it without host code access

pub mod ast;
pub mod context;
pub mod error;
pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;

pub use context::{DataContext, ROOTS};
pub use error::{EvaluationError, Result};
pub use evaluator::{
    check_bare_syntax, check_syntax, evaluate, evaluate_collection, evaluate_condition,
    evaluate_template,
};
