// ABOUTME: Workflow validation ahead of execution
// ABOUTME: Compiles the step graph and syntax-checks every expression without running anything

use crate::engine::graph::{CompileOptions, WorkflowGraph};
use crate::expression::{check_bare_syntax, check_syntax};

use super::error::ValidationError;
use super::step::{RecoveryAction, StepDefinition, StepKind};
use super::workflow::WorkflowDefinition;

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
    pub is_valid: bool,
    /// Topological step order, present when the graph compiled
    pub execution_order: Vec<String>,
}

pub struct WorkflowValidator {
    strict_mode: bool,
    allow_orphans: bool,
}

impl WorkflowValidator {
    pub fn new() -> Self {
        Self {
            strict_mode: false,
            allow_orphans: false,
        }
    }

    /// In strict mode expression problems are errors rather than warnings
    pub fn with_strict_mode(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    pub fn with_allow_orphans(mut self, allow: bool) -> Self {
        self.allow_orphans = allow;
        self
    }

    /// Validate a complete workflow
    pub fn validate(&self, workflow: &WorkflowDefinition) -> ValidationReport {
        let mut report = ValidationReport::new();

        match WorkflowGraph::compile_with(
            &workflow.steps,
            CompileOptions {
                allow_orphans: self.allow_orphans,
            },
        ) {
            Ok(graph) => {
                for &orphan in graph.orphans() {
                    report.warnings.push(format!(
                        "Step '{}' is unreachable from Start and will be skipped",
                        graph.id_of(orphan)
                    ));
                }
                report.execution_order = graph.execution_order();
            }
            Err(e) => report.errors.push(e.into()),
        }

        for step in &workflow.steps {
            self.validate_expressions(step, &mut report);
            self.validate_policies(step, &mut report);
        }

        report.is_valid = report.errors.is_empty();
        report
    }

    fn validate_expressions(&self, step: &StepDefinition, report: &mut ValidationReport) {
        let mut problems = Vec::new();

        for (param, expr) in &step.input_mapping {
            if let Err(e) = check_syntax(expr) {
                problems.push((format!("inputMapping.{}", param), e.to_string()));
            }
        }
        if let Some(condition) = &step.condition {
            if let Err(e) = check_bare_syntax(condition) {
                problems.push(("condition".to_string(), e.to_string()));
            }
        }
        if let Some(loop_config) = &step.loop_config {
            if let Err(e) = check_bare_syntax(&loop_config.collection_expr) {
                problems.push(("loopConfig.collectionExpr".to_string(), e.to_string()));
            }
        }

        for (field, error) in problems {
            let problem = ValidationError::InvalidExpression {
                step: step.id.clone(),
                field,
                error,
            };
            if self.strict_mode {
                report.errors.push(problem);
            } else {
                report.warnings.push(problem.to_string());
            }
        }
    }

    /// Configuration that compiles but has no effect at runtime
    fn validate_policies(&self, step: &StepDefinition, report: &mut ValidationReport) {
        if step.retry_policy.is_some() && !step.kind.is_executable() {
            report.warnings.push(format!(
                "Step '{}' is a {} step; its retryPolicy only applies to executor failures",
                step.id, step.kind
            ));
        }

        if let Some(config) = &step.error_config {
            if config.recovery_action == RecoveryAction::Fallback && config.fallback_value.is_none()
            {
                report.warnings.push(format!(
                    "Error handler '{}' uses fallback without fallbackValue; null will be used",
                    step.id
                ));
            }
        }
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            is_valid: true,
            execution_order: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

impl Default for WorkflowValidator {
    fn default() -> Self {
        Self::new()
    }
}
