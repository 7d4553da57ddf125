// ABOUTME: Command implementations for the agentflow CLI
// ABOUTME: Handles execution of run, validate, graph and init commands

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::config::Config;
use crate::engine::{
    CompileOptions, ExecutionSnapshot, FileStore, WorkflowGraph, WorkflowRuntime, WorkflowStatus,
};
use crate::parser::{WorkflowDefinition, WorkflowParser, WorkflowValidator};
use crate::steps::ExecutorRegistry;

/// Resolve the run input from a file, inline JSON, or an empty object
pub async fn load_input(path: Option<PathBuf>, inline: Option<String>) -> Result<Value> {
    if let Some(path) = path {
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read input file {}", path.display()))?;
        return serde_json::from_str(&content)
            .with_context(|| format!("Input file {} is not valid JSON", path.display()));
    }

    match inline {
        Some(text) => serde_json::from_str(&text).context("--input-json is not valid JSON"),
        None => Ok(json!({})),
    }
}

async fn load_workflow(workflow_path: &Path) -> Result<WorkflowDefinition> {
    WorkflowParser::new()
        .parse_file(workflow_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse workflow: {}", e))
}

/// Execute a workflow command
pub async fn run_workflow(
    workflow_path: PathBuf,
    input: Value,
    overrides: Map<String, Value>,
    dry_run: bool,
    output: Option<PathBuf>,
    config: &Config,
) -> Result<()> {
    info!("Starting workflow execution: {}", workflow_path.display());

    let mut workflow = load_workflow(&workflow_path).await?;
    let mut variables = config.variables.clone();
    variables.extend(std::mem::take(&mut workflow.variables));
    variables.extend(overrides);
    workflow.variables = variables;
    info!(
        "Loaded workflow: {} ({} steps, {} variables)",
        workflow.name,
        workflow.steps.len(),
        workflow.variables.len()
    );

    if dry_run {
        let graph = WorkflowGraph::compile_with(
            &workflow.steps,
            CompileOptions {
                allow_orphans: config.allow_orphans,
            },
        )
        .map_err(|e| anyhow::anyhow!("Workflow compilation failed: {}", e))?;
        println!(
            "✓ Workflow '{}' compiled: {} steps",
            workflow.name,
            graph.len()
        );
        info!("Dry run - workflow compilation successful");
        return Ok(());
    }

    let mut runtime = WorkflowRuntime::new(
        Arc::new(ExecutorRegistry::with_builtins()),
        config.runtime_config(),
    );
    if let Some(dir) = &config.state_dir {
        runtime = runtime.with_store(Arc::new(FileStore::new(dir)));
    }

    let snapshot = runtime
        .execute(&workflow, input)
        .await
        .map_err(|e| anyhow::anyhow!("Workflow execution failed: {}", e))?;

    match output {
        Some(output_path) => {
            let content = serde_json::to_string_pretty(&snapshot)
                .context("Failed to serialize execution snapshot")?;
            tokio::fs::write(&output_path, content)
                .await
                .with_context(|| format!("Failed to write {}", output_path.display()))?;
            info!("Results written to: {}", output_path.display());
        }
        None => print_snapshot(&snapshot),
    }

    match snapshot.status {
        WorkflowStatus::Completed => Ok(()),
        status => Err(anyhow::anyhow!(
            "Workflow run {} finished with status {}{}",
            snapshot.run_id,
            status,
            snapshot
                .error
                .as_ref()
                .map(|e| format!(": {}", e))
                .unwrap_or_default()
        )),
    }
}

fn print_snapshot(snapshot: &ExecutionSnapshot) {
    println!(
        "Workflow '{}' run {} finished with status: {}",
        snapshot.workflow_name, snapshot.run_id, snapshot.status
    );

    for result in snapshot.step_results.values() {
        let attempts = if result.attempt > 1 {
            format!(" ({} attempts)", result.attempt)
        } else {
            String::new()
        };
        println!("  Step '{}': {:?}{}", result.step_id, result.status, attempts);
        if let Some(output) = &result.output {
            println!("    Output: {}", output);
        }
        if let Some(error) = &result.error {
            println!("    Error: {}", error);
        }
    }

    let summary = snapshot.summary();
    println!(
        "  {} completed, {} skipped, {} failed",
        summary.completed_steps, summary.skipped_steps, summary.failed_steps
    );
}

/// Validate a workflow file
pub async fn validate_workflow(workflow_path: PathBuf, strict: bool, config: &Config) -> Result<()> {
    info!("Validating workflow: {}", workflow_path.display());

    let workflow = load_workflow(&workflow_path).await?;
    let report = WorkflowValidator::new()
        .with_strict_mode(strict)
        .with_allow_orphans(config.allow_orphans)
        .validate(&workflow);

    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }

    if !report.is_valid {
        for error in &report.errors {
            println!("  error: {}", error);
        }
        return Err(anyhow::anyhow!(
            "Workflow '{}' is invalid ({} errors)",
            workflow.name,
            report.errors.len()
        ));
    }

    println!("✓ Workflow '{}' is valid", workflow.name);
    println!("  Steps: {}", workflow.steps.len());
    println!("  Execution order: {}", report.execution_order.join(" -> "));

    info!("Workflow validation completed successfully");
    Ok(())
}

/// Print the compiled graph's tagged edges
pub async fn print_graph(workflow_path: PathBuf, config: &Config) -> Result<()> {
    let workflow = load_workflow(&workflow_path).await?;
    let graph = WorkflowGraph::compile_with(
        &workflow.steps,
        CompileOptions {
            allow_orphans: config.allow_orphans,
        },
    )
    .map_err(|e| anyhow::anyhow!("Workflow compilation failed: {}", e))?;

    println!("Workflow '{}' ({} steps)", workflow.name, graph.len());
    for (from, to, kind) in graph.edges() {
        println!("  {} -[{}]-> {}", from, kind.as_str(), to);
    }
    for &orphan in graph.orphans() {
        println!("  {} (unreachable)", graph.id_of(orphan));
    }

    Ok(())
}

/// Initialize a new workflow file
pub async fn init_workflow(name: String, output_dir: PathBuf) -> Result<()> {
    info!(
        "Initializing workflow '{}' in {}",
        name,
        output_dir.display()
    );

    tokio::fs::create_dir_all(&output_dir).await?;

    let workflow_file = output_dir.join(format!("{}.json", name));
    if workflow_file.exists() {
        return Err(anyhow::anyhow!(
            "Workflow file already exists: {}",
            workflow_file.display()
        ));
    }

    let content = serde_json::to_string_pretty(&starter_workflow(&name))?;
    tokio::fs::write(&workflow_file, content).await?;

    println!("Created workflow file: {}", workflow_file.display());
    info!("Created workflow file: {}", workflow_file.display());
    Ok(())
}

/// Start -> Agent -> End skeleton written by `init`
pub fn starter_workflow(name: &str) -> Value {
    json!({
        "name": name,
        "description": "Starter workflow",
        "version": "1.0",
        "variables": { "greeting": "Hello" },
        "steps": [
            { "id": "start", "kind": "Start" },
            {
                "id": "agent",
                "kind": "Agent",
                "dependsOn": ["start"],
                "inputMapping": {
                    "prompt": "{{ $context.greeting }}, {{ $json.name }}"
                },
                "retryPolicy": { "maxRetries": 2, "initialDelay": "1s" },
                "timeout": "30s"
            },
            {
                "id": "end",
                "kind": "End",
                "dependsOn": ["agent"],
                "inputMapping": { "result": "{{ $node.agent }}" }
            }
        ]
    })
}
