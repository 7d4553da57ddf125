// ABOUTME: Frontier-based scheduler driving one workflow run to completion
// ABOUTME: Single-writer loop over tagged edges with concurrent workers, retries, loops and error handlers

use futures::FutureExt;
use petgraph::graph::NodeIndex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::error::ExecutionError;
use super::graph::{EdgeKind, WorkflowGraph};
use super::result::{ErrorKind, IterationResult, StepError, StepStatus, WorkflowStatus};
use super::retry::next_attempt;
use super::state::{ExecutionSnapshot, ExecutionState};
use super::store::ExecutionStore;
use crate::expression::{evaluate, evaluate_collection, evaluate_condition, DataContext};
use crate::parser::{RecoveryAction, StepKind};
use crate::steps::{StepExecutor, StepInvocation};

/// Run-control commands accepted while a run is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Resume,
    Stop,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_steps: usize,
    /// Deadline for steps that do not declare their own timeout
    pub step_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 8,
            step_timeout: None,
        }
    }
}

type StepOutcome = std::result::Result<Map<String, Value>, StepError>;

enum SchedulerEvent {
    StepFinished {
        index: NodeIndex,
        token: u64,
        outcome: StepOutcome,
    },
    RetryDue {
        index: NodeIndex,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeState {
    Pending,
    Live,
    Dead,
}

struct LoopFrame {
    items: Vec<Value>,
    position: usize,
    iterations: Vec<IterationResult>,
}

/// A handler's pending obligation toward the step whose failure activated it
struct Activation {
    failed: NodeIndex,
    error: StepError,
}

pub struct Scheduler {
    graph: Arc<WorkflowGraph>,
    executor: Arc<dyn StepExecutor>,
    config: SchedulerConfig,
    state: ExecutionState,
    store: Option<Arc<dyn ExecutionStore>>,
    semaphore: Arc<Semaphore>,
    events_tx: mpsc::UnboundedSender<SchedulerEvent>,
    events_rx: mpsc::UnboundedReceiver<SchedulerEvent>,
    control_tx: mpsc::UnboundedSender<ControlCommand>,
    control_rx: mpsc::UnboundedReceiver<ControlCommand>,
    snapshot_tx: watch::Sender<ExecutionSnapshot>,
    cancel: CancellationToken,
    paused: bool,
    running: usize,
    next_token: u64,
    in_flight: HashMap<NodeIndex, u64>,
    waiting_retry: HashSet<NodeIndex>,
    retries: HashMap<NodeIndex, u32>,
    branches: HashMap<NodeIndex, bool>,
    loops: HashMap<NodeIndex, LoopFrame>,
    activations: HashMap<NodeIndex, Activation>,
}

impl Scheduler {
    pub fn new(
        graph: Arc<WorkflowGraph>,
        state: ExecutionState,
        executor: Arc<dyn StepExecutor>,
        config: SchedulerConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(state.snapshot());
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_steps.max(1)));

        Self {
            graph,
            executor,
            config,
            state,
            store: None,
            semaphore,
            events_tx,
            events_rx,
            control_tx,
            control_rx,
            snapshot_tx,
            cancel: CancellationToken::new(),
            paused: false,
            running: 0,
            next_token: 0,
            in_flight: HashMap::new(),
            waiting_retry: HashSet::new(),
            retries: HashMap::new(),
            branches: HashMap::new(),
            loops: HashMap::new(),
            activations: HashMap::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sender for pause/resume/stop commands
    pub fn control(&self) -> mpsc::UnboundedSender<ControlCommand> {
        self.control_tx.clone()
    }

    /// Receiver that always holds the latest published snapshot
    pub fn subscribe(&self) -> watch::Receiver<ExecutionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Drive the run until it completes, fails or is stopped
    #[instrument(skip(self), fields(run_id = %self.state.run_id, workflow = %self.state.workflow_name))]
    pub async fn run(mut self) -> ExecutionSnapshot {
        info!("Starting workflow run with {} steps", self.graph.len());
        self.initialize();
        self.advance();
        self.publish().await;

        while !self.state.is_terminal() {
            if self.check_finished() {
                break;
            }

            tokio::select! {
                Some(command) = self.control_rx.recv() => self.handle_command(command),
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                else => break,
            }

            self.advance();
            self.publish().await;
        }

        self.cancel.cancel();
        match &self.state.error {
            Some(failure) => error!(
                "Workflow run finished with status {}: {}",
                self.state.status, failure
            ),
            None => info!("Workflow run finished with status {}", self.state.status),
        }
        self.publish().await;
        self.state.snapshot()
    }

    fn initialize(&mut self) {
        let graph = Arc::clone(&self.graph);
        for &orphan in graph.orphans() {
            debug!("Skipping unreachable step {}", graph.id_of(orphan));
            self.state.record_skipped(orphan);
        }
        self.state.set_status(graph.entry(), StepStatus::Ready);
    }

    async fn publish(&self) {
        let snapshot = self.state.snapshot();
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&snapshot).await {
                warn!("Failed to persist snapshot for run {}: {}", snapshot.run_id, e);
            }
        }
        self.snapshot_tx.send_replace(snapshot);
    }

    /// True once the run reached a final state; detects completion and deadlock
    fn check_finished(&mut self) -> bool {
        let graph = Arc::clone(&self.graph);
        let unfinished: Vec<NodeIndex> = graph
            .node_indices()
            .filter(|&i| !self.state.step_status(i).is_terminal())
            .collect();

        if unfinished.is_empty() {
            self.state.finish(WorkflowStatus::Completed);
            return true;
        }

        let any_ready = unfinished
            .iter()
            .any(|&i| self.state.step_status(i) == StepStatus::Ready);
        if !self.paused && self.running == 0 && self.waiting_retry.is_empty() && !any_ready {
            let err = ExecutionError::Deadlock {
                pending: unfinished
                    .iter()
                    .map(|&i| graph.id_of(i).to_string())
                    .collect(),
            };
            error!("{}", err);
            self.state.fail(None, err.to_string());
            return true;
        }

        false
    }

    fn handle_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Pause if !self.paused => {
                info!("Pausing run; {} steps still in flight", self.running);
                self.paused = true;
                self.state.status = WorkflowStatus::Paused;
            }
            ControlCommand::Resume if self.paused => {
                info!("Resuming run");
                self.paused = false;
                self.state.status = WorkflowStatus::Running;
            }
            ControlCommand::Stop => {
                info!("Stopping run; discarding {} in-flight steps", self.running);
                self.cancel.cancel();
                self.state.finish(WorkflowStatus::Stopped);
            }
            _ => debug!("Ignoring redundant {:?} command", command),
        }
    }

    fn handle_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::StepFinished {
                index,
                token,
                outcome,
            } => {
                self.running = self.running.saturating_sub(1);
                if self.in_flight.get(&index) != Some(&token) {
                    debug!("Discarding stale result for step {}", self.graph.id_of(index));
                    return;
                }
                self.in_flight.remove(&index);
                if self.state.is_terminal() {
                    return;
                }
                match outcome {
                    Ok(output) => self.on_step_completed(index, Value::Object(output)),
                    Err(error) => self.on_step_failed(index, error),
                }
            }
            SchedulerEvent::RetryDue { index } => {
                if self.waiting_retry.remove(&index) && !self.state.is_terminal() {
                    self.state.set_status(index, StepStatus::Ready);
                }
            }
        }
    }

    /// Settle the frontier and start every ready step until nothing changes
    fn advance(&mut self) {
        loop {
            if self.state.is_terminal() {
                return;
            }
            self.settle();
            if self.paused {
                return;
            }

            let ready: Vec<NodeIndex> = self
                .graph
                .node_indices()
                .filter(|&i| self.state.step_status(i) == StepStatus::Ready)
                .collect();
            if ready.is_empty() {
                return;
            }

            for index in ready {
                if self.state.is_terminal() {
                    return;
                }
                if self.state.step_status(index) == StepStatus::Ready {
                    self.start_step(index);
                }
            }
        }
    }

    fn settle(&mut self) {
        loop {
            self.refresh_frontier();
            if !self.advance_loops() {
                break;
            }
        }
    }

    fn edge_state(&self, source: NodeIndex, kind: EdgeKind) -> EdgeState {
        match (self.state.step_status(source), kind) {
            (StepStatus::Skipped, _) => EdgeState::Dead,
            (StepStatus::Running, EdgeKind::LoopBody) if self.loops.contains_key(&source) => {
                EdgeState::Live
            }
            (StepStatus::Completed, EdgeKind::LoopBody) => EdgeState::Dead,
            (StepStatus::Completed, EdgeKind::BranchTrue) => {
                branch_state(self.branches.get(&source) == Some(&true))
            }
            (StepStatus::Completed, EdgeKind::BranchFalse) => {
                branch_state(self.branches.get(&source) == Some(&false))
            }
            (StepStatus::Completed, _) => EdgeState::Live,
            _ => EdgeState::Pending,
        }
    }

    /// Promote pending steps to Ready or Skipped from their incoming edge states
    fn refresh_frontier(&mut self) {
        let graph = Arc::clone(&self.graph);
        let mut changed = true;

        while changed {
            changed = false;
            for index in graph.node_indices() {
                if self.state.step_status(index) != StepStatus::Pending
                    || self.waiting_retry.contains(&index)
                    || index == graph.entry()
                {
                    continue;
                }

                if graph.kind(index) == StepKind::ErrorHandler {
                    // Unused handlers retire once everything they guard has settled
                    let settled = graph.guarded_steps(index).iter().all(|&g| {
                        matches!(
                            self.state.step_status(g),
                            StepStatus::Completed | StepStatus::Skipped
                        )
                    });
                    if settled {
                        debug!("Error handler {} was not needed", graph.id_of(index));
                        self.state.record_skipped(index);
                        changed = true;
                    }
                    continue;
                }

                let states: Vec<EdgeState> = graph
                    .incoming(index)
                    .into_iter()
                    .map(|(source, kind)| self.edge_state(source, kind))
                    .collect();
                if states.is_empty() || states.contains(&EdgeState::Pending) {
                    continue;
                }

                if states.contains(&EdgeState::Live) {
                    self.state.set_status(index, StepStatus::Ready);
                } else {
                    debug!("Skipping step {}: every incoming path was pruned", graph.id_of(index));
                    self.state.record_skipped(index);
                }
                changed = true;
            }
        }
    }

    fn start_step(&mut self, index: NodeIndex) {
        match self.graph.kind(index) {
            StepKind::Start => {
                self.state.mark_running(index);
                let input = self.state.input.clone();
                self.state.record_completed(index, input);
                info!("Step {} completed", self.graph.id_of(index));
            }
            StepKind::End => self.run_end(index),
            StepKind::Condition => self.run_condition(index),
            StepKind::Loop => self.start_loop(index),
            StepKind::Agent | StepKind::Action | StepKind::ErrorHandler => self.dispatch(index),
        }
    }

    fn data_context(&self, index: NodeIndex) -> DataContext {
        let frame = self
            .graph
            .loop_owner(index)
            .and_then(|owner| self.loops.get(&owner));
        let (item, iteration) = match frame {
            Some(frame) => (
                frame.items.get(frame.position).cloned().unwrap_or(Value::Null),
                Some(frame.position),
            ),
            None => (self.state.input.clone(), None),
        };

        let mut execution = json!({
            "id": self.state.run_id,
            "runId": self.state.run_id,
            "stepId": self.graph.id_of(index),
        });
        if let Some(iteration) = iteration {
            execution["iteration"] = json!(iteration);
        }

        DataContext::new(item)
            .with_node_outputs(self.state.node_outputs())
            .with_variables(self.state.variables.clone())
            .with_workflow(&self.state.workflow_id, &self.state.workflow_name)
            .with_execution(execution)
    }

    /// Evaluate a step's input mapping; missing paths become null parameters
    fn resolve_input(
        &self,
        index: NodeIndex,
        ctx: &DataContext,
    ) -> std::result::Result<Map<String, Value>, StepError> {
        let definition = self.graph.definition(index);
        let mut input = Map::new();

        for (param, expr) in &definition.input_mapping {
            match evaluate(expr, ctx) {
                Ok(value) => {
                    input.insert(param.clone(), value);
                }
                Err(e) if e.is_undefined_path() => {
                    debug!(
                        "Parameter {} of step {} resolved to null: {}",
                        param, definition.id, e
                    );
                    input.insert(param.clone(), Value::Null);
                }
                Err(e) => {
                    return Err(StepError::new(
                        ErrorKind::Evaluation,
                        format!("inputMapping.{}: {}", param, e),
                    ))
                }
            }
        }

        Ok(input)
    }

    fn run_end(&mut self, index: NodeIndex) {
        self.state.mark_running(index);
        let ctx = self.data_context(index);
        match self.resolve_input(index, &ctx) {
            Ok(input) if !input.is_empty() => {
                self.state.record_completed(index, Value::Object(input));
            }
            Ok(_) => {
                let graph = Arc::clone(&self.graph);
                let arrived: Map<String, Value> = graph
                    .incoming(index)
                    .into_iter()
                    .filter(|&(source, _)| self.state.step_status(source) == StepStatus::Completed)
                    .filter_map(|(source, _)| {
                        let output = self.state.result(source).output.clone()?;
                        Some((graph.id_of(source).to_string(), output))
                    })
                    .collect();
                self.state.record_completed(index, Value::Object(arrived));
            }
            Err(e) => return self.on_step_failed(index, e),
        }
        info!("Step {} completed", self.graph.id_of(index));
    }

    fn run_condition(&mut self, index: NodeIndex) {
        self.state.mark_running(index);
        let ctx = self.data_context(index);
        let graph = Arc::clone(&self.graph);
        let definition = graph.definition(index);
        let expr = definition.condition.as_deref().unwrap_or_default();

        match evaluate_condition(expr, &ctx) {
            Ok(taken) => {
                let branch = if taken {
                    definition.true_branch.clone()
                } else {
                    definition.false_branch.clone()
                };
                info!(
                    "Condition {} evaluated to {}, taking branch {:?}",
                    definition.id, taken, branch
                );
                self.branches.insert(index, taken);
                self.state
                    .record_completed(index, json!({ "result": taken, "branch": branch }));
            }
            Err(e) => self.on_step_failed(
                index,
                StepError::new(ErrorKind::Evaluation, format!("condition: {}", e)),
            ),
        }
    }

    /// Each iteration runs a body step afresh, with its full retry budget
    fn reset_body_step(&mut self, member: NodeIndex) {
        self.state.reset_step(member);
        self.retries.remove(&member);
        self.branches.remove(&member);
    }

    fn start_loop(&mut self, index: NodeIndex) {
        self.state.mark_running(index);
        self.state.result_mut(index).iterations.clear();
        let ctx = self.data_context(index);
        let graph = Arc::clone(&self.graph);
        let definition = graph.definition(index);
        let Some(loop_config) = definition.loop_config.as_ref() else {
            return self.on_step_failed(
                index,
                StepError::new(ErrorKind::Evaluation, "loop step has no loopConfig"),
            );
        };

        let mut items = match evaluate_collection(&loop_config.collection_expr, &ctx) {
            Ok(items) => items,
            Err(e) => {
                return self.on_step_failed(
                    index,
                    StepError::new(ErrorKind::Evaluation, format!("collectionExpr: {}", e)),
                )
            }
        };
        if items.len() > loop_config.max_iterations {
            warn!(
                "Loop {} truncated from {} to {} items",
                definition.id,
                items.len(),
                loop_config.max_iterations
            );
            items.truncate(loop_config.max_iterations);
        }

        for &member in graph.loop_body(index) {
            self.reset_body_step(member);
        }

        info!("Loop {} starting {} iterations", definition.id, items.len());
        if items.is_empty() {
            self.state
                .record_completed(index, json!({ "count": 0, "results": [] }));
        } else {
            self.loops.insert(
                index,
                LoopFrame {
                    items,
                    position: 0,
                    iterations: Vec::new(),
                },
            );
        }
    }

    /// Close out every loop iteration whose body has fully settled
    fn advance_loops(&mut self) -> bool {
        let graph = Arc::clone(&self.graph);
        let mut active: Vec<NodeIndex> = self.loops.keys().copied().collect();
        active.sort();
        let mut progressed = false;

        for loop_step in active {
            let body = graph.loop_body(loop_step);
            let settled = body.iter().all(|&member| {
                matches!(
                    self.state.step_status(member),
                    StepStatus::Completed | StepStatus::Skipped
                )
            });
            if !settled {
                continue;
            }

            let outputs: Map<String, Value> = body
                .iter()
                .filter(|&&member| self.state.step_status(member) == StepStatus::Completed)
                .filter_map(|&member| {
                    let output = self.state.result(member).output.clone()?;
                    Some((graph.id_of(member).to_string(), output))
                })
                .collect();

            let finished = match self.loops.get_mut(&loop_step) {
                Some(frame) => {
                    let index = frame.position;
                    frame.iterations.push(IterationResult {
                        index,
                        item: frame.items[index].clone(),
                        outputs,
                    });
                    frame.position += 1;
                    debug!("Loop {} finished iteration {}", graph.id_of(loop_step), index);
                    frame.position >= frame.items.len()
                }
                None => continue,
            };

            if finished {
                if let Some(frame) = self.loops.remove(&loop_step) {
                    let results: Vec<Value> = frame
                        .iterations
                        .iter()
                        .map(|it| Value::Object(it.outputs.clone()))
                        .collect();
                    let count = results.len();
                    self.state.result_mut(loop_step).iterations = frame.iterations;
                    self.state.record_completed(
                        loop_step,
                        json!({ "count": count, "results": results }),
                    );
                    info!(
                        "Loop {} completed after {} iterations",
                        graph.id_of(loop_step),
                        count
                    );
                }
            } else {
                for &member in body {
                    self.reset_body_step(member);
                }
            }
            progressed = true;
        }

        progressed
    }

    fn dispatch(&mut self, index: NodeIndex) {
        let graph = Arc::clone(&self.graph);
        let definition = graph.definition(index);
        self.state.mark_running(index);
        let ctx = self.data_context(index);

        let mut input = match self.resolve_input(index, &ctx) {
            Ok(input) => input,
            Err(e) => return self.on_step_failed(index, e),
        };
        if let Some(activation) = self.activations.get(&index) {
            input.insert("error".to_string(), json!(activation.error.message));
            input.insert("errorType".to_string(), json!(activation.error.kind.as_str()));
            input.insert(
                "errorCategory".to_string(),
                json!(activation.error.category.as_str()),
            );
            input.insert(
                "failedStep".to_string(),
                json!(graph.id_of(activation.failed)),
            );
        }

        let attempt = self.state.result(index).attempt;
        let limit = definition.timeout.or(self.config.step_timeout);
        self.next_token += 1;
        let token = self.next_token;
        self.in_flight.insert(index, token);
        self.running += 1;

        info!(
            "Dispatching step {} ({}), attempt {}",
            definition.id, definition.kind, attempt
        );

        let invocation = StepInvocation {
            run_id: self.state.run_id.clone(),
            step_id: definition.id.clone(),
            kind: definition.kind,
            input,
            config: definition.config.clone(),
            deadline: None,
            attempt,
        };
        let executor = Arc::clone(&self.executor);
        let semaphore = Arc::clone(&self.semaphore);
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let outcome = invoke(executor, invocation, limit).await;
            // the receiver is gone once the run has stopped
            let _ = events.send(SchedulerEvent::StepFinished {
                index,
                token,
                outcome,
            });
        });
    }

    fn on_step_completed(&mut self, index: NodeIndex, output: Value) {
        self.state.record_completed(index, output);
        info!(
            "Step {} completed (attempt {})",
            self.graph.id_of(index),
            self.state.result(index).attempt
        );

        if let Some(activation) = self.activations.remove(&index) {
            self.apply_recovery(index, activation);
        }
    }

    /// Apply retry policy, then loop propagation, then error-handler routing
    fn on_step_failed(&mut self, index: NodeIndex, error: StepError) {
        let graph = Arc::clone(&self.graph);
        let step_id = graph.id_of(index).to_string();

        if error.is_retryable() {
            let policy = graph
                .definition(index)
                .retry_policy
                .clone()
                .unwrap_or_default();
            let made = self.retries.get(&index).copied().unwrap_or(0);
            let (retry, delay) = next_attempt(made, &policy);

            if retry {
                self.retries.insert(index, made + 1);
                warn!(
                    "Step {} failed on attempt {}: {}; retrying in {:?}",
                    step_id,
                    self.state.result(index).attempt,
                    error.message,
                    delay
                );
                let result = self.state.result_mut(index);
                result.retry_delays.push(delay);
                result.error = Some(error);
                result.status = StepStatus::Pending;
                self.schedule_retry(index, delay);
                return;
            }
        }

        error!(
            "{}",
            ExecutionError::StepFailed {
                step_id: step_id.clone(),
                message: error.to_string(),
            }
        );
        self.state.record_failed(index, error.clone());

        if let Some(owner) = graph.loop_owner(index) {
            return self.fail_loop(owner, index, error);
        }

        let handler = graph.handlers_for(index).into_iter().find(|&h| {
            self.state.step_status(h) == StepStatus::Pending
                && graph
                    .definition(h)
                    .error_config
                    .as_ref()
                    .map(|c| error.matches_filter(&c.error_type_filter))
                    .unwrap_or(false)
        });

        match handler {
            Some(handler) => {
                info!(
                    "Error handler {} activated for step {}",
                    graph.id_of(handler),
                    step_id
                );
                self.activations.insert(
                    handler,
                    Activation {
                        failed: index,
                        error,
                    },
                );
                self.state.set_status(handler, StepStatus::Ready);
            }
            None => self.state.fail(Some(&step_id), error.message),
        }
    }

    fn schedule_retry(&mut self, index: NodeIndex, delay: Duration) {
        self.waiting_retry.insert(index);
        let events = self.events_tx.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(delay) => {
                    let _ = events.send(SchedulerEvent::RetryDue { index });
                }
            }
        });
    }

    /// A failed body step fails the whole loop, abandoning the current iteration
    fn fail_loop(&mut self, loop_step: NodeIndex, member: NodeIndex, error: StepError) {
        let graph = Arc::clone(&self.graph);
        let position = self
            .loops
            .remove(&loop_step)
            .map(|frame| frame.position)
            .unwrap_or(0);

        for &body_step in graph.loop_body(loop_step) {
            self.waiting_retry.remove(&body_step);
            self.in_flight.remove(&body_step);
            if !self.state.step_status(body_step).is_terminal() {
                self.state.record_skipped(body_step);
            }
        }

        let loop_error = StepError {
            kind: error.kind,
            category: error.category,
            message: format!(
                "iteration {} step '{}' failed: {}",
                position,
                graph.id_of(member),
                error.message
            ),
        };
        self.on_step_failed(loop_step, loop_error);
    }

    fn apply_recovery(&mut self, handler: NodeIndex, activation: Activation) {
        let graph = Arc::clone(&self.graph);
        let Some(config) = graph.definition(handler).error_config.as_ref() else {
            return;
        };
        let failed = activation.failed;
        let failed_id = graph.id_of(failed).to_string();
        let handler_id = graph.id_of(handler).to_string();

        info!(
            "Error handler {} applying {:?} to step {}",
            handler_id, config.recovery_action, failed_id
        );

        match config.recovery_action {
            RecoveryAction::Continue => {
                self.state.record_skipped(failed);
                self.state.result_mut(failed).recovered_by = Some(handler_id);
            }
            RecoveryAction::Retry => {
                self.retries.insert(failed, 0);
                self.state.clear_failed(failed);
                self.state.set_status(failed, StepStatus::Ready);
                let result = self.state.result_mut(failed);
                result.attempt = 0;
                result.retry_delays.clear();
                result.recovered_by = Some(handler_id);
            }
            RecoveryAction::Fallback => {
                let value = config.fallback_value.clone().unwrap_or(Value::Null);
                if graph.kind(failed) == StepKind::Condition {
                    if let Value::Bool(taken) = value {
                        self.branches.insert(failed, taken);
                    }
                }
                self.state.record_completed(failed, value);
                self.state.result_mut(failed).recovered_by = Some(handler_id);
            }
            RecoveryAction::Stop => {
                let err = ExecutionError::StoppedByHandler {
                    step_id: failed_id.clone(),
                    handler: handler_id.clone(),
                    message: activation.error.message.clone(),
                };
                error!("{}", err);
                let message = format!(
                    "{} (stopped by error handler '{}')",
                    activation.error.message, handler_id
                );
                self.state.fail(Some(&failed_id), message);
            }
        }
    }
}

fn branch_state(taken: bool) -> EdgeState {
    if taken {
        EdgeState::Live
    } else {
        EdgeState::Dead
    }
}

/// Run one attempt, enforcing the deadline when one applies
async fn invoke(
    executor: Arc<dyn StepExecutor>,
    mut invocation: StepInvocation,
    limit: Option<Duration>,
) -> StepOutcome {
    if let Some(limit) = limit {
        invocation.deadline = Some(Instant::now() + limit);
    }

    // a panicking executor fails its step instead of leaving it running forever
    let call = AssertUnwindSafe(executor.execute(invocation)).catch_unwind();
    let outcome = match limit {
        Some(limit) => match timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(StepError::new(
                    ErrorKind::Timeout,
                    format!("step exceeded its deadline of {:?}", limit),
                ))
            }
        },
        None => call.await,
    };

    match outcome {
        Ok(result) => result.map_err(|e| StepError::new(ErrorKind::Execution, e.to_string())),
        Err(_) => Err(StepError::new(ErrorKind::Execution, "step executor panicked")),
    }
}
