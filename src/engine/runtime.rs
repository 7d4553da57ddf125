// ABOUTME: Run-control service that submits workflows and tracks their schedulers
// ABOUTME: Exposes submit, pause, resume, stop, state inspection and waiting by run id

use futures::future;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::error::{Result, RuntimeError};
use super::graph::{CompileOptions, WorkflowGraph};
use super::scheduler::{ControlCommand, Scheduler, SchedulerConfig};
use super::state::{ExecutionSnapshot, ExecutionState};
use super::store::ExecutionStore;
use crate::parser::WorkflowDefinition;
use crate::steps::StepExecutor;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub max_concurrent_steps: usize,
    pub step_timeout: Option<Duration>,
    /// Accept steps unreachable from Start instead of rejecting the workflow
    pub allow_orphans: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 8,
            step_timeout: None,
            allow_orphans: false,
        }
    }
}

struct RunHandle {
    control: mpsc::UnboundedSender<ControlCommand>,
    snapshots: watch::Receiver<ExecutionSnapshot>,
}

#[derive(Clone)]
pub struct WorkflowRuntime {
    executor: Arc<dyn StepExecutor>,
    config: RuntimeConfig,
    store: Option<Arc<dyn ExecutionStore>>,
    runs: Arc<RwLock<HashMap<String, RunHandle>>>,
}

impl WorkflowRuntime {
    pub fn new(executor: Arc<dyn StepExecutor>, config: RuntimeConfig) -> Self {
        Self {
            executor,
            config,
            store: None,
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Compile the definition and start a run; returns its run id
    #[instrument(skip(self, definition, input), fields(workflow = %definition.name))]
    pub async fn submit(&self, definition: &WorkflowDefinition, input: Value) -> Result<String> {
        let graph = WorkflowGraph::compile_with(
            &definition.steps,
            CompileOptions {
                allow_orphans: self.config.allow_orphans,
            },
        )?;

        let mut config = SchedulerConfig {
            max_concurrent_steps: self.config.max_concurrent_steps,
            step_timeout: self.config.step_timeout,
        };
        if let Some(settings) = &definition.settings {
            if let Some(max) = settings.max_concurrent_steps {
                config.max_concurrent_steps = max;
            }
            if settings.step_timeout.is_some() {
                config.step_timeout = settings.step_timeout;
            }
        }

        let run_id = Uuid::new_v4().to_string();
        let state = ExecutionState::new(
            run_id.clone(),
            &graph,
            definition.workflow_id(),
            definition.name.clone(),
            input,
            definition.variables.clone(),
        );

        let mut scheduler = Scheduler::new(
            Arc::new(graph),
            state,
            Arc::clone(&self.executor),
            config,
        );
        if let Some(store) = &self.store {
            scheduler = scheduler.with_store(Arc::clone(store));
        }

        let handle = RunHandle {
            control: scheduler.control(),
            snapshots: scheduler.subscribe(),
        };
        self.runs.write().await.insert(run_id.clone(), handle);

        info!("Submitted run {} for workflow {}", run_id, definition.name);
        let task = tokio::spawn(scheduler.run());
        let runtime = self.clone();
        let id = run_id.clone();
        tokio::spawn(async move { runtime.supervise(id, task).await });

        Ok(run_id)
    }

    /// Await the scheduler; once the store holds the final snapshot the run leaves memory
    async fn supervise(&self, run_id: String, task: JoinHandle<ExecutionSnapshot>) {
        let snapshot = match task.await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Scheduler for run {} terminated abnormally: {}", run_id, e);
                return;
            }
        };

        let Some(store) = &self.store else {
            return;
        };
        match store.load(&run_id).await {
            Ok(Some(stored)) if stored.status == snapshot.status => {
                self.runs.write().await.remove(&run_id);
                debug!("Run {} finished; serving it from the store", run_id);
            }
            Ok(_) => warn!("Final state of run {} was not persisted; keeping it in memory", run_id),
            Err(e) => warn!("Failed to verify persisted state of run {}: {}", run_id, e),
        }
    }

    /// Submit a run and wait for it to finish
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        input: Value,
    ) -> Result<ExecutionSnapshot> {
        let run_id = self.submit(definition, input).await?;
        self.wait(&run_id).await
    }

    pub async fn pause(&self, run_id: &str) -> Result<()> {
        self.send(run_id, ControlCommand::Pause).await
    }

    pub async fn resume(&self, run_id: &str) -> Result<()> {
        self.send(run_id, ControlCommand::Resume).await
    }

    pub async fn stop(&self, run_id: &str) -> Result<()> {
        self.send(run_id, ControlCommand::Stop).await
    }

    async fn send(&self, run_id: &str, command: ControlCommand) -> Result<()> {
        let found = self.runs.read().await.get(run_id).map(|handle| {
            (handle.control.clone(), handle.snapshots.borrow().status)
        });
        let Some((control, status)) = found else {
            // runs evicted after finishing are only known to the store
            let snapshot = self.get_state(run_id).await?;
            if !snapshot.status.is_terminal() {
                return Err(RuntimeError::RunNotFound(run_id.to_string()));
            }
            return Err(RuntimeError::RunFinished {
                run_id: run_id.to_string(),
                status: snapshot.status,
            });
        };

        if status.is_terminal() {
            return Err(RuntimeError::RunFinished {
                run_id: run_id.to_string(),
                status,
            });
        }

        info!("Sending {:?} to run {}", command, run_id);
        control.send(command).map_err(|_| RuntimeError::RunFinished {
            run_id: run_id.to_string(),
            status,
        })
    }

    /// Latest snapshot of a run, falling back to the store for runs from earlier processes
    pub async fn get_state(&self, run_id: &str) -> Result<ExecutionSnapshot> {
        if let Some(handle) = self.runs.read().await.get(run_id) {
            return Ok(handle.snapshots.borrow().clone());
        }

        if let Some(store) = &self.store {
            if let Some(snapshot) = store.load(run_id).await? {
                return Ok(snapshot);
            }
        }

        Err(RuntimeError::RunNotFound(run_id.to_string()))
    }

    /// Wait until the run reaches Completed, Failed or Stopped
    pub async fn wait(&self, run_id: &str) -> Result<ExecutionSnapshot> {
        let receiver = self
            .runs
            .read()
            .await
            .get(run_id)
            .map(|handle| handle.snapshots.clone());
        let Some(mut snapshots) = receiver else {
            return self.get_state(run_id).await;
        };

        let settled = snapshots
            .wait_for(|s| s.status.is_terminal())
            .await
            .is_ok();
        let snapshot = snapshots.borrow().clone();
        if !settled && !snapshot.status.is_terminal() {
            return Err(RuntimeError::SchedulerLost {
                run_id: run_id.to_string(),
                status: snapshot.status,
            });
        }
        Ok(snapshot)
    }

    /// Ids of runs known to this runtime, including persisted ones
    pub async fn list_runs(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.runs.read().await.keys().cloned().collect();
        if let Some(store) = &self.store {
            for id in store.list().await? {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Stop every unfinished run and wait for all of them to settle
    pub async fn shutdown(&self) -> Vec<ExecutionSnapshot> {
        let ids: Vec<String> = self.runs.read().await.keys().cloned().collect();

        for id in &ids {
            match self.stop(id).await {
                Ok(()) | Err(RuntimeError::RunFinished { .. }) => {}
                Err(e) => warn!("Failed to stop run {}: {}", id, e),
            }
        }

        future::join_all(ids.iter().map(|id| self.wait(id)))
            .await
            .into_iter()
            .filter_map(|result| result.ok())
            .collect()
    }
}
