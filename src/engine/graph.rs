// ABOUTME: Graph compiler turning step definitions into a validated, tagged DAG
// ABOUTME: Detects duplicates, dangling references, missing Start/End, cycles, orphans and bad loop bodies

use petgraph::algo::toposort;
use petgraph::graph::{EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::{Direction, Graph};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::parser::{StepDefinition, StepKind};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("Duplicate step id: {step}")]
    DuplicateStep { step: String },

    #[error("Invalid configuration for step '{step}': {reason}")]
    InvalidStep { step: String, reason: String },

    #[error("Step '{step}' references unknown step '{target}' in {field}")]
    DanglingReference {
        step: String,
        field: String,
        target: String,
    },

    #[error("Workflow has no Start step")]
    MissingStart,

    #[error("Workflow has more than one Start step: {steps:?}")]
    MultipleStart { steps: Vec<String> },

    #[error("Start step '{step}' must not declare dependencies")]
    StartHasDependencies { step: String },

    #[error("No End step is reachable from Start step '{start}'")]
    MissingEnd { start: String },

    #[error("Cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Steps unreachable from Start: {steps:?}")]
    OrphanSteps { steps: Vec<String> },

    #[error("Invalid body for loop '{loop_step}' at step '{step}': {reason}")]
    InvalidLoopBody {
        loop_step: String,
        step: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, CompileError>;

/// Tag carried by every forward edge of the compiled graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    Dependency,
    BranchTrue,
    BranchFalse,
    LoopBody,
    LoopExit,
    ErrorCatch,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Dependency => "dependency",
            EdgeKind::BranchTrue => "branch-true",
            EdgeKind::BranchFalse => "branch-false",
            EdgeKind::LoopBody => "loop-body",
            EdgeKind::LoopExit => "loop-exit",
            EdgeKind::ErrorCatch => "error-catch",
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    /// Compile despite unreachable steps; the scheduler skips them
    pub allow_orphans: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStep {
    pub definition: StepDefinition,
    /// Loop whose body contains this step
    pub loop_owner: Option<NodeIndex>,
}

#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    graph: Graph<CompiledStep, EdgeKind>,
    indices: HashMap<String, NodeIndex>,
    entry: NodeIndex,
    orphans: Vec<NodeIndex>,
    loop_bodies: HashMap<NodeIndex, Vec<NodeIndex>>,
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

impl WorkflowGraph {
    /// Compile in strict mode, rejecting orphan steps
    pub fn compile(steps: &[StepDefinition]) -> Result<Self> {
        Self::compile_with(steps, CompileOptions::default())
    }

    pub fn compile_with(steps: &[StepDefinition], options: CompileOptions) -> Result<Self> {
        let mut graph = Graph::new();
        let mut indices = HashMap::new();

        for step in steps {
            if indices.contains_key(&step.id) {
                return Err(CompileError::DuplicateStep {
                    step: step.id.clone(),
                });
            }
            let index = graph.add_node(CompiledStep {
                definition: step.clone(),
                loop_owner: None,
            });
            indices.insert(step.id.clone(), index);
        }

        for step in steps {
            check_step_config(step)?;
        }

        for step in steps {
            for (field, target) in step.references() {
                if !indices.contains_key(target) {
                    return Err(CompileError::DanglingReference {
                        step: step.id.clone(),
                        field: field.to_string(),
                        target: target.to_string(),
                    });
                }
            }
        }

        let starts: Vec<&StepDefinition> =
            steps.iter().filter(|s| s.kind == StepKind::Start).collect();
        let entry = match starts.as_slice() {
            [] => return Err(CompileError::MissingStart),
            [start] => {
                if !start.depends_on.is_empty() {
                    return Err(CompileError::StartHasDependencies {
                        step: start.id.clone(),
                    });
                }
                indices[&start.id]
            }
            many => {
                return Err(CompileError::MultipleStart {
                    steps: many.iter().map(|s| s.id.clone()).collect(),
                })
            }
        };

        add_edges(&mut graph, &indices, steps);

        let mut compiled = Self {
            graph,
            indices,
            entry,
            orphans: Vec::new(),
            loop_bodies: HashMap::new(),
        };

        let reachable = compiled.reachable_from(entry);
        let end_reachable = reachable
            .iter()
            .any(|&index| compiled.graph[index].definition.kind == StepKind::End);
        if !end_reachable {
            return Err(CompileError::MissingEnd {
                start: compiled.id_of(entry).to_string(),
            });
        }

        compiled.detect_cycles()?;

        let orphans: Vec<NodeIndex> = compiled
            .graph
            .node_indices()
            .filter(|index| !reachable.contains(index))
            .collect();
        if !orphans.is_empty() {
            let names: Vec<String> = orphans
                .iter()
                .map(|&i| compiled.id_of(i).to_string())
                .collect();
            if !options.allow_orphans {
                return Err(CompileError::OrphanSteps { steps: names });
            }
            warn!("Compiling with unreachable steps that will be skipped: {:?}", names);
            compiled.orphans = orphans;
        }

        compiled.resolve_loop_bodies()?;

        debug!(
            "Compiled workflow graph: {} steps, {} edges",
            compiled.graph.node_count(),
            compiled.graph.edge_count()
        );

        Ok(compiled)
    }

    pub fn entry(&self) -> NodeIndex {
        self.entry
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn step(&self, index: NodeIndex) -> &CompiledStep {
        &self.graph[index]
    }

    pub fn definition(&self, index: NodeIndex) -> &StepDefinition {
        &self.graph[index].definition
    }

    pub fn kind(&self, index: NodeIndex) -> StepKind {
        self.graph[index].definition.kind
    }

    pub fn id_of(&self, index: NodeIndex) -> &str {
        &self.graph[index].definition.id
    }

    pub fn index_of(&self, id: &str) -> Option<NodeIndex> {
        self.indices.get(id).copied()
    }

    pub fn orphans(&self) -> &[NodeIndex] {
        &self.orphans
    }

    pub fn is_orphan(&self, index: NodeIndex) -> bool {
        self.orphans.contains(&index)
    }

    /// Incoming edges as `(source, tag)` in source order
    pub fn incoming(&self, index: NodeIndex) -> Vec<(NodeIndex, EdgeKind)> {
        let mut edges: Vec<(NodeIndex, EdgeKind)> = self
            .graph
            .edges_directed(index, Direction::Incoming)
            .map(|e| (e.source(), *e.weight()))
            .collect();
        edges.sort();
        edges
    }

    /// Outgoing edges as `(target, tag)` in target order
    pub fn outgoing(&self, index: NodeIndex) -> Vec<(NodeIndex, EdgeKind)> {
        let mut edges: Vec<(NodeIndex, EdgeKind)> = self
            .graph
            .edges_directed(index, Direction::Outgoing)
            .map(|e| (e.target(), *e.weight()))
            .collect();
        edges.sort();
        edges
    }

    /// Steps guarded by an error handler
    pub fn guarded_steps(&self, handler: NodeIndex) -> Vec<NodeIndex> {
        self.incoming(handler)
            .into_iter()
            .filter(|(_, kind)| *kind == EdgeKind::ErrorCatch)
            .map(|(source, _)| source)
            .collect()
    }

    /// Error handlers guarding a step, in declaration order
    pub fn handlers_for(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.outgoing(index)
            .into_iter()
            .filter(|(_, kind)| *kind == EdgeKind::ErrorCatch)
            .map(|(target, _)| target)
            .collect()
    }

    /// Steps making up a loop's body, in declaration order
    pub fn loop_body(&self, loop_step: NodeIndex) -> &[NodeIndex] {
        self.loop_bodies
            .get(&loop_step)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn loop_owner(&self, index: NodeIndex) -> Option<NodeIndex> {
        self.graph[index].loop_owner
    }

    /// Every edge as `(from, to, tag)`, sorted for stable comparison
    pub fn edges(&self) -> Vec<(String, String, EdgeKind)> {
        let mut edges: Vec<(String, String, EdgeKind)> = self
            .graph
            .edge_references()
            .map(|e| {
                (
                    self.id_of(e.source()).to_string(),
                    self.id_of(e.target()).to_string(),
                    *e.weight(),
                )
            })
            .collect();
        edges.sort();
        edges
    }

    /// Forward adjacency keyed by step id
    pub fn adjacency(&self) -> BTreeMap<String, Vec<String>> {
        self.adjacency_in(Direction::Outgoing)
    }

    /// Reverse adjacency keyed by step id, used for dependency counting
    pub fn reverse_adjacency(&self) -> BTreeMap<String, Vec<String>> {
        self.adjacency_in(Direction::Incoming)
    }

    fn adjacency_in(&self, direction: Direction) -> BTreeMap<String, Vec<String>> {
        self.graph
            .node_indices()
            .map(|index| {
                let mut neighbors: Vec<String> = self
                    .graph
                    .neighbors_directed(index, direction)
                    .map(|n| self.id_of(n).to_string())
                    .collect();
                neighbors.sort();
                neighbors.dedup();
                (self.id_of(index).to_string(), neighbors)
            })
            .collect()
    }

    /// A topological order of step ids; valid because compilation rejected cycles
    pub fn execution_order(&self) -> Vec<String> {
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|i| self.id_of(i).to_string()).collect())
            .unwrap_or_default()
    }

    fn reachable_from(&self, start: NodeIndex) -> HashSet<NodeIndex> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(start);
        queue.push_back(start);

        while let Some(current) = queue.pop_front() {
            for neighbor in self.graph.neighbors_directed(current, Direction::Outgoing) {
                if visited.insert(neighbor) {
                    queue.push_back(neighbor);
                }
            }
        }

        visited
    }

    /// White/gray/black DFS; a back-edge to a gray node closes a cycle
    fn detect_cycles(&self) -> Result<()> {
        let mut colors = vec![Color::White; self.graph.node_count()];
        let mut path: Vec<NodeIndex> = Vec::new();

        for root in self.graph.node_indices() {
            if colors[root.index()] != Color::White {
                continue;
            }

            // Explicit stack of (node, sorted successors, next successor position)
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> = Vec::new();
            colors[root.index()] = Color::Gray;
            path.push(root);
            stack.push((root, self.successors(root), 0));

            while let Some((node, successors, next)) = stack.last_mut() {
                if let Some(&successor) = successors.get(*next) {
                    *next += 1;
                    match colors[successor.index()] {
                        Color::White => {
                            colors[successor.index()] = Color::Gray;
                            path.push(successor);
                            let succ = self.successors(successor);
                            stack.push((successor, succ, 0));
                        }
                        Color::Gray => {
                            let from = path.iter().position(|&n| n == successor).unwrap_or(0);
                            let mut cycle: Vec<String> = path[from..]
                                .iter()
                                .map(|&n| self.id_of(n).to_string())
                                .collect();
                            cycle.push(self.id_of(successor).to_string());
                            return Err(CompileError::Cycle { path: cycle });
                        }
                        Color::Black => {}
                    }
                } else {
                    colors[node.index()] = Color::Black;
                    path.pop();
                    stack.pop();
                }
            }
        }

        Ok(())
    }

    fn successors(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut successors: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        successors.sort();
        successors.dedup();
        successors
    }

    fn resolve_loop_bodies(&mut self) -> Result<()> {
        let loops: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&i| self.kind(i) == StepKind::Loop)
            .collect();

        for loop_step in loops {
            let loop_id = self.id_of(loop_step).to_string();
            let invalid = |step: &str, reason: &str| CompileError::InvalidLoopBody {
                loop_step: loop_id.clone(),
                step: step.to_string(),
                reason: reason.to_string(),
            };

            let body_start = self
                .outgoing(loop_step)
                .into_iter()
                .find(|(_, kind)| *kind == EdgeKind::LoopBody)
                .map(|(target, _)| target)
                .ok_or_else(|| invalid(&loop_id, "loop has no body step"))?;

            let mut members = HashSet::new();
            let mut queue = VecDeque::new();
            members.insert(body_start);
            queue.push_back(body_start);
            while let Some(current) = queue.pop_front() {
                for (next, kind) in self.outgoing(current) {
                    if kind != EdgeKind::ErrorCatch && members.insert(next) {
                        queue.push_back(next);
                    }
                }
            }

            let mut body: Vec<NodeIndex> = members.iter().copied().collect();
            body.sort();

            for &member in &body {
                let member_id = self.id_of(member).to_string();
                match self.kind(member) {
                    StepKind::Start | StepKind::End => {
                        return Err(invalid(&member_id, "Start and End cannot be inside a loop body"))
                    }
                    StepKind::Loop => return Err(invalid(&member_id, "loops cannot be nested")),
                    _ => {}
                }

                for (source, kind) in self.incoming(member) {
                    let allowed = (source == loop_step && kind == EdgeKind::LoopBody)
                        || members.contains(&source);
                    if !allowed {
                        return Err(invalid(
                            &member_id,
                            &format!(
                                "body steps may only depend on the loop or other body steps, found '{}'",
                                self.id_of(source)
                            ),
                        ));
                    }
                }

                if self.handlers_for(member).into_iter().next().is_some() {
                    return Err(invalid(
                        &member_id,
                        "error handlers cannot guard loop body steps; guard the loop instead",
                    ));
                }
            }

            for &member in &body {
                self.graph[member].loop_owner = Some(loop_step);
            }
            self.loop_bodies.insert(loop_step, body);
        }

        Ok(())
    }
}

/// Kind-specific configuration checks
fn check_step_config(step: &StepDefinition) -> Result<()> {
    let invalid = |reason: &str| CompileError::InvalidStep {
        step: step.id.clone(),
        reason: reason.to_string(),
    };

    if step.kind != StepKind::Condition
        && (step.condition.is_some() || step.true_branch.is_some() || step.false_branch.is_some())
    {
        return Err(invalid("condition and branches are only valid on Condition steps"));
    }
    if step.kind != StepKind::Loop && step.loop_config.is_some() {
        return Err(invalid("loopConfig is only valid on Loop steps"));
    }
    if step.kind != StepKind::ErrorHandler && step.error_config.is_some() {
        return Err(invalid("errorConfig is only valid on ErrorHandler steps"));
    }

    match step.kind {
        StepKind::Condition => {
            let condition = step.condition.as_deref().unwrap_or("");
            if condition.trim().is_empty() {
                return Err(invalid("Condition step requires a condition expression"));
            }
            if step.true_branch.is_some() && step.true_branch == step.false_branch {
                return Err(invalid("trueBranch and falseBranch must be different steps"));
            }
        }
        StepKind::Loop => {
            let loop_config = step
                .loop_config
                .as_ref()
                .ok_or_else(|| invalid("Loop step requires loopConfig"))?;
            if loop_config.collection_expr.trim().is_empty() {
                return Err(invalid("loopConfig.collectionExpr cannot be empty"));
            }
            if loop_config.max_iterations == 0 {
                return Err(invalid("loopConfig.maxIterations must be greater than 0"));
            }
            if loop_config.body == step.id {
                return Err(invalid("a loop cannot be its own body"));
            }
        }
        StepKind::ErrorHandler => {
            if step.error_config.is_none() {
                return Err(invalid("ErrorHandler step requires errorConfig"));
            }
            if step.depends_on.is_empty() {
                return Err(invalid(
                    "ErrorHandler step must list the steps it guards in dependsOn",
                ));
            }
        }
        _ => {}
    }

    if let Some(policy) = &step.retry_policy {
        if policy.backoff_multiplier < 1.0 {
            return Err(invalid("retryPolicy.backoffMultiplier must be at least 1.0"));
        }
        if policy.max_delay < policy.initial_delay {
            return Err(invalid(
                "retryPolicy.maxDelay must not be shorter than initialDelay",
            ));
        }
    }

    Ok(())
}

/// Resolve every declaration into a single tagged edge per (source, target)
fn add_edges(
    graph: &mut Graph<CompiledStep, EdgeKind>,
    indices: &HashMap<String, NodeIndex>,
    steps: &[StepDefinition],
) {
    let mut seen: HashSet<(NodeIndex, NodeIndex)> = HashSet::new();
    let mut add = |graph: &mut Graph<CompiledStep, EdgeKind>,
                   from: NodeIndex,
                   to: NodeIndex,
                   kind: EdgeKind|
     -> Option<EdgeIndex> {
        seen.insert((from, to))
            .then(|| graph.add_edge(from, to, kind))
    };

    for step in steps {
        let source = indices[&step.id];
        match step.kind {
            StepKind::Condition => {
                if let Some(target) = &step.true_branch {
                    add(graph, source, indices[target], EdgeKind::BranchTrue);
                }
                if let Some(target) = &step.false_branch {
                    add(graph, source, indices[target], EdgeKind::BranchFalse);
                }
            }
            StepKind::Loop => {
                if let Some(loop_config) = &step.loop_config {
                    add(graph, source, indices[&loop_config.body], EdgeKind::LoopBody);
                }
            }
            _ => {}
        }
    }

    for step in steps {
        let target = indices[&step.id];
        for dependency in &step.depends_on {
            let source = indices[dependency];
            let kind = if step.kind == StepKind::ErrorHandler {
                EdgeKind::ErrorCatch
            } else if graph[source].definition.kind == StepKind::Loop {
                EdgeKind::LoopExit
            } else {
                EdgeKind::Dependency
            };
            add(graph, source, target, kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{ErrorConfig, LoopConfig, RecoveryAction};

    fn step(id: &str, kind: StepKind, deps: &[&str]) -> StepDefinition {
        let mut step = StepDefinition::new(id, kind);
        step.depends_on = deps.iter().map(|d| d.to_string()).collect();
        step
    }

    fn linear() -> Vec<StepDefinition> {
        vec![
            step("start", StepKind::Start, &[]),
            step("agent", StepKind::Agent, &["start"]),
            step("end", StepKind::End, &["agent"]),
        ]
    }

    #[test]
    fn test_compile_linear_graph() {
        let graph = WorkflowGraph::compile(&linear()).unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.id_of(graph.entry()), "start");
        assert_eq!(graph.execution_order(), vec!["start", "agent", "end"]);
        assert_eq!(
            graph.edges(),
            vec![
                ("agent".to_string(), "end".to_string(), EdgeKind::Dependency),
                ("start".to_string(), "agent".to_string(), EdgeKind::Dependency),
            ]
        );
        assert_eq!(graph.reverse_adjacency()["end"], vec!["agent"]);
    }

    #[test]
    fn test_duplicate_rejected_before_anything_else() {
        let mut steps = linear();
        steps.push(step("agent", StepKind::Action, &["missing"]));
        assert_eq!(
            WorkflowGraph::compile(&steps).unwrap_err(),
            CompileError::DuplicateStep {
                step: "agent".to_string()
            }
        );
    }

    #[test]
    fn test_dangling_reference() {
        let mut steps = linear();
        steps[2].depends_on.push("ghost".to_string());
        assert!(matches!(
            WorkflowGraph::compile(&steps),
            Err(CompileError::DanglingReference { target, .. }) if target == "ghost"
        ));
    }

    #[test]
    fn test_start_rules() {
        let steps = vec![step("a", StepKind::Agent, &[]), step("end", StepKind::End, &["a"])];
        assert_eq!(
            WorkflowGraph::compile(&steps).unwrap_err(),
            CompileError::MissingStart
        );

        let mut steps = linear();
        steps.push(step("start2", StepKind::Start, &[]));
        assert!(matches!(
            WorkflowGraph::compile(&steps),
            Err(CompileError::MultipleStart { .. })
        ));

        let mut steps = linear();
        steps[0].depends_on.push("agent".to_string());
        assert!(matches!(
            WorkflowGraph::compile(&steps),
            Err(CompileError::StartHasDependencies { .. })
        ));
    }

    #[test]
    fn test_end_must_be_reachable() {
        let steps = vec![
            step("start", StepKind::Start, &[]),
            step("agent", StepKind::Agent, &["start"]),
            step("end", StepKind::End, &[]),
        ];
        assert!(matches!(
            WorkflowGraph::compile(&steps),
            Err(CompileError::MissingEnd { .. })
        ));
    }

    #[test]
    fn test_cycle_names_both_steps() {
        let steps = vec![
            step("start", StepKind::Start, &[]),
            step("a", StepKind::Agent, &["start", "b"]),
            step("b", StepKind::Agent, &["a"]),
            step("end", StepKind::End, &["start"]),
        ];
        match WorkflowGraph::compile(&steps).unwrap_err() {
            CompileError::Cycle { path } => {
                assert!(path.contains(&"a".to_string()));
                assert!(path.contains(&"b".to_string()));
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_orphans_strict_and_lenient() {
        let mut steps = linear();
        steps.push(step("lonely", StepKind::Action, &[]));

        assert_eq!(
            WorkflowGraph::compile(&steps).unwrap_err(),
            CompileError::OrphanSteps {
                steps: vec!["lonely".to_string()]
            }
        );

        let graph =
            WorkflowGraph::compile_with(&steps, CompileOptions { allow_orphans: true }).unwrap();
        let lonely = graph.index_of("lonely").unwrap();
        assert!(graph.is_orphan(lonely));
    }

    #[test]
    fn test_condition_branches_become_tagged_edges() {
        let mut check = step("check", StepKind::Condition, &["start"]);
        check.condition = Some("{{ $json.ok }}".to_string());
        check.true_branch = Some("yes".to_string());
        check.false_branch = Some("no".to_string());
        let steps = vec![
            step("start", StepKind::Start, &[]),
            check,
            step("yes", StepKind::Action, &["check"]),
            step("no", StepKind::Action, &[]),
            step("end", StepKind::End, &["yes", "no"]),
        ];

        let graph = WorkflowGraph::compile(&steps).unwrap();
        let check = graph.index_of("check").unwrap();
        let tags: Vec<EdgeKind> = graph.outgoing(check).into_iter().map(|(_, k)| k).collect();
        assert_eq!(tags, vec![EdgeKind::BranchTrue, EdgeKind::BranchFalse]);
    }

    #[test]
    fn test_condition_requires_expression() {
        let steps = vec![
            step("start", StepKind::Start, &[]),
            step("check", StepKind::Condition, &["start"]),
            step("end", StepKind::End, &["check"]),
        ];
        assert!(matches!(
            WorkflowGraph::compile(&steps),
            Err(CompileError::InvalidStep { step, .. }) if step == "check"
        ));
    }

    #[test]
    fn test_loop_body_resolution() {
        let mut each = step("each", StepKind::Loop, &["start"]);
        each.loop_config = Some(LoopConfig {
            collection_expr: "{{ $json.items }}".to_string(),
            max_iterations: 10,
            body: "double".to_string(),
        });
        let steps = vec![
            step("start", StepKind::Start, &[]),
            each,
            step("double", StepKind::Action, &["each"]),
            step("tidy", StepKind::Action, &["double"]),
            step("end", StepKind::End, &["each"]),
        ];

        let graph = WorkflowGraph::compile(&steps).unwrap();
        let each = graph.index_of("each").unwrap();
        let body: Vec<&str> = graph.loop_body(each).iter().map(|&i| graph.id_of(i)).collect();
        assert_eq!(body, vec!["double", "tidy"]);
        assert_eq!(
            graph.loop_owner(graph.index_of("tidy").unwrap()),
            Some(each)
        );
        let end = graph.index_of("end").unwrap();
        assert_eq!(graph.incoming(end), vec![(each, EdgeKind::LoopExit)]);
    }

    #[test]
    fn test_loop_body_cannot_reach_end() {
        let mut each = step("each", StepKind::Loop, &["start"]);
        each.loop_config = Some(LoopConfig {
            collection_expr: "{{ $json.items }}".to_string(),
            max_iterations: 10,
            body: "double".to_string(),
        });
        let steps = vec![
            step("start", StepKind::Start, &[]),
            each,
            step("double", StepKind::Action, &[]),
            step("end", StepKind::End, &["double"]),
        ];
        assert!(matches!(
            WorkflowGraph::compile(&steps),
            Err(CompileError::InvalidLoopBody { .. })
        ));
    }

    #[test]
    fn test_error_handler_edges() {
        let mut handler = step("recover", StepKind::ErrorHandler, &["agent"]);
        handler.error_config = Some(ErrorConfig {
            error_type_filter: vec![],
            recovery_action: RecoveryAction::Continue,
            fallback_value: None,
        });
        let mut steps = linear();
        steps.push(handler);

        let graph = WorkflowGraph::compile(&steps).unwrap();
        let agent = graph.index_of("agent").unwrap();
        let recover = graph.index_of("recover").unwrap();
        assert_eq!(graph.handlers_for(agent), vec![recover]);
        assert_eq!(graph.guarded_steps(recover), vec![agent]);
    }

    #[test]
    fn test_compile_is_idempotent() {
        let first = WorkflowGraph::compile(&linear()).unwrap();
        let second = WorkflowGraph::compile(&linear()).unwrap();
        assert_eq!(first.edges(), second.edges());
        assert_eq!(first.adjacency(), second.adjacency());
        assert_eq!(first.entry(), second.entry());
    }
}
