//! Stage graph: registration with cycle detection, deterministic runnable
//! ordering, status transitions, and skip propagation.
//!
//! Predecessors may be named before they are registered. Edges are added as
//! soon as both ends exist, and every registration re-runs
//! `petgraph::algo::toposort` over the candidate graph, so a registration
//! that would close a cycle is rejected and nothing is committed.
//! `validate` rejects graphs that still have dangling predecessor names.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use chrono::Utc;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde_json::Value;
use stagecraft_types::budget::Usage;
use stagecraft_types::error::TaskError;
use stagecraft_types::stage::{InputTransform, StageDescriptor, StageState, StageStatus};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("registering stage '{stage}' would create a cycle through '{via}'")]
    Cycle { stage: String, via: String },

    #[error("duplicate stage name '{0}'")]
    DuplicateName(String),

    #[error("stage '{stage}' depends on unknown stage '{predecessor}'")]
    UnknownPredecessor { stage: String, predecessor: String },

    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    #[error("stage '{stage}' forwards output of '{forwarded}', which is not a predecessor")]
    ForwardNotPredecessor { stage: String, forwarded: String },

    #[error("stage '{0}' retry.max_attempts must be >= 1")]
    ZeroAttempts(String),

    #[error("stage '{stage}' cannot move from {from} to {to}")]
    InvalidTransition {
        stage: String,
        from: StageStatus,
        to: StageStatus,
    },

    #[error("stage '{stage}' is waiting on predecessor '{predecessor}'")]
    PredecessorIncomplete { stage: String, predecessor: String },
}

/// Terminal outcome reported for a running stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Completed { output: Value, attempts: u32 },
    Failed { error: TaskError, attempts: u32 },
    Cancelled { attempts: u32 },
}

impl StageOutcome {
    fn status(&self) -> StageStatus {
        match self {
            StageOutcome::Completed { .. } => StageStatus::Completed,
            StageOutcome::Failed { .. } => StageStatus::Failed,
            StageOutcome::Cancelled { .. } => StageStatus::Cancelled,
        }
    }
}

// ---------------------------------------------------------------------------
// StageGraph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct StageGraph {
    /// Registration order.
    stages: Vec<StageState>,
    index: HashMap<String, usize>,
    /// Topological order, ties broken by registration index.
    order: Vec<usize>,
}

impl StageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every descriptor in order, then check that no predecessor
    /// name is left dangling.
    pub fn from_descriptors<I>(descriptors: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = StageDescriptor>,
    {
        let mut graph = Self::new();
        for descriptor in descriptors {
            graph.register(descriptor)?;
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Add a stage. Fails with `DuplicateName` or `Cycle`; on failure the
    /// graph is unchanged.
    pub fn register(&mut self, descriptor: StageDescriptor) -> Result<(), GraphError> {
        if self.index.contains_key(&descriptor.name) {
            return Err(GraphError::DuplicateName(descriptor.name));
        }
        if descriptor.predecessors.contains(&descriptor.name) {
            return Err(GraphError::Cycle {
                via: descriptor.name.clone(),
                stage: descriptor.name,
            });
        }

        let mut candidate: Vec<&StageDescriptor> =
            self.stages.iter().map(|s| &s.descriptor).collect();
        candidate.push(&descriptor);
        let order = topological_order(&candidate).map_err(|via| GraphError::Cycle {
            stage: descriptor.name.clone(),
            via,
        })?;

        let idx = self.stages.len();
        self.index.insert(descriptor.name.clone(), idx);
        self.stages.push(StageState::new(descriptor));
        self.order = order;
        Ok(())
    }

    /// Every predecessor name must resolve to a registered stage, a
    /// `forward` input must name one of the stage's predecessors, and a
    /// retry override must allow at least one attempt.
    pub fn validate(&self) -> Result<(), GraphError> {
        for stage in &self.stages {
            let d = &stage.descriptor;
            for pred in &d.predecessors {
                if !self.index.contains_key(pred) {
                    return Err(GraphError::UnknownPredecessor {
                        stage: d.name.clone(),
                        predecessor: pred.clone(),
                    });
                }
            }
            if let InputTransform::Forward { stage: from } = &d.input
                && !d.predecessors.contains(from)
            {
                return Err(GraphError::ForwardNotPredecessor {
                    stage: d.name.clone(),
                    forwarded: from.clone(),
                });
            }
            if d.retry.as_ref().is_some_and(|r| r.max_attempts == 0) {
                return Err(GraphError::ZeroAttempts(d.name.clone()));
            }
        }
        Ok(())
    }

    /// Rebuild from a persisted snapshot, keeping every recorded status.
    pub fn restore(states: Vec<StageState>) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for state in &states {
            graph.register(state.descriptor.clone())?;
        }
        graph.validate()?;
        graph.stages = states;
        Ok(graph)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, name: &str) -> Option<&StageState> {
        self.index.get(name).map(|&i| &self.stages[i])
    }

    /// Stages in registration order.
    pub fn stages(&self) -> &[StageState] {
        &self.stages
    }

    pub fn snapshot(&self) -> Vec<StageState> {
        self.stages.clone()
    }

    pub fn topological_order(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&i| self.stages[i].descriptor.name.as_str())
            .collect()
    }

    /// Pending stages whose predecessors have all completed, in topological
    /// order with registration order breaking ties.
    pub fn runnable_stages(&self) -> Vec<String> {
        self.order
            .iter()
            .map(|&i| &self.stages[i])
            .filter(|s| s.status == StageStatus::Pending && self.predecessors_completed(s))
            .map(|s| s.descriptor.name.clone())
            .collect()
    }

    /// No stage is pending, runnable or running.
    pub fn is_terminal(&self) -> bool {
        self.stages.iter().all(|s| s.status.is_terminal())
    }

    pub fn count(&self, status: StageStatus) -> usize {
        self.stages.iter().filter(|s| s.status == status).count()
    }

    /// Input for `name` according to its transform.
    pub fn input_for(&self, name: &str, run_input: &Value) -> Result<Value, GraphError> {
        let stage = self.get(name)?;
        let d = &stage.descriptor;
        let value = match &d.input {
            InputTransform::RunInput => run_input.clone(),
            InputTransform::Constant { value } => value.clone(),
            InputTransform::Forward { stage: from } => self
                .get(from)?
                .output
                .clone()
                .unwrap_or(Value::Null),
            InputTransform::Merge if d.predecessors.is_empty() => run_input.clone(),
            InputTransform::Merge => {
                let mut merged = serde_json::Map::new();
                for pred in &d.predecessors {
                    let output = self.get(pred)?.output.clone().unwrap_or(Value::Null);
                    merged.insert(pred.clone(), output);
                }
                Value::Object(merged)
            }
        };
        Ok(value)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// `pending -> runnable`: the stage has been admitted and holds `reserved`.
    pub fn admit(&mut self, name: &str, reserved: Usage) -> Result<(), GraphError> {
        let idx = self.idx(name)?;
        self.expect_status(idx, StageStatus::Pending, StageStatus::Runnable)?;
        if let Some(pred) = self.first_incomplete_predecessor(&self.stages[idx]) {
            return Err(GraphError::PredecessorIncomplete {
                stage: name.to_string(),
                predecessor: pred,
            });
        }
        let stage = &mut self.stages[idx];
        stage.status = StageStatus::Runnable;
        stage.queued_at = Some(Utc::now());
        stage.reserved = reserved;
        Ok(())
    }

    /// `runnable -> running`.
    pub fn mark_running(&mut self, name: &str) -> Result<(), GraphError> {
        let idx = self.idx(name)?;
        self.expect_status(idx, StageStatus::Runnable, StageStatus::Running)?;
        let stage = &mut self.stages[idx];
        stage.status = StageStatus::Running;
        stage.started_at = Some(Utc::now());
        Ok(())
    }

    /// Record a terminal outcome for an admitted stage. Failed and cancelled
    /// outcomes cascade `skipped` to every pending descendant.
    ///
    /// Returns the names of the stages skipped as a result.
    pub fn mark(&mut self, name: &str, outcome: StageOutcome) -> Result<Vec<String>, GraphError> {
        let idx = self.idx(name)?;
        let to = outcome.status();
        let from = self.stages[idx].status;
        if !from.is_active() {
            return Err(GraphError::InvalidTransition {
                stage: name.to_string(),
                from,
                to,
            });
        }

        let stage = &mut self.stages[idx];
        stage.status = to;
        stage.finished_at = Some(Utc::now());
        match outcome {
            StageOutcome::Completed { output, attempts } => {
                stage.output = Some(output);
                stage.attempts = attempts;
                return Ok(Vec::new());
            }
            StageOutcome::Failed { error, attempts } => {
                stage.error = Some(error);
                stage.attempts = attempts;
            }
            StageOutcome::Cancelled { attempts } => {
                stage.error = Some(TaskError::cancelled());
                stage.attempts = attempts;
            }
        }
        Ok(self.cascade_skip(name))
    }

    /// Release the reservation of a finished stage and record what it consumed.
    pub fn settle(&mut self, name: &str, usage: Usage) -> Result<Usage, GraphError> {
        let idx = self.idx(name)?;
        let stage = &mut self.stages[idx];
        stage.usage = usage;
        Ok(std::mem::take(&mut stage.reserved))
    }

    /// Skip every pending stage, recording `reason` as the cause.
    pub fn skip_pending(&mut self, reason: &str) -> Vec<String> {
        let now = Utc::now();
        let mut skipped = Vec::new();
        for stage in &mut self.stages {
            if stage.status == StageStatus::Pending {
                stage.status = StageStatus::Skipped;
                stage.skipped_because = Some(reason.to_string());
                stage.finished_at = Some(now);
                skipped.push(stage.descriptor.name.clone());
            }
        }
        skipped
    }

    /// Resume support: stages that were admitted or running when the record
    /// was written go back to `pending`. Returns their reservations so the
    /// caller can refund them.
    pub fn rewind_in_flight(&mut self) -> Vec<(String, Usage)> {
        let mut refunds = Vec::new();
        for stage in &mut self.stages {
            if stage.status.is_active() {
                stage.status = StageStatus::Pending;
                stage.queued_at = None;
                stage.started_at = None;
                refunds.push((
                    stage.descriptor.name.clone(),
                    std::mem::take(&mut stage.reserved),
                ));
            }
        }
        refunds
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn idx(&self, name: &str) -> Result<usize, GraphError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownStage(name.to_string()))
    }

    fn get(&self, name: &str) -> Result<&StageState, GraphError> {
        self.idx(name).map(|i| &self.stages[i])
    }

    fn expect_status(
        &self,
        idx: usize,
        expected: StageStatus,
        to: StageStatus,
    ) -> Result<(), GraphError> {
        let from = self.stages[idx].status;
        if from != expected {
            return Err(GraphError::InvalidTransition {
                stage: self.stages[idx].descriptor.name.clone(),
                from,
                to,
            });
        }
        Ok(())
    }

    fn predecessors_completed(&self, stage: &StageState) -> bool {
        self.first_incomplete_predecessor(stage).is_none()
    }

    fn first_incomplete_predecessor(&self, stage: &StageState) -> Option<String> {
        stage
            .descriptor
            .predecessors
            .iter()
            .find(|p| {
                self.index
                    .get(p.as_str())
                    .is_none_or(|&i| self.stages[i].status != StageStatus::Completed)
            })
            .cloned()
    }

    fn cascade_skip(&mut self, root: &str) -> Vec<String> {
        let now = Utc::now();
        let mut skipped = Vec::new();
        let mut queue = VecDeque::from([root.to_string()]);
        while let Some(current) = queue.pop_front() {
            for stage in &mut self.stages {
                if stage.status == StageStatus::Pending
                    && stage.descriptor.predecessors.contains(&current)
                {
                    stage.status = StageStatus::Skipped;
                    stage.skipped_because = Some(root.to_string());
                    stage.finished_at = Some(now);
                    skipped.push(stage.descriptor.name.clone());
                    queue.push_back(stage.descriptor.name.clone());
                }
            }
        }
        if !skipped.is_empty() {
            tracing::debug!(stage = root, skipped = ?skipped, "skip propagated to dependents");
        }
        skipped
    }
}

/// Topological order over the resolved edges, ties broken by index.
///
/// Cycle detection runs through `petgraph::algo::toposort`; on a cycle the
/// name of a stage on it is returned.
fn topological_order(descriptors: &[&StageDescriptor]) -> Result<Vec<usize>, String> {
    let id_to_idx: HashMap<&str, usize> = descriptors
        .iter()
        .enumerate()
        .map(|(i, d)| (d.name.as_str(), i))
        .collect();

    // Edge from predecessor -> dependent
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: Vec<_> = descriptors
        .iter()
        .map(|d| graph.add_node(d.name.as_str()))
        .collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); descriptors.len()];
    let mut in_degree = vec![0usize; descriptors.len()];
    for (to, d) in descriptors.iter().enumerate() {
        for pred in &d.predecessors {
            if let Some(&from) = id_to_idx.get(pred.as_str()) {
                graph.add_edge(nodes[from], nodes[to], ());
                dependents[from].push(to);
                in_degree[to] += 1;
            }
        }
    }

    toposort(&graph, None).map_err(|cycle| graph[cycle.node_id()].to_string())?;

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(descriptors.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }
    Ok(order)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stagecraft_types::task::RetryPolicy;

    fn stage(name: &str, preds: &[&str]) -> StageDescriptor {
        StageDescriptor::new(name, "echo", preds)
    }

    fn graph(stages: &[(&str, &[&str])]) -> StageGraph {
        StageGraph::from_descriptors(stages.iter().map(|(n, p)| stage(n, p))).unwrap()
    }

    fn complete(g: &mut StageGraph, name: &str) {
        g.admit(name, Usage::new()).unwrap();
        g.mark_running(name).unwrap();
        g.mark(
            name,
            StageOutcome::Completed {
                output: json!(name),
                attempts: 1,
            },
        )
        .unwrap();
    }

    fn fail(g: &mut StageGraph, name: &str) -> Vec<String> {
        g.admit(name, Usage::new()).unwrap();
        g.mark_running(name).unwrap();
        g.mark(
            name,
            StageOutcome::Failed {
                error: TaskError::permanent("boom"),
                attempts: 1,
            },
        )
        .unwrap()
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    #[test]
    fn test_duplicate_name_rejected() {
        let mut g = StageGraph::new();
        g.register(stage("a", &[])).unwrap();
        let err = g.register(stage("a", &[])).unwrap_err();
        assert_eq!(err, GraphError::DuplicateName("a".to_string()));
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let mut g = StageGraph::new();
        let err = g.register(stage("a", &["a"])).unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
        assert!(g.is_empty());
    }

    #[test]
    fn test_forward_reference_closing_cycle_rejected_without_partial_commit() {
        let mut g = StageGraph::new();
        g.register(stage("a", &["c"])).unwrap();
        g.register(stage("b", &["a"])).unwrap();
        let before = g.topological_order().join(",");

        let err = g.register(stage("c", &["b"])).unwrap_err();
        assert!(matches!(err, GraphError::Cycle { ref stage, .. } if stage == "c"));
        assert_eq!(g.len(), 2);
        assert!(g.stage("c").is_none());
        assert_eq!(g.topological_order().join(","), before);
    }

    #[test]
    fn test_dangling_predecessor_fails_validation() {
        let mut g = StageGraph::new();
        g.register(stage("a", &["ghost"])).unwrap();
        assert_eq!(
            g.validate().unwrap_err(),
            GraphError::UnknownPredecessor {
                stage: "a".to_string(),
                predecessor: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn test_forward_from_non_predecessor_fails_validation() {
        let mut b = stage("b", &[]);
        b.input = InputTransform::Forward {
            stage: "a".to_string(),
        };
        let g = StageGraph::from_descriptors([stage("a", &[]), b]);
        assert_eq!(
            g.unwrap_err(),
            GraphError::ForwardNotPredecessor {
                stage: "b".to_string(),
                forwarded: "a".to_string(),
            }
        );
    }

    #[test]
    fn test_zero_attempt_retry_fails_validation() {
        let mut a = stage("a", &[]);
        a.retry = Some(RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        });
        assert_eq!(
            StageGraph::from_descriptors([a]).unwrap_err(),
            GraphError::ZeroAttempts("a".to_string())
        );
    }

    #[test]
    fn test_topological_order_breaks_ties_by_registration() {
        let g = graph(&[
            ("d", &["b", "c"]),
            ("c", &[]),
            ("b", &[]),
            ("a", &[]),
        ]);
        assert_eq!(g.topological_order(), vec!["c", "b", "d", "a"]);
    }

    // -----------------------------------------------------------------------
    // Runnable computation
    // -----------------------------------------------------------------------

    #[test]
    fn test_roots_runnable_immediately_in_registration_order() {
        let g = graph(&[("z", &[]), ("y", &["z"]), ("x", &[])]);
        assert_eq!(g.runnable_stages(), vec!["z", "x"]);
    }

    #[test]
    fn test_stage_runnable_only_after_all_predecessors_complete() {
        let mut g = graph(&[("a", &[]), ("b", &[]), ("c", &["a", "b"])]);
        complete(&mut g, "a");
        assert_eq!(g.runnable_stages(), vec!["b"]);
        complete(&mut g, "b");
        assert_eq!(g.runnable_stages(), vec!["c"]);
    }

    #[test]
    fn test_admit_refuses_incomplete_predecessors() {
        let mut g = graph(&[("a", &[]), ("b", &["a"])]);
        let err = g.admit("b", Usage::new()).unwrap_err();
        assert!(matches!(err, GraphError::PredecessorIncomplete { .. }));
        assert_eq!(g.stage("b").unwrap().status, StageStatus::Pending);
    }

    #[test]
    fn test_running_requires_admission() {
        let mut g = graph(&[("a", &[])]);
        let err = g.mark_running("a").unwrap_err();
        assert!(matches!(err, GraphError::InvalidTransition { .. }));
    }

    #[test]
    fn test_terminal_stage_cannot_be_marked_again() {
        let mut g = graph(&[("a", &[])]);
        complete(&mut g, "a");
        let err = g
            .mark("a", StageOutcome::Cancelled { attempts: 1 })
            .unwrap_err();
        assert!(matches!(
            err,
            GraphError::InvalidTransition {
                from: StageStatus::Completed,
                ..
            }
        ));
    }

    // -----------------------------------------------------------------------
    // Skip propagation
    // -----------------------------------------------------------------------

    #[test]
    fn test_transitive_skip() {
        let mut g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let skipped = fail(&mut g, "a");
        assert_eq!(skipped, vec!["b", "c"]);
        for name in ["b", "c"] {
            let s = g.stage(name).unwrap();
            assert_eq!(s.status, StageStatus::Skipped);
            assert_eq!(s.skipped_because.as_deref(), Some("a"));
        }
        assert!(g.is_terminal());
        assert!(g.runnable_stages().is_empty());
    }

    #[test]
    fn test_skip_leaves_independent_branch_runnable() {
        let mut g = graph(&[("a", &[]), ("b", &[]), ("c", &["a"]), ("d", &["b"])]);
        fail(&mut g, "a");
        assert_eq!(g.stage("c").unwrap().status, StageStatus::Skipped);
        assert_eq!(g.runnable_stages(), vec!["b"]);
        assert!(!g.is_terminal());
    }

    #[test]
    fn test_diamond_join_skipped_when_one_branch_fails() {
        let mut g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        complete(&mut g, "a");
        complete(&mut g, "b");
        fail(&mut g, "c");
        assert_eq!(g.stage("d").unwrap().status, StageStatus::Skipped);
        assert_eq!(g.stage("d").unwrap().skipped_because.as_deref(), Some("c"));
    }

    #[test]
    fn test_cancelled_stage_skips_dependents() {
        let mut g = graph(&[("a", &[]), ("b", &["a"])]);
        g.admit("a", Usage::new()).unwrap();
        g.mark_running("a").unwrap();
        let skipped = g.mark("a", StageOutcome::Cancelled { attempts: 1 }).unwrap();
        assert_eq!(skipped, vec!["b"]);
        assert_eq!(g.stage("a").unwrap().status, StageStatus::Cancelled);
    }

    #[test]
    fn test_skip_pending_only_touches_pending() {
        let mut g = graph(&[("a", &[]), ("b", &[]), ("c", &["a"])]);
        complete(&mut g, "a");
        g.admit("b", Usage::new()).unwrap();
        let skipped = g.skip_pending("run cancelled");
        assert_eq!(skipped, vec!["c"]);
        assert_eq!(g.stage("b").unwrap().status, StageStatus::Runnable);
        assert_eq!(g.stage("a").unwrap().status, StageStatus::Completed);
    }

    // -----------------------------------------------------------------------
    // Inputs
    // -----------------------------------------------------------------------

    #[test]
    fn test_input_transforms() {
        let mut fwd = stage("fwd", &["a"]);
        fwd.input = InputTransform::Forward {
            stage: "a".to_string(),
        };
        let mut constant = stage("k", &[]);
        constant.input = InputTransform::Constant { value: json!(42) };
        let mut raw = stage("raw", &["a"]);
        raw.input = InputTransform::RunInput;

        let mut g = StageGraph::from_descriptors(vec![
            stage("a", &[]),
            stage("b", &[]),
            stage("m", &["a", "b"]),
            fwd,
            constant,
            raw,
        ])
        .unwrap();
        let run_input = json!({"topic": "rust"});
        assert_eq!(g.input_for("a", &run_input).unwrap(), run_input);

        complete(&mut g, "a");
        complete(&mut g, "b");
        assert_eq!(g.input_for("m", &run_input).unwrap(), json!({"a": "a", "b": "b"}));
        assert_eq!(g.input_for("fwd", &run_input).unwrap(), json!("a"));
        assert_eq!(g.input_for("k", &run_input).unwrap(), json!(42));
        assert_eq!(g.input_for("raw", &run_input).unwrap(), run_input);
    }

    // -----------------------------------------------------------------------
    // Snapshot / restore
    // -----------------------------------------------------------------------

    #[test]
    fn test_restore_and_rewind_in_flight() {
        let mut g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"])]);
        complete(&mut g, "a");
        let reserved = Usage::from([(stagecraft_types::budget::ResourceKind::Tokens, 10)]);
        g.admit("b", reserved.clone()).unwrap();
        g.mark_running("b").unwrap();

        let mut restored = StageGraph::restore(g.snapshot()).unwrap();
        assert_eq!(restored.stage("b").unwrap().status, StageStatus::Running);

        let refunds = restored.rewind_in_flight();
        assert_eq!(refunds, vec![("b".to_string(), reserved)]);
        assert_eq!(restored.stage("a").unwrap().status, StageStatus::Completed);
        assert_eq!(restored.runnable_stages(), vec!["b", "c"]);
    }

    // -----------------------------------------------------------------------
    // Randomized invariant check
    // -----------------------------------------------------------------------

    /// Deterministic xorshift so failures reproduce.
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn below(&mut self, n: usize) -> usize {
            (self.next() % n as u64) as usize
        }
    }

    #[test]
    fn test_randomized_graphs_never_run_before_predecessors() {
        let mut rng = Rng(0x5eed_cafe);
        for _round in 0..200 {
            let n = 1 + rng.below(12);
            let names: Vec<String> = (0..n).map(|i| format!("s{i}")).collect();
            let mut descriptors = Vec::new();
            for i in 0..n {
                let mut preds = Vec::new();
                for j in 0..i {
                    if rng.below(3) == 0 {
                        preds.push(names[j].as_str());
                    }
                }
                descriptors.push(StageDescriptor::new(names[i].clone(), "echo", &preds));
            }
            let mut g = StageGraph::from_descriptors(descriptors).unwrap();
            assert_eq!(g.topological_order().len(), n);

            while !g.is_terminal() {
                let runnable = g.runnable_stages();
                assert!(!runnable.is_empty(), "stuck graph");
                let pick = runnable[rng.below(runnable.len())].clone();

                let s = g.stage(&pick).unwrap();
                for pred in &s.descriptor.predecessors {
                    assert_eq!(g.stage(pred).unwrap().status, StageStatus::Completed);
                }

                if rng.below(5) == 0 {
                    for skipped in fail(&mut g, &pick) {
                        assert_eq!(g.stage(&skipped).unwrap().status, StageStatus::Skipped);
                    }
                } else {
                    complete(&mut g, &pick);
                }
            }

            for s in g.stages() {
                if s.status == StageStatus::Completed {
                    for pred in &s.descriptor.predecessors {
                        assert_eq!(g.stage(pred).unwrap().status, StageStatus::Completed);
                    }
                }
            }
        }
    }

    #[test]
    fn test_randomized_cycles_always_rejected() {
        let mut rng = Rng(42);
        for _ in 0..100 {
            let n = 2 + rng.below(8);
            let mut g = StageGraph::new();
            // Chain s0 <- s1 <- ... <- s(n-1), then close the loop on s0's side
            let last = format!("s{}", n - 1);
            g.register(StageDescriptor::new("s0", "echo", &[last.as_str()]))
                .unwrap();
            for i in 1..n {
                let prev = format!("s{}", i - 1);
                let result = g.register(StageDescriptor::new(format!("s{i}"), "echo", &[prev.as_str()]));
                if i == n - 1 {
                    assert!(matches!(result, Err(GraphError::Cycle { .. })));
                } else {
                    result.unwrap();
                }
            }
            assert_eq!(g.len(), n - 1);
        }
    }
}
