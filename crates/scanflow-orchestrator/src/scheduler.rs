//! Admission-controlled executor for an instantiated [`TaskGraph`]
//!
//! A single loop owns the budget ledger and a `JoinSet` of running nodes.
//! Ready instances are considered in instance order (topological node order,
//! then key order); every one that fits the free budget starts, so a large
//! node waiting for room does not hold back smaller ones behind it.

use crate::budget::{Admission, BudgetLedger};
use crate::graph::{Binding, NodeInputs, NodeKind, NodeOutputs, TaskGraph, JOIN_OUTPUT};
use crate::report::{FailureRecord, OutputRecord, RunReport, SkippedRecord};
use scanflow_common::{Result, ScanflowError};
use scanflow_core::{CacheKey, ResourceBudget, ResultCache};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(3600);

pub struct Scheduler {
    budget: ResourceBudget,
    node_timeout: Duration,
    cache: Option<ResultCache>,
}

impl Scheduler {
    pub fn new(budget: ResourceBudget) -> Self {
        Self {
            budget,
            node_timeout: DEFAULT_NODE_TIMEOUT,
            cache: None,
        }
    }

    /// An expired node is cancelled and reported failed. Its budget stays
    /// reserved until the cancelled task has actually stopped.
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn budget(&self) -> ResourceBudget {
        self.budget
    }

    /// Execute every instance of `graph` and report the outcome.
    ///
    /// Node failures never abort the run: dependents of a failed node are
    /// skipped and every other branch keeps going.
    pub async fn run(&self, graph: &TaskGraph) -> RunReport {
        let started = Instant::now();
        info!(
            "Scheduling {} node instances under budget {}",
            graph.instance_count(),
            self.budget
        );

        let mut run = Run::new(self, graph);
        run.execute().await;

        let mut report = run.report;
        report.peak_usage = run.ledger.peak();
        report.duration_secs = started.elapsed().as_secs_f64();
        info!(
            "Run finished in {:.2}s: {} outputs, {} failures, {} skipped, {} cache hits",
            report.duration_secs,
            report.outputs.len(),
            report.failures.len(),
            report.skipped.len(),
            report.cache_hits
        );
        report
    }
}

#[derive(Clone)]
enum State {
    Pending,
    Ready,
    Running,
    Succeeded(Arc<NodeOutputs>),
    Failed,
    Skipped,
}

struct Prepared {
    inputs: NodeInputs,
    cache_key: Option<CacheKey>,
}

/// Mutable bookkeeping of one scheduler run
struct Run<'a> {
    scheduler: &'a Scheduler,
    graph: &'a TaskGraph,
    states: Vec<State>,
    remaining: Vec<usize>,
    ready: BTreeSet<usize>,
    prepared: HashMap<usize, Prepared>,
    settled: VecDeque<(usize, Result<NodeOutputs>)>,
    ledger: BudgetLedger,
    report: RunReport,
}

impl<'a> Run<'a> {
    fn new(scheduler: &'a Scheduler, graph: &'a TaskGraph) -> Self {
        let remaining = graph.instances.iter().map(|i| i.upstream.len()).collect();
        Self {
            scheduler,
            graph,
            states: vec![State::Pending; graph.instance_count()],
            remaining,
            ready: BTreeSet::new(),
            prepared: HashMap::new(),
            settled: VecDeque::new(),
            ledger: BudgetLedger::new(scheduler.budget),
            report: RunReport::start(),
        }
    }

    async fn execute(&mut self) {
        let roots: Vec<usize> = (0..self.graph.instance_count())
            .filter(|&i| self.remaining[i] == 0)
            .collect();
        for idx in roots {
            self.prepare(idx);
        }

        let mut running: JoinSet<(usize, Result<NodeOutputs>)> = JoinSet::new();
        loop {
            while let Some((idx, result)) = self.settled.pop_front() {
                self.settle(idx, result);
            }

            self.admit(&mut running);
            if !self.settled.is_empty() {
                continue;
            }

            match running.join_next().await {
                Some(Ok((idx, result))) => {
                    let cost = self.graph.nodes[self.graph.instances[idx].node].cost;
                    self.ledger.release(cost);
                    self.settle(idx, result);
                }
                Some(Err(e)) => error!("Scheduler lost a node wrapper: {}", e),
                None => break,
            }
        }

        self.fail_unfinished();
    }

    /// Called once all upstream instances succeeded
    fn prepare(&mut self, idx: usize) {
        let graph = self.graph;
        let instance = &graph.instances[idx];
        let node = &graph.nodes[instance.node];

        let mut values = BTreeMap::new();
        for binding in &instance.bindings {
            match binding {
                Binding::Edge {
                    input,
                    upstream,
                    output,
                } => {
                    values.insert(input.clone(), self.output_of(*upstream, output));
                }
                Binding::Source { input, value } => {
                    values.insert(input.clone(), value.clone());
                }
                Binding::Gather { upstream, output } => {
                    let items: Vec<Value> = upstream
                        .iter()
                        .map(|&up| {
                            json!({
                                "key": graph.instances[up].key,
                                "value": self.output_of(up, output),
                            })
                        })
                        .collect();
                    values.insert(JOIN_OUTPUT.to_string(), Value::Array(items));
                }
            }
        }
        let inputs = NodeInputs::new(instance.key.clone(), values);

        match &node.kind {
            NodeKind::Join => {
                let outputs: NodeOutputs = inputs.values().clone();
                self.settled.push_back((idx, Ok(outputs)));
            }
            NodeKind::Task(task) => {
                let cache_key = match &self.scheduler.cache {
                    Some(_) if task.cacheable() => {
                        Some(CacheKey::new(&node.name, &task.params(), inputs.values()))
                    }
                    _ => None,
                };
                if let (Some(cache), Some(key)) = (&self.scheduler.cache, &cache_key) {
                    let hit = cache
                        .get(key)
                        .and_then(|value| serde_json::from_value::<NodeOutputs>(value).ok());
                    if let Some(outputs) = hit {
                        info!("Reusing cached result for {}", graph.label(idx));
                        self.report.cache_hits += 1;
                        self.settled.push_back((idx, Ok(outputs)));
                        return;
                    }
                }
                self.prepared.insert(idx, Prepared { inputs, cache_key });
                self.states[idx] = State::Ready;
                self.ready.insert(idx);
            }
        }
    }

    fn output_of(&self, idx: usize, output: &str) -> Value {
        match &self.states[idx] {
            State::Succeeded(outputs) => outputs.get(output).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Start every ready instance that fits the free budget
    fn admit(&mut self, running: &mut JoinSet<(usize, Result<NodeOutputs>)>) {
        let graph = self.graph;
        let candidates: Vec<usize> = self.ready.iter().copied().collect();
        for idx in candidates {
            let node = &graph.nodes[graph.instances[idx].node];
            let NodeKind::Task(task) = &node.kind else {
                continue;
            };

            match self.ledger.try_acquire(node.cost) {
                Admission::Admit => {}
                Admission::Wait => continue,
                Admission::Never => {
                    self.ready.remove(&idx);
                    self.settled.push_back((
                        idx,
                        Err(ScanflowError::ResourceExhausted {
                            node: graph.label(idx),
                            requested: node.cost.to_string(),
                            budget: self.ledger.budget().to_string(),
                        }),
                    ));
                    continue;
                }
            }

            self.ready.remove(&idx);
            let Some(prepared) = self.prepared.get(&idx) else {
                continue;
            };
            let inputs = prepared.inputs.clone();
            let label = graph.label(idx);
            let task = Arc::clone(task);
            let timeout = self.scheduler.node_timeout;

            info!("Starting {}", label);
            self.states[idx] = State::Running;
            self.report.nodes_run += 1;

            running.spawn(async move {
                let started = Instant::now();
                let mut handle = tokio::spawn(async move { task.run(inputs).await });
                let result = match tokio::time::timeout(timeout, &mut handle).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_error)) => Err(ScanflowError::TaskFailed(panic_message(join_error))),
                    Err(_) => {
                        // The reservation is released only once the task has stopped
                        warn!("{} timed out after {}s, cancelling", label, timeout.as_secs());
                        handle.abort();
                        if let Err(join_error) = handle.await {
                            if join_error.is_panic() {
                                warn!("{} panicked while cancelling", label);
                            }
                        }
                        Err(ScanflowError::Timeout {
                            node: label.clone(),
                            secs: timeout.as_secs(),
                        })
                    }
                };
                debug!("{} returned after {:.2}s", label, started.elapsed().as_secs_f64());
                (idx, result)
            });
        }
    }

    fn settle(&mut self, idx: usize, result: Result<NodeOutputs>) {
        let graph = self.graph;
        let result = result.and_then(|outputs| self.check_outputs(idx, outputs));
        let label = graph.label(idx);
        let instance = &graph.instances[idx];
        let node = &graph.nodes[instance.node];
        let prepared = self.prepared.remove(&idx);

        match result {
            Ok(outputs) => {
                info!("Finished {}", label);
                if let (Some(cache), Some(Prepared { cache_key: Some(key), .. })) =
                    (&self.scheduler.cache, &prepared)
                {
                    if let Ok(value) = serde_json::to_value(&outputs) {
                        cache.put(key, &value);
                    }
                }
                if node.is_output {
                    self.report.outputs.push(OutputRecord {
                        node: node.name.clone(),
                        key: instance.key.clone(),
                        outputs: serde_json::to_value(&outputs).unwrap_or(Value::Null),
                    });
                }
                self.states[idx] = State::Succeeded(Arc::new(outputs));

                for &dependent in &graph.dependents[idx] {
                    self.remaining[dependent] -= 1;
                    if self.remaining[dependent] == 0 && matches!(self.states[dependent], State::Pending) {
                        self.prepare(dependent);
                    }
                }
            }
            Err(e) => {
                error!("{} failed: {}", label, e);
                self.report.failures.push(FailureRecord {
                    node: node.name.clone(),
                    key: instance.key.clone(),
                    kind: e.kind(),
                    message: e.to_string(),
                });
                self.states[idx] = State::Failed;
                self.skip_dependents(idx, &label);
            }
        }
    }

    /// Reject results missing a declared output slot
    fn check_outputs(&self, idx: usize, outputs: NodeOutputs) -> Result<NodeOutputs> {
        let node = &self.graph.nodes[self.graph.instances[idx].node];
        if let NodeKind::Task(task) = &node.kind {
            if let Some(missing) = task.outputs().into_iter().find(|o| !outputs.contains_key(*o)) {
                return Err(ScanflowError::TaskFailed(format!(
                    "node '{}' did not produce output '{missing}'",
                    node.name
                )));
            }
        }
        Ok(outputs)
    }

    fn skip_dependents(&mut self, failed: usize, label: &str) {
        let graph = self.graph;
        let mut stack: Vec<usize> = graph.dependents[failed].clone();
        while let Some(idx) = stack.pop() {
            if !matches!(self.states[idx], State::Pending) {
                continue;
            }
            self.states[idx] = State::Skipped;
            let instance = &graph.instances[idx];
            debug!("Skipping {}: upstream {} failed", graph.label(idx), label);
            self.report.skipped.push(SkippedRecord {
                node: graph.nodes[instance.node].name.clone(),
                key: instance.key.clone(),
                upstream: label.to_string(),
            });
            stack.extend(graph.dependents[idx].iter().copied());
        }
    }

    fn fail_unfinished(&mut self) {
        let graph = self.graph;
        for idx in 0..self.states.len() {
            if matches!(self.states[idx], State::Pending | State::Ready | State::Running) {
                warn!("{} never completed", graph.label(idx));
                let instance = &graph.instances[idx];
                self.report.failures.push(FailureRecord {
                    node: graph.nodes[instance.node].name.clone(),
                    key: instance.key.clone(),
                    kind: scanflow_common::ErrorKind::TaskFailed,
                    message: "node never completed".to_string(),
                });
                self.states[idx] = State::Failed;
            }
        }
        self.report.skipped.sort_by(|a, b| (&a.key, &a.node).cmp(&(&b.key, &b.node)));
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return format!("task was cancelled: {error}");
    }
    let payload = error.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("task panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("task panicked: {msg}")
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FnTask, GraphBuilder, Scope};
    use scanflow_common::{ErrorKind, IterationKey, Keyed};
    use scanflow_core::ResourceCost;

    fn budget(workers: usize) -> ResourceBudget {
        ResourceBudget {
            workers,
            memory_mb: 1024,
        }
    }

    #[tokio::test]
    async fn test_values_flow_through_edges() {
        let mut b = GraphBuilder::new();
        b.node(
            "a",
            Scope::Global,
            Arc::new(FnTask::new(&[], &["n"], |_| async {
                Ok(BTreeMap::from([("n".to_string(), json!(2))]))
            })),
            ResourceCost::new(1, 1),
        )
        .node(
            "b",
            Scope::Global,
            Arc::new(FnTask::new(&["n"], &["n"], |inputs| async move {
                let n: i64 = inputs.get("n")?;
                Ok(BTreeMap::from([("n".to_string(), json!(n * 10))]))
            })),
            ResourceCost::new(1, 1),
        )
        .connect("a", "n", "b", "n")
        .output("b");
        let graph = b.build().unwrap();

        let report = Scheduler::new(budget(2)).run(&graph).await;
        assert!(report.is_success());
        assert_eq!(report.outputs.len(), 1);
        assert_eq!(report.outputs[0].outputs["n"], json!(20));
    }

    #[tokio::test]
    async fn test_panic_becomes_node_failure() {
        let keys: Vec<Keyed<u32>> = (0..2)
            .map(|i| Keyed::new(IterationKey::subject(i.to_string()), i))
            .collect();
        let mut b = GraphBuilder::new();
        b.source("n", &keys).unwrap();
        b.expansion("e", &["n"], false)
            .node(
                "work",
                Scope::expansion("e"),
                Arc::new(FnTask::new(&["n"], &["out"], |inputs| async move {
                    let n: u32 = inputs.get("n")?;
                    if n == 1 {
                        panic!("boom");
                    }
                    Ok(BTreeMap::from([("out".to_string(), json!(n))]))
                })),
                ResourceCost::new(1, 1),
            )
            .output("work");
        let graph = b.build().unwrap();

        let report = Scheduler::new(budget(2)).run(&graph).await;
        assert_eq!(report.outputs.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, ErrorKind::TaskFailed);
        assert!(report.failures[0].message.contains("boom"));
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let mut b = GraphBuilder::new();
        b.node(
            "slow",
            Scope::Global,
            Arc::new(FnTask::new(&[], &[], |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(BTreeMap::new())
            })),
            ResourceCost::new(1, 1),
        );
        let graph = b.build().unwrap();

        let report = Scheduler::new(budget(1))
            .with_node_timeout(Duration::from_millis(20))
            .run(&graph)
            .await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_missing_output_fails_node() {
        let mut b = GraphBuilder::new();
        b.node(
            "lazy",
            Scope::Global,
            Arc::new(FnTask::new(&[], &["promised"], |_| async { Ok(BTreeMap::new()) })),
            ResourceCost::new(1, 1),
        );
        let graph = b.build().unwrap();
        let report = Scheduler::new(budget(1)).run(&graph).await;
        assert!(report.failures[0].message.contains("promised"));
    }
}
