//! Scheduler behavior over hand-built graphs: admission control, failure
//! isolation, caching and nested joins.

use scanflow_common::{ErrorKind, IterationKey, Keyed, ScanflowError};
use scanflow_core::{ResourceBudget, ResourceCost, ResultCache};
use scanflow_orchestrator::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn subjects(n: usize) -> Vec<Keyed<u64>> {
    (1..=n)
        .map(|i| Keyed::new(IterationKey::subject(i.to_string()), i as u64))
        .collect()
}

/// Task that doubles the `n` input, tracking how many copies run at once
fn tracked_doubler(running: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> FnTask {
    FnTask::new(&["n"], &["n"], move |inputs| {
        let running = running.clone();
        let peak = peak.clone();
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            let n: u64 = inputs.get("n")?;
            Ok(BTreeMap::from([("n".to_string(), json!(n * 2))]))
        }
    })
}

// ============================================================================
// Admission control
// ============================================================================

#[tokio::test]
async fn test_running_nodes_never_exceed_memory_budget() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut graph = GraphBuilder::new();
    graph.source("n", &subjects(6)).expect("source");
    graph
        .expansion("subjects", &["n"], false)
        .node(
            "double",
            Scope::expansion("subjects"),
            Arc::new(tracked_doubler(running, peak.clone())),
            ResourceCost::new(1, 400),
        )
        .output("double");
    let graph = graph.build().expect("Failed to build graph");

    let budget = ResourceBudget {
        workers: 4,
        memory_mb: 1000,
    };
    let report = Scheduler::new(budget).run(&graph).await;

    assert!(report.is_success());
    assert_eq!(report.outputs.len(), 6);
    assert!(peak.load(Ordering::SeqCst) <= 2, "memory allows two at a time");
    assert!(report.peak_usage.memory_mb <= budget.memory_mb);
    assert!(report.peak_usage.workers <= budget.workers);
}

#[tokio::test]
async fn test_impossible_cost_fails_only_that_node() {
    let mut graph = GraphBuilder::new();
    graph.source("n", &subjects(2)).expect("source");
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    graph
        .expansion("subjects", &["n"], false)
        .node(
            "small",
            Scope::expansion("subjects"),
            Arc::new(tracked_doubler(running.clone(), peak.clone())),
            ResourceCost::new(1, 100),
        )
        .node(
            "huge",
            Scope::expansion("subjects"),
            Arc::new(tracked_doubler(running, peak)),
            ResourceCost::new(1, 1_000_000),
        )
        .output("small");
    let graph = graph.build().expect("Failed to build graph");

    let report = Scheduler::new(ResourceBudget {
        workers: 2,
        memory_mb: 1000,
    })
    .run(&graph)
    .await;

    assert_eq!(report.outputs.len(), 2);
    assert_eq!(report.failures.len(), 2);
    assert!(report
        .failures
        .iter()
        .all(|f| f.node == "huge" && f.kind == ErrorKind::ResourceExhausted));
}

/// Decrements the running count when a task finishes or is cancelled
struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_timed_out_node_is_stopped_before_its_slot_is_reused() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (counter, highest) = (running.clone(), peak.clone());

    let mut graph = GraphBuilder::new();
    graph.source("n", &subjects(3)).expect("source");
    graph
        .expansion("subjects", &["n"], false)
        .node(
            "stall",
            Scope::expansion("subjects"),
            Arc::new(FnTask::new(&["n"], &[], move |_| {
                let counter = counter.clone();
                let highest = highest.clone();
                async move {
                    let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    highest.fetch_max(now, Ordering::SeqCst);
                    let _guard = RunningGuard(counter);
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(BTreeMap::new())
                }
            })),
            ResourceCost::new(1, 10),
        );
    let graph = graph.build().expect("Failed to build graph");

    let report = Scheduler::new(ResourceBudget {
        workers: 1,
        memory_mb: 100,
    })
    .with_node_timeout(Duration::from_millis(50))
    .run(&graph)
    .await;

    assert_eq!(report.failures.len(), 3);
    assert!(report.failures.iter().all(|f| f.kind == ErrorKind::Timeout));
    assert_eq!(peak.load(Ordering::SeqCst), 1, "a timed-out node kept running");
    assert_eq!(running.load(Ordering::SeqCst), 0);
    assert!(report.duration_secs < 10.0);
}

#[tokio::test]
async fn test_small_nodes_backfill_around_waiting_large_node() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let record = |name: &'static str, millis: u64| {
        let order = order.clone();
        Arc::new(FnTask::new(&[], &[], move |_| {
            let order = order.clone();
            async move {
                order.lock().expect("lock").push(name);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(BTreeMap::new())
            }
        }))
    };

    // "big" needs both workers; while "first" holds one, "small" still starts
    let mut graph = GraphBuilder::new();
    graph
        .node("first", Scope::Global, record("first", 50), ResourceCost::new(1, 1))
        .node("big", Scope::Global, record("big", 1), ResourceCost::new(2, 1))
        .node("small", Scope::Global, record("small", 1), ResourceCost::new(1, 1));
    let graph = graph.build().expect("Failed to build graph");

    let report = Scheduler::new(ResourceBudget {
        workers: 2,
        memory_mb: 100,
    })
    .run(&graph)
    .await;

    assert!(report.is_success());
    let order = order.lock().expect("lock").clone();
    assert_eq!(order.len(), 3);
    assert_eq!(order[2], "big");
    assert!(order[..2].contains(&"small"));
}

// ============================================================================
// Failure isolation
// ============================================================================

#[tokio::test]
async fn test_failure_skips_only_its_dependents() {
    let fail_on_two = FnTask::new(&["n"], &["n"], |inputs| async move {
        let n: u64 = inputs.get("n")?;
        if n == 2 {
            return Err(ScanflowError::Registration("diverged".to_string()));
        }
        Ok(BTreeMap::from([("n".to_string(), json!(n))]))
    });
    let pass = FnTask::new(&["n"], &["n"], |inputs| async move {
        Ok(BTreeMap::from([("n".to_string(), inputs.raw("n").cloned().unwrap_or_default())]))
    });
    let total = FnTask::new(&["all"], &["sum"], |inputs| async move {
        let all: Vec<Keyed<u64>> = inputs.get("all")?;
        Ok(BTreeMap::from([(
            "sum".to_string(),
            json!(all.iter().map(|k| k.value).sum::<u64>()),
        )]))
    });

    let mut graph = GraphBuilder::new();
    graph.source("n", &subjects(3)).expect("source");
    graph
        .expansion("subjects", &["n"], false)
        .node("register", Scope::expansion("subjects"), Arc::new(fail_on_two), ResourceCost::new(1, 1))
        .node("resample", Scope::expansion("subjects"), Arc::new(pass), ResourceCost::new(1, 1))
        .connect("register", "n", "resample", "n")
        .join("everything", "resample", "n", Scope::Global)
        .node("total", Scope::Global, Arc::new(total), ResourceCost::new(1, 1))
        .connect("everything", JOIN_OUTPUT, "total", "all")
        .output("resample");
    let graph = graph.build().expect("Failed to build graph");

    let report = Scheduler::new(ResourceBudget {
        workers: 2,
        memory_mb: 100,
    })
    .run(&graph)
    .await;

    assert_eq!(report.failures.len(), 1);
    let failure = &report.failures[0];
    assert_eq!(failure.key, Some(IterationKey::subject("2")));
    assert_eq!(failure.kind, ErrorKind::RegistrationFailure);

    let succeeded: Vec<_> = report.succeeded_keys().into_iter().cloned().collect();
    assert_eq!(succeeded, vec![IterationKey::subject("1"), IterationKey::subject("3")]);

    let skipped: Vec<&str> = report.skipped.iter().map(|s| s.node.as_str()).collect();
    assert_eq!(skipped.len(), 3);
    assert!(skipped.contains(&"resample"));
    assert!(skipped.contains(&"everything"));
    assert!(skipped.contains(&"total"));
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_synchronized_mismatch_fails_before_anything_runs() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut graph = GraphBuilder::new();
    graph.source("anat", &subjects(3)).expect("source");
    graph.source("bold", &subjects(2)).expect("source");
    graph
        .expansion("subjects", &["anat", "bold"], true)
        .node(
            "count",
            Scope::expansion("subjects"),
            Arc::new(FnTask::new(&["anat", "bold"], &[], move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(BTreeMap::new()) }
            })),
            ResourceCost::new(1, 1),
        );

    let err = graph.build().err().expect("mismatch must fail the build");
    assert_eq!(err.kind(), ErrorKind::JoinMismatch);
    assert!(err.is_build_time());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_synchronized_sources_walk_in_lockstep() {
    let mut graph = GraphBuilder::new();
    graph.source("anat", &subjects(2)).expect("source");
    graph
        .source(
            "bold",
            &subjects(2)
                .into_iter()
                .map(|k| k.map(|n| n * 100))
                .collect::<Vec<_>>(),
        )
        .expect("source");
    graph
        .expansion("subjects", &["anat", "bold"], true)
        .node(
            "pair",
            Scope::expansion("subjects"),
            Arc::new(FnTask::new(&["anat", "bold"], &["sum"], |inputs| async move {
                let a: u64 = inputs.get("anat")?;
                let b: u64 = inputs.get("bold")?;
                Ok(BTreeMap::from([("sum".to_string(), json!(a + b))]))
            })),
            ResourceCost::new(1, 1),
        )
        .output("pair");
    let graph = graph.build().expect("Failed to build graph");

    let report = Scheduler::new(ResourceBudget {
        workers: 2,
        memory_mb: 100,
    })
    .run(&graph)
    .await;
    let mut outputs = report.outputs.clone();
    outputs.sort_by(|a, b| a.key.cmp(&b.key));
    let sums: Vec<_> = outputs.iter().map(|o| o.outputs["sum"].clone()).collect();
    assert_eq!(sums, vec![json!(101), json!(202)]);
}

// ============================================================================
// Nested expansion and intermediate joins
// ============================================================================

#[tokio::test]
async fn test_join_at_session_level_collects_only_its_runs() {
    let session = |s: &str| IterationKey::session(s, Some("1".to_string()));
    let run = |s: &str, r: &str| IterationKey::run(s, Some("1".to_string()), r);

    let sessions = vec![Keyed::new(session("1"), 0u64), Keyed::new(session("10"), 0u64)];
    let runs = vec![
        Keyed::new(run("1", "1"), 1u64),
        Keyed::new(run("1", "2"), 2u64),
        Keyed::new(run("10", "1"), 10u64),
    ];

    let mut graph = GraphBuilder::new();
    graph.source("anat", &sessions).expect("source");
    graph.source("bold", &runs).expect("source");
    graph
        .expansion("session", &["anat"], false)
        .nested_expansion("run", "session", "bold")
        .node(
            "value",
            Scope::expansion("run"),
            Arc::new(FnTask::new(&["bold"], &["v"], |inputs| async move {
                Ok(BTreeMap::from([("v".to_string(), inputs.raw("bold").cloned().unwrap_or_default())]))
            })),
            ResourceCost::new(1, 1),
        )
        .join("runs", "value", "v", Scope::expansion("session"))
        .node(
            "collect",
            Scope::expansion("session"),
            Arc::new(FnTask::new(&["runs"], &["keys", "sum"], |inputs| async move {
                let runs: Vec<Keyed<u64>> = inputs.get("runs")?;
                let keys: Vec<String> = runs.iter().map(|r| r.key.to_string()).collect();
                Ok(BTreeMap::from([
                    ("keys".to_string(), json!(keys)),
                    ("sum".to_string(), json!(runs.iter().map(|r| r.value).sum::<u64>())),
                ]))
            })),
            ResourceCost::new(1, 1),
        )
        .connect("runs", JOIN_OUTPUT, "collect", "runs")
        .output("collect");
    let graph = graph.build().expect("Failed to build graph");
    assert_eq!(graph.replicas_of("value").len(), 3);
    assert_eq!(graph.replicas_of("collect").len(), 2);

    let report = Scheduler::new(ResourceBudget {
        workers: 4,
        memory_mb: 100,
    })
    .run(&graph)
    .await;
    assert!(report.is_success());

    let by_key: BTreeMap<_, _> = report
        .outputs
        .iter()
        .map(|o| (o.key.clone().expect("keyed"), o.outputs.clone()))
        .collect();
    assert_eq!(by_key[&session("1")]["sum"], json!(3));
    assert_eq!(
        by_key[&session("1")]["keys"],
        json!(["sub-1_ses-1_run-1", "sub-1_ses-1_run-2"])
    );
    assert_eq!(by_key[&session("10")]["sum"], json!(10));
}

// ============================================================================
// Caching
// ============================================================================

#[tokio::test]
async fn test_cached_results_are_reused_across_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let mut graph = GraphBuilder::new();
    graph.source("n", &subjects(3)).expect("source");
    graph
        .expansion("subjects", &["n"], false)
        .node(
            "square",
            Scope::expansion("subjects"),
            Arc::new(
                FnTask::new(&["n"], &["n"], move |inputs| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        let n: u64 = inputs.get("n")?;
                        Ok(BTreeMap::from([("n".to_string(), json!(n * n))]))
                    }
                })
                .with_params(json!({"power": 2})),
            ),
            ResourceCost::new(1, 1),
        )
        .output("square");
    let graph = graph.build().expect("Failed to build graph");

    let budget = ResourceBudget {
        workers: 2,
        memory_mb: 100,
    };
    let first = Scheduler::new(budget)
        .with_cache(ResultCache::with_dir(dir.path()).expect("cache"))
        .run(&graph)
        .await;
    assert_eq!(first.cache_hits, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // A fresh cache over the same directory stands in for a later process
    let second = Scheduler::new(budget)
        .with_cache(ResultCache::with_dir(dir.path()).expect("cache"))
        .run(&graph)
        .await;
    assert_eq!(second.cache_hits, 3);
    assert_eq!(second.nodes_run, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        second.outputs.iter().map(|o| o.outputs["n"].clone()).collect::<Vec<_>>(),
        vec![json!(1), json!(4), json!(9)]
    );
}
