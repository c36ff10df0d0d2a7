//! Plan execution correctness tests.
//!
//! These tests verify that the executor bounds concurrency, respects
//! dependencies, isolates failures and reports lifecycle events.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use conductor::agent::{AgentId, AgentOutput, Capability, FnAgent};
use conductor::config::{ExecutorConfig, PlannerConfig};
use conductor::core::{PlanStatus, TaskStatus};
use conductor::orchestration::{EventType, ExecuteOptions, SubtaskSpec};

use crate::fixtures::{
    echo_agent, failing_agent, fan_out, independent, tracking_agent, ConcurrencyProbe, Engine,
    TableDecomposer,
};

/// Test: Serial execution with a parallel limit of one
/// Given three equal-priority independent tasks
/// When the plan runs with parallel_limit 1
/// Then no two tasks are ever in flight together
#[tokio::test]
async fn test_parallel_limit_one_never_overlaps() {
    let engine = Engine::new(TableDecomposer::new(vec![("goal", independent(3))]));
    let probe = Arc::new(ConcurrencyProbe::default());
    engine.registry.register(tracking_agent(
        "worker",
        &["general"],
        probe.clone(),
        Duration::from_millis(20),
    ));
    let plan = engine.plan("goal").await;

    let report = engine
        .executor
        .execute_plan(&plan.id, ExecuteOptions::default().with_parallel_limit(1))
        .await
        .unwrap();

    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.completed_count(), 3);
    assert_eq!(probe.peak(), 1);
}

/// Test: Parallel execution respects the limit
/// Given six independent tasks and a limit of three
/// When the plan runs
/// Then at most three run at once, and more than one does
#[tokio::test]
async fn test_parallel_limit_bounds_in_flight_tasks() {
    let engine = Engine::new(TableDecomposer::new(vec![("goal", independent(6))]));
    let probe = Arc::new(ConcurrencyProbe::default());
    engine.registry.register(tracking_agent(
        "worker",
        &["general"],
        probe.clone(),
        Duration::from_millis(20),
    ));
    let plan = engine
        .planner
        .create_plan(
            "wide",
            "goal",
            conductor::orchestration::PlanOptions {
                max_depth: 1,
                max_subtasks: 6,
            },
        )
        .await
        .unwrap();

    let report = engine
        .executor
        .execute_plan(&plan.id, ExecuteOptions::default().with_parallel_limit(3))
        .await
        .unwrap();

    assert_eq!(report.completed_count(), 6);
    assert_eq!(probe.peak(), 3);
}

#[tokio::test]
async fn test_dependents_run_after_dependencies() {
    let engine = Engine::new(TableDecomposer::new(vec![("goal", fan_out())]));
    engine.registry.register(echo_agent("worker", &["general"]));
    let plan = engine.plan("goal").await;

    let report = engine
        .executor
        .execute_plan(&plan.id, ExecuteOptions::default())
        .await
        .unwrap();

    let order: Vec<&str> = report.results.iter().map(|r| r.task_name.as_str()).collect();
    assert_eq!(order[0], "A");
    assert_eq!(order.len(), 3);

    let plan = engine.snapshot(&plan.id).await;
    let a = plan.task_by_name("A").unwrap();
    for name in ["B", "C"] {
        let task = plan.task_by_name(name).unwrap();
        assert!(task.started_at.unwrap() >= a.completed_at.unwrap());
    }
    assert_eq!(plan.status, PlanStatus::Completed);
}

/// Test: Failures stay on their branch
/// Given a failing task with a dependent and an unrelated task
/// When the plan runs
/// Then the dependent fails with a dependency reason and the unrelated task completes
#[tokio::test]
async fn test_failure_is_isolated_to_its_branch() {
    let specs = vec![
        SubtaskSpec::new("broken", "will fail").with_capabilities(["fragile"]),
        SubtaskSpec::new("after", "needs broken").depends_on("broken"),
        SubtaskSpec::new("unrelated", "independent"),
    ];
    let engine = Engine::new(TableDecomposer::new(vec![("goal", specs)]));
    let calls = Arc::new(AtomicUsize::new(0));
    engine
        .registry
        .register(failing_agent("crasher", &["fragile"], calls.clone()));
    engine.registry.register(echo_agent("worker", &["general"]));
    let plan = engine.plan("goal").await;

    let report = engine
        .executor
        .execute_plan(&plan.id, ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, PlanStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let plan = engine.snapshot(&plan.id).await;
    let broken = plan.task_by_name("broken").unwrap();
    assert_eq!(broken.status, TaskStatus::Failed);
    assert_eq!(
        broken.failure_reason.as_deref(),
        Some("Execution error: broken crashed")
    );
    let after = plan.task_by_name("after").unwrap();
    assert_eq!(after.status, TaskStatus::Failed);
    assert_eq!(after.failure_reason.as_deref(), Some("dependency 'broken' failed"));
    assert!(after.assigned_to.is_none());
    assert_eq!(
        plan.task_by_name("unrelated").unwrap().status,
        TaskStatus::Completed
    );

    let root = plan.task(&plan.root_task_ids[0]).unwrap();
    assert_eq!(root.status, TaskStatus::Failed);
    assert!(root.failure_reason.as_deref().unwrap().starts_with("subtasks failed"));
}

#[tokio::test]
async fn test_retries_use_configured_default() {
    let engine = Engine::with_config(
        TableDecomposer::new(vec![]),
        PlannerConfig::default(),
        ExecutorConfig {
            max_retries: 1,
            ..ExecutorConfig::default()
        },
    );
    let calls = Arc::new(AtomicUsize::new(0));
    engine
        .registry
        .register(failing_agent("crasher", &["general"], calls.clone()));
    let plan = engine.plan("goal").await;

    let report = engine
        .executor
        .execute_plan(&plan.id, engine.executor.default_options())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(report.results[0].attempts, 2);
}

#[tokio::test]
async fn test_flaky_agent_recovers_on_retry() {
    let engine = engine_with_single_task();
    let attempts = Arc::new(AtomicUsize::new(0));
    let a = attempts.clone();
    engine.registry.register(Arc::new(FnAgent::new(
        "flaky",
        vec![Capability::named("general")],
        move |_| {
            let a = a.clone();
            async move {
                if a.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(conductor::Error::Execution("transient".to_string()))
                } else {
                    Ok(AgentOutput::new(json!("second time lucky")))
                }
            }
        },
    )));
    let plan = engine.plan("goal").await;

    let report = engine
        .executor
        .execute_plan(&plan.id, ExecuteOptions::default().with_retries(3))
        .await
        .unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.results[0].attempts, 2);
    assert_eq!(report.results[0].result, Some(json!("second time lucky")));
}

fn engine_with_single_task() -> Engine {
    Engine::new(TableDecomposer::new(vec![]))
}

/// Test: Lifecycle events
/// Given a subscriber for all events and one for failures only
/// When a plan with one failing and one passing task runs
/// Then each subscriber sees the matching events in order
#[tokio::test]
async fn test_event_subscribers_receive_lifecycle() {
    let specs = vec![
        SubtaskSpec::new("good", "passes").with_priority(1),
        SubtaskSpec::new("bad", "fails").with_capabilities(["fragile"]),
    ];
    let engine = Engine::new(TableDecomposer::new(vec![("goal", specs)]));
    engine.registry.register(echo_agent("worker", &["general"]));
    engine.registry.register(failing_agent(
        "crasher",
        &["fragile"],
        Arc::new(AtomicUsize::new(0)),
    ));

    let all = Arc::new(Mutex::new(Vec::new()));
    let failures = Arc::new(Mutex::new(Vec::new()));
    let a = all.clone();
    let f = failures.clone();
    engine.executor.subscribe(
        move |e| a.lock().unwrap().push((e.event_type, e.payload["name"].clone())),
        None,
    );
    let failure_sub = engine.executor.subscribe(
        move |e| f.lock().unwrap().push(e.payload["error"].clone()),
        Some(vec![EventType::TaskFailed]),
    );
    let plan = engine.plan("goal").await;

    engine
        .executor
        .execute_plan(&plan.id, ExecuteOptions::default().with_parallel_limit(1))
        .await
        .unwrap();

    assert_eq!(
        *all.lock().unwrap(),
        vec![
            (EventType::TaskStarted, json!("good")),
            (EventType::TaskCompleted, json!("good")),
            (EventType::TaskStarted, json!("bad")),
            (EventType::TaskFailed, json!("bad")),
        ]
    );
    assert_eq!(
        *failures.lock().unwrap(),
        vec![json!("Execution error: bad crashed")]
    );
    assert!(engine.executor.unsubscribe(failure_sub));
    assert_eq!(engine.executor.events().subscriber_count(), 1);
}

#[tokio::test]
async fn test_channel_subscription_streams_events() {
    let engine = engine_with_single_task();
    engine.registry.register(echo_agent("worker", &["general"]));
    let (_, mut rx) = engine
        .executor
        .events()
        .subscribe_channel(Some(vec![EventType::TaskCompleted]));
    let plan = engine.plan("goal").await;

    engine
        .executor
        .execute_plan(&plan.id, ExecuteOptions::default())
        .await
        .unwrap();

    let event = rx.recv().await.unwrap();
    assert_eq!(event.plan_id, plan.id);
    assert_eq!(event.payload["result"], json!({ "task": "test plan" }));
}

/// Test: Timeout bounds the whole run
/// Given one fast and one slow independent task
/// When the plan runs with a budget shorter than the slow task
/// Then the report is flagged and the in-flight batch is left in progress
#[tokio::test(start_paused = true)]
async fn test_timeout_stops_plan() {
    let engine = Engine::new(TableDecomposer::new(vec![(
        "goal",
        vec![
            SubtaskSpec::new("fast", "quick").with_priority(1),
            SubtaskSpec::new("slow", "takes forever").with_capabilities(["slow"]),
        ],
    )]));
    engine.registry.register(echo_agent("worker", &["general"]));
    engine.registry.register(Arc::new(FnAgent::new(
        "sloth",
        vec![Capability::named("slow")],
        |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(AgentOutput::new(json!(null)))
        },
    )));
    let plan = engine.plan("goal").await;

    let report = engine
        .executor
        .execute_plan(
            &plan.id,
            ExecuteOptions::default()
                .with_parallel_limit(1)
                .with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    assert!(report.timed_out);
    assert!(!report.cancelled);
    assert_eq!(report.completed_count(), 1);
    assert_eq!(report.status, PlanStatus::InProgress);

    let plan = engine.snapshot(&plan.id).await;
    assert_eq!(
        plan.task_by_name("slow").unwrap().status,
        TaskStatus::InProgress
    );
}

/// Test: Timeout keeps finished work in the report
/// Given a fast and a hanging task dispatched in the same batch
/// When the budget runs out while the hanging task is still running
/// Then the fast task's result is reported alongside the timeout
#[tokio::test(start_paused = true)]
async fn test_timeout_reports_finished_part_of_batch() {
    let engine = Engine::new(TableDecomposer::new(vec![(
        "goal",
        vec![
            SubtaskSpec::new("fast", "quick"),
            SubtaskSpec::new("slow", "takes forever").with_capabilities(["slow"]),
        ],
    )]));
    engine.registry.register(echo_agent("worker", &["general"]));
    engine.registry.register(Arc::new(FnAgent::new(
        "sloth",
        vec![Capability::named("slow")],
        |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(AgentOutput::new(json!(null)))
        },
    )));
    let completed = Arc::new(AtomicUsize::new(0));
    let seen = completed.clone();
    engine.executor.subscribe(
        move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        },
        Some(vec![EventType::TaskCompleted]),
    );
    let plan = engine.plan("goal").await;

    let report = engine
        .executor
        .execute_plan(
            &plan.id,
            ExecuteOptions::default()
                .with_parallel_limit(2)
                .with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    assert!(report.timed_out);
    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert_eq!(report.completed_count(), 1);
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].task_name, "fast");

    let plan = engine.snapshot(&plan.id).await;
    assert_eq!(plan.task_by_name("fast").unwrap().status, TaskStatus::Completed);
    assert_eq!(
        plan.task_by_name("slow").unwrap().status,
        TaskStatus::InProgress
    );
}

#[tokio::test]
async fn test_cancellation_stops_plan() {
    let engine = Engine::new(TableDecomposer::new(vec![("goal", independent(2))]));
    let token = CancellationToken::new();
    let trigger = token.clone();
    engine.registry.register(Arc::new(FnAgent::new(
        "canceller",
        vec![Capability::named("general")],
        move |_| {
            let trigger = trigger.clone();
            async move {
                trigger.cancel();
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(AgentOutput::new(json!(null)))
            }
        },
    )));
    let plan = engine.plan("goal").await;

    let report = engine
        .executor
        .execute_plan(
            &plan.id,
            ExecuteOptions::default()
                .with_parallel_limit(1)
                .with_cancel(token),
        )
        .await
        .unwrap();

    assert!(report.cancelled);
    assert!(report.results.is_empty());
    let plan = engine.snapshot(&plan.id).await;
    let pending = plan
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .count();
    assert_eq!(pending, 1);
}

#[tokio::test]
async fn test_preassigned_task_runs_directly() {
    let engine = engine_with_single_task();
    engine.registry.register(echo_agent("chosen", &["other"]));
    engine.registry.register(echo_agent("worker", &["general"]));
    let plan = engine.plan("goal").await;
    let root = plan.root_task_ids[0];

    engine
        .planner
        .assign_task(&plan.id, &root, "chosen".into())
        .await
        .unwrap();
    let result = engine
        .executor
        .execute_task_directly(&plan.id, &root)
        .await
        .unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.agent_id, Some(AgentId::from("chosen")));
    assert_eq!(
        engine.snapshot(&plan.id).await.status,
        PlanStatus::Completed
    );
}
