//! Capability routing, fallback and metrics through the public API.

use std::sync::Arc;

use conductor::agent::{AgentId, Capability};
use conductor::core::{PlanStatus, TaskStatus};
use conductor::discovery::{
    AgentDiscovery, AgentRegistry, DiscoveryOptions, ExecutionOutcome, FallbackStrategy,
    FallbackType,
};
use conductor::orchestration::{ExecuteOptions, SubtaskSpec};

use crate::fixtures::{echo_agent, Engine, TableDecomposer};

fn engine() -> Engine {
    Engine::new(TableDecomposer::new(vec![]))
}

/// Test: Similar fallback for an unknown capability
/// Given no provider of 'x' and one provider of 'x2'
/// When discovering 'x' with the similar strategy
/// Then the 'x2' provider is returned as a similar fallback
#[tokio::test]
async fn test_similar_fallback_for_unprovided_capability() {
    let engine = engine();
    engine.registry.register(echo_agent("solo", &["x2"]));

    let result = engine
        .discovery
        .discover_agent(&DiscoveryOptions::new("x").with_strategy(FallbackStrategy::Similar))
        .await
        .expect("similar provider should be found");
    assert_eq!(result.agent_id, AgentId::from("solo"));
    assert_eq!(result.capability, "x2");
    let fallback = result.fallback.unwrap();
    assert_eq!(fallback.fallback_type, FallbackType::Similar);
    assert_eq!(fallback.original_capability, "x");
    assert!((fallback.score - 0.8).abs() < 1e-9);

    let strict = engine
        .discovery
        .discover_agent(&DiscoveryOptions::new("x").with_strategy(FallbackStrategy::Strict))
        .await;
    assert!(strict.is_none());
}

/// Test: Exclusions per strategy
/// Given two providers of 'code-review' and one of 'code'
/// When every 'code-review' provider is excluded
/// Then strict misses while similar and degraded still route
#[tokio::test]
async fn test_exclusions_per_strategy() {
    let engine = engine();
    engine.registry.register(echo_agent("r1", &["code-review"]));
    engine.registry.register(echo_agent("r2", &["code-review"]));
    engine.registry.register(echo_agent("coder", &["code", "testing"]));

    let exact = engine
        .discovery
        .discover_agent(&DiscoveryOptions::new("code-review"))
        .await
        .unwrap();
    assert!(["r1", "r2"].contains(&exact.agent_id.as_str()));
    assert!(exact.fallback.is_none());

    let base = DiscoveryOptions::new("code-review")
        .exclude("r1")
        .exclude("r2")
        .require(["code-review", "testing"]);

    let strict = engine
        .discovery
        .discover_agent(&base.clone().with_strategy(FallbackStrategy::Strict))
        .await;
    assert!(strict.is_none());

    let similar = engine
        .discovery
        .discover_agent(&base.clone().with_strategy(FallbackStrategy::Similar))
        .await
        .unwrap();
    assert_eq!(similar.agent_id, AgentId::from("coder"));
    assert_eq!(similar.fallback.unwrap().fallback_type, FallbackType::Similar);

    let degraded = engine
        .discovery
        .discover_agent(&base.with_strategy(FallbackStrategy::Degraded))
        .await
        .unwrap();
    assert_eq!(degraded.agent_id, AgentId::from("coder"));
}

#[tokio::test]
async fn test_degraded_fallback_uses_required_set() {
    let engine = engine();
    engine.registry.register(echo_agent("tester", &["testing"]));
    engine.registry.register(echo_agent("writer", &["docs", "testing"]));

    let options = DiscoveryOptions::new("deploy")
        .require(["deploy", "docs", "testing"])
        .with_strategy(FallbackStrategy::Degraded);
    let result = engine.discovery.discover_agent(&options).await.unwrap();

    assert_eq!(result.agent_id, AgentId::from("writer"));
    let fallback = result.fallback.unwrap();
    assert_eq!(fallback.fallback_type, FallbackType::Degraded);
    assert!((fallback.score - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(result.alternatives[0].agent_id, AgentId::from("tester"));
}

#[tokio::test]
async fn test_repeated_failures_lower_reliability() {
    let engine = engine();
    engine.registry.register(echo_agent("a", &["code"]));
    let agent = AgentId::from("a");

    let mut previous = f64::MAX;
    for _ in 0..10 {
        let metrics = engine
            .discovery
            .update_metrics(&agent, "code", ExecutionOutcome::failure(100.0))
            .await;
        assert!(metrics.reliability_score() < previous);
        previous = metrics.reliability_score();
    }
    assert!(previous < 0.2);

    let metrics = engine
        .discovery
        .update_metrics(&agent, "code", ExecutionOutcome::success(100.0))
        .await;
    assert!(metrics.success_rate > 0.0 && metrics.success_rate < 1.0);
    assert_eq!(metrics.usage_count, 11);
}

/// Test: Routing adapts to metrics
/// Given two equivalent providers
/// When one of them keeps failing
/// Then discovery prefers the other
#[tokio::test]
async fn test_routing_moves_away_from_failing_agent() {
    let engine = engine();
    engine.registry.register(echo_agent("a", &["code"]));
    engine.registry.register(echo_agent("b", &["code"]));

    let first = engine
        .discovery
        .discover_agent(&DiscoveryOptions::new("code"))
        .await
        .unwrap();
    assert_eq!(first.agent_id, AgentId::from("a"));

    engine
        .discovery
        .update_metrics(&"a".into(), "code", ExecutionOutcome::failure(5000.0))
        .await;

    let second = engine
        .discovery
        .discover_agent(&DiscoveryOptions::new("code"))
        .await
        .unwrap();
    assert_eq!(second.agent_id, AgentId::from("b"));
    assert_eq!(second.alternatives[0].agent_id, AgentId::from("a"));
}

#[tokio::test]
async fn test_registry_changes_are_picked_up() {
    let engine = engine();
    assert!(engine
        .discovery
        .discover_agent(&DiscoveryOptions::new("deploy"))
        .await
        .is_none());

    engine.registry.register(echo_agent("shipper", &["deploy"]));
    let found = engine
        .discovery
        .discover_agent(&DiscoveryOptions::new("deploy"))
        .await
        .unwrap();
    assert_eq!(found.agent_id, AgentId::from("shipper"));

    assert!(engine.registry.remove(&"shipper".into()));
    assert!(engine
        .discovery
        .discover_agent(&DiscoveryOptions::new("deploy"))
        .await
        .is_none());
}

#[tokio::test]
async fn test_requested_capability_clears_once_provided() {
    let engine = engine();
    engine
        .discovery
        .request_capability("translate", "Translate documents")
        .await;
    let again = engine.discovery.request_capability("translate", "").await;
    assert_eq!(again.request_count, 2);
    assert_eq!(again.description, "Translate documents");
    assert_eq!(engine.discovery.requested_capabilities().await.len(), 1);

    engine.registry.register(echo_agent("polyglot", &["translate"]));
    assert!(engine.discovery.requested_capabilities().await.is_empty());

    engine
        .discovery
        .register_capability(Capability::new("summarize", "Summarize text"))
        .await;
    let record = engine.discovery.capability("summarize").await.unwrap();
    assert!(record.providers.is_empty());
}

/// Independent discovery instances keep independent metrics.
#[tokio::test]
async fn test_instances_do_not_share_state() {
    let engine = engine();
    engine.registry.register(echo_agent("a", &["code"]));
    let registry: Arc<dyn AgentRegistry> = engine.registry.clone();
    let other = AgentDiscovery::new(registry, engine.discovery.config().clone());

    engine
        .discovery
        .update_metrics(&"a".into(), "code", ExecutionOutcome::success(10.0))
        .await;
    assert!(engine.discovery.metrics_for(&"a".into(), "code").await.is_some());
    assert!(other.metrics_for(&"a".into(), "code").await.is_none());
}

/// Test: Execution through a similar capability
/// Given a task that needs 'x' and an agent that only provides 'x2'
/// When the plan is executed
/// Then the task is assigned to that agent and completes
#[tokio::test]
async fn test_plan_routes_through_similar_capability() {
    let engine = Engine::new(TableDecomposer::new(vec![(
        "goal",
        vec![
            SubtaskSpec::new("one", "first").with_capabilities(["x"]),
            SubtaskSpec::new("two", "second").with_capabilities(["x"]),
        ],
    )]));
    engine.registry.register(echo_agent("solo", &["x2"]));
    let plan = engine.plan("goal").await;

    let report = engine
        .executor
        .execute_plan(&plan.id, ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(report.status, PlanStatus::Completed);

    let plan = engine.snapshot(&plan.id).await;
    let one = plan.task_by_name("one").unwrap();
    assert_eq!(one.status, TaskStatus::Completed);
    assert_eq!(one.assigned_to, Some(AgentId::from("solo")));
    let metrics = engine
        .discovery
        .metrics_for(&"solo".into(), "x2")
        .await
        .unwrap();
    assert_eq!(metrics.usage_count, 2);
}
