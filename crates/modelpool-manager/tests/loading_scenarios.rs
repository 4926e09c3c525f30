//! End-to-end loading scenarios through the assembled pool.

use modelpool_core::{ComponentSpec, ComponentType, DeviceId, ModelError, PoolConfig};
use modelpool_device::DeviceCapabilities;
use modelpool_manager::ModelPool;
use modelpool_manager::coordinator::LoadOptions;
use modelpool_manager::coordinator::session::SessionStatus;
use modelpool_manager::workers::SimulatedWorkerPool;
use std::sync::Arc;
use std::time::Duration;

const DEV: DeviceId = DeviceId::cuda(0);

fn fast_config() -> PoolConfig {
    let mut config = PoolConfig::default();
    config.recovery.max_attempts = 2;
    config.recovery.initial_backoff = Duration::from_millis(1);
    config.recovery.max_backoff = Duration::from_millis(4);
    config.recovery.breaker_failure_threshold = 1_000;
    config
}

async fn pool_with(capacity: u64, workers: Arc<SimulatedWorkerPool>) -> Arc<ModelPool> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let pool = ModelPool::new(fast_config(), workers).unwrap();
    pool.register_device(DeviceCapabilities::new(DEV, capacity)).await;
    pool
}

fn spec(id: &str, bytes: u64, deps: &[&str]) -> ComponentSpec {
    ComponentSpec::new(id, "sd-xl", ComponentType::Denoiser, bytes)
        .with_dependencies(deps.iter().copied())
}

fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn chain_loads_in_dependency_order() {
    let workers = Arc::new(SimulatedWorkerPool::new());
    let pool = pool_with(10_000, workers).await;
    pool.register_component(spec("a", 100, &[])).await;
    pool.register_component(spec("b", 100, &["a"])).await;
    pool.register_component(spec("c", 100, &["b"])).await;

    let report = pool
        .load_component_set(&ids(&["c", "b", "a"]), Some(DEV), LoadOptions::default())
        .await;
    assert!(report.is_success());
    let result = report.payload.unwrap();
    assert_eq!(result.status, SessionStatus::Completed);

    let mut loaded = result.loaded.clone();
    loaded.sort();
    assert_eq!(loaded, ids(&["a", "b", "c"]));

    // The retained session exposes the batch plan: one batch per level.
    let session = pool
        .component_coordinator()
        .session(&result.session_id)
        .await
        .expect("session retained after completion");
    assert_eq!(session.plan, vec![ids(&["a"]), ids(&["b"]), ids(&["c"])]);
}

#[tokio::test]
async fn dependencies_load_even_when_not_requested() {
    let workers = Arc::new(SimulatedWorkerPool::new());
    let pool = pool_with(10_000, workers).await;
    pool.register_component(spec("base", 100, &[])).await;
    pool.register_component(spec("adapter", 50, &["base"])).await;

    let report = pool
        .load_component_set(&ids(&["adapter"]), Some(DEV), LoadOptions::default())
        .await;
    let result = report.payload.unwrap();
    assert_eq!(result.status, SessionStatus::Completed);
    assert!(result.loaded.contains(&"base".to_string()));
    assert!(result.loaded.contains(&"adapter".to_string()));
}

#[tokio::test]
async fn oversubscribed_request_ends_in_partial_failure_not_crash() {
    let workers = Arc::new(SimulatedWorkerPool::new());
    let pool = pool_with(300, workers).await;
    for i in 0..5 {
        pool.register_component(spec(&format!("c{i}"), 100, &[])).await;
    }

    let requested: Vec<String> = (0..5).map(|i| format!("c{i}")).collect();
    let report = pool.load_component_set(&requested, Some(DEV), LoadOptions::default()).await;

    // Three fit, two cannot; the result lists them instead of failing
    // the whole request.
    let result = match report.payload {
        Some(result) => result,
        None => panic!("expected a payload, got {:?}", report.failure),
    };
    assert_eq!(result.status, SessionStatus::PartialFailure);
    assert_eq!(result.loaded.len(), 3);
    assert_eq!(result.failed.len(), 2);
    for failed in &result.failed {
        assert!(
            matches!(
                failed.error,
                ModelError::InsufficientMemory { .. } | ModelError::AllocationFailed { .. }
            ),
            "unexpected error: {:?}",
            failed.error
        );
    }
}

#[tokio::test]
async fn failed_component_skips_dependents_but_not_siblings() {
    let workers = Arc::new(SimulatedWorkerPool::new());
    let pool = pool_with(150, workers).await;
    // `root` cannot fit; `child` depends on it; `other` is independent.
    pool.register_component(spec("root", 200, &[])).await;
    pool.register_component(spec("child", 10, &["root"])).await;
    pool.register_component(spec("other", 10, &[])).await;

    let report = pool
        .load_component_set(&ids(&["root", "child", "other"]), Some(DEV), LoadOptions::default())
        .await;
    let result = report.payload.unwrap();
    assert_eq!(result.status, SessionStatus::PartialFailure);

    assert!(result.loaded.contains(&"other".to_string()), "independent sibling blocked");
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].component_id, "root");
    assert_eq!(result.skipped.len(), 1);
    assert_eq!(result.skipped[0].component_id, "child");
    assert_eq!(result.skipped[0].failed_dependency, "root");
}

#[tokio::test]
async fn cyclic_dependencies_fail_fast() {
    let workers = Arc::new(SimulatedWorkerPool::new());
    let pool = pool_with(10_000, workers).await;
    pool.register_component(spec("a", 10, &["b"])).await;
    pool.register_component(spec("b", 10, &["a"])).await;

    let report = pool
        .load_component_set(&ids(&["a", "b"]), Some(DEV), LoadOptions::default())
        .await;
    assert!(!report.is_success());
    let failure = report.failure.unwrap();
    assert!(
        matches!(failure.error, ModelError::DependencyCycle { .. }),
        "expected cycle error, got {:?}",
        failure.error
    );
}

#[tokio::test]
async fn every_session_ends_in_exactly_one_terminal_status() {
    let workers = Arc::new(SimulatedWorkerPool::new());
    let pool = pool_with(10_000, workers).await;
    pool.register_component(spec("a", 100, &[])).await;

    let report = pool
        .load_component_set(&ids(&["a"]), Some(DEV), LoadOptions::default())
        .await;
    let result = report.payload.unwrap();

    let session = pool
        .component_coordinator()
        .session(&result.session_id)
        .await
        .unwrap();
    assert!(session.status.is_terminal());
    assert!(session.ended_at.is_some());
    assert_eq!(session.progress_percent, 100.0);
    assert_eq!(pool.component_coordinator().active_session_count().await, 0);
}

#[tokio::test]
async fn concurrent_loads_never_exceed_the_global_limit() {
    let workers = Arc::new(SimulatedWorkerPool::new().with_latency(Duration::from_millis(20)));
    let mut config = fast_config();
    config.coordinator.max_concurrent_loads = 2;
    config.coordinator.max_parallel_per_batch = 8;
    let pool = ModelPool::new(config, workers).unwrap();
    pool.register_device(DeviceCapabilities::new(DEV, 10_000)).await;
    for i in 0..8 {
        pool.register_component(spec(&format!("c{i}"), 10, &[])).await;
    }

    let requested: Vec<String> = (0..8).map(|i| format!("c{i}")).collect();
    let report = pool.load_component_set(&requested, Some(DEV), LoadOptions::default()).await;
    assert!(report.is_success());

    let stats = pool.component_coordinator().load_stats();
    assert!(stats.peak_loads >= 1);
    assert!(
        stats.peak_loads <= 2,
        "observed {} simultaneous loads with a limit of 2",
        stats.peak_loads
    );
}

#[tokio::test]
async fn resident_components_are_not_reloaded() {
    let workers = Arc::new(SimulatedWorkerPool::new());
    let pool = pool_with(10_000, Arc::clone(&workers)).await;
    pool.register_component(spec("a", 100, &[])).await;

    let first = pool
        .load_component_set(&ids(&["a"]), Some(DEV), LoadOptions::default())
        .await;
    assert!(first.is_success());
    let calls_after_first = workers.calls_for(modelpool_core::worker::ops::LOAD_COMPONENT).await;

    let second = pool
        .load_component_set(&ids(&["a"]), Some(DEV), LoadOptions::default())
        .await;
    let result = second.payload.unwrap();
    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.loaded, ids(&["a"]));
    assert_eq!(
        workers.calls_for(modelpool_core::worker::ops::LOAD_COMPONENT).await,
        calls_after_first,
        "already-resident component was reloaded"
    );
}

#[tokio::test]
async fn dependency_analysis_is_cached_per_model() {
    let workers = Arc::new(SimulatedWorkerPool::new());
    let pool = pool_with(10_000, workers).await;
    pool.register_component(spec("a", 10, &[])).await;
    pool.register_component(spec("b", 10, &["a"])).await;

    let first = pool.analyze_component_dependencies("sd-xl").await;
    let first = first.payload.unwrap();
    assert!(!first.from_cache);
    assert_eq!(first.component_count, 2);
    assert_eq!(first.critical_path_len, 2);

    let second = pool.analyze_component_dependencies("sd-xl").await;
    assert!(second.payload.unwrap().from_cache);

    // Registering a component invalidates the model's cached graph.
    pool.register_component(spec("c", 10, &["b"])).await;
    let third = pool.analyze_component_dependencies("sd-xl").await;
    let third = third.payload.unwrap();
    assert!(!third.from_cache);
    assert_eq!(third.component_count, 3);
}
