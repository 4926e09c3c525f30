//! Memory pressure, cache optimization, and monitoring through the
//! assembled pool.

use modelpool_core::worker::ops;
use modelpool_core::{
    ComponentSpec, ComponentType, DeviceId, MemoryPressure, PoolConfig,
};
use modelpool_device::DeviceCapabilities;
use modelpool_manager::ModelPool;
use modelpool_manager::cache::CacheStrategy;
use modelpool_manager::cache::pressure_relief::PressureContext;
use modelpool_manager::coordinator::LoadOptions;
use modelpool_manager::memory::HealthStatus;
use modelpool_manager::monitor::OptimizeRequest;
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
    config.monitor.settle_delay = Duration::from_millis(10);
    config.cache.predictive.confidence_threshold = 0.6;
    config
}

async fn pool_with(capacity: u64, workers: Arc<SimulatedWorkerPool>) -> Arc<ModelPool> {
    let pool = ModelPool::new(fast_config(), workers).unwrap();
    pool.register_device(DeviceCapabilities::new(DEV, capacity)).await;
    pool
}

fn spec(id: &str, bytes: u64) -> ComponentSpec {
    ComponentSpec::new(id, "sd-xl", ComponentType::Adapter, bytes)
}

async fn load_one(pool: &ModelPool, id: &str, bytes: u64) {
    pool.register_component(spec(id, bytes)).await;
    let report = pool
        .load_component_set(&[id.to_string()], Some(DEV), LoadOptions::default())
        .await;
    assert!(report.is_success(), "fixture load failed: {:?}", report.failure);
}

#[tokio::test]
async fn critical_pressure_runs_local_relief_before_any_worker_call() {
    let workers = Arc::new(SimulatedWorkerPool::new());
    let pool = pool_with(1_000, Arc::clone(&workers)).await;
    load_one(&pool, "big", 980).await;
    // Pin so local evictions cannot clear the pressure and the ladder
    // must walk to the worker rung.
    pool.ledger().pin(DEV, "big").await;

    let report = pool
        .handle_memory_pressure(PressureContext { device: DEV, observed_level: None })
        .await;
    let relief = report.payload.unwrap();
    assert_eq!(relief.initial_level, MemoryPressure::Critical);

    let worker_rung = relief
        .actions
        .iter()
        .position(|a| a.description.contains("worker-pool"))
        .expect("worker rung never reached");
    assert!(
        worker_rung >= 1,
        "worker-pool call must come after local relief actions: {:?}",
        relief.actions
    );
    assert_eq!(workers.calls_for(ops::EXECUTE_CACHE_OPTIMIZATION).await, 1);
}

#[tokio::test]
async fn pressure_relief_stops_as_soon_as_level_clears() {
    let workers = Arc::new(SimulatedWorkerPool::new());
    let pool = pool_with(1_000, workers).await;
    load_one(&pool, "cold-a", 300).await;
    load_one(&pool, "cold-b", 300).await;

    let report = pool
        .handle_memory_pressure(PressureContext { device: DEV, observed_level: None })
        .await;
    let relief = report.payload.unwrap();
    assert_eq!(relief.initial_level, MemoryPressure::Medium);
    assert!(relief.cleared);
    assert_eq!(relief.actions.len(), 1, "later rungs ran after clearing: {:?}", relief.actions);
    assert!(relief.final_level < MemoryPressure::Medium);
}

#[tokio::test]
async fn repeated_optimization_without_activity_frees_monotonically_less() {
    let workers = Arc::new(SimulatedWorkerPool::new());
    let pool = pool_with(1_000, workers).await;
    load_one(&pool, "a", 200).await;
    load_one(&pool, "b", 300).await;

    let first = pool
        .optimize_cache(CacheStrategy::Balanced, Some(Duration::from_secs(60)), Some(false))
        .await
        .payload
        .unwrap();
    let second = pool
        .optimize_cache(CacheStrategy::Balanced, Some(Duration::from_secs(60)), Some(false))
        .await
        .payload
        .unwrap();

    assert!(first.bytes_freed >= second.bytes_freed);
    assert_eq!(second.bytes_freed, 0);
}

#[tokio::test]
async fn pinned_components_survive_optimization() {
    let workers = Arc::new(SimulatedWorkerPool::new());
    let pool = pool_with(1_000, workers).await;
    load_one(&pool, "keep", 300).await;
    pool.ledger().pin(DEV, "keep").await;

    let report = pool
        .optimize_cache(CacheStrategy::Aggressive, Some(Duration::from_secs(60)), Some(false))
        .await
        .payload
        .unwrap();
    assert!(!report.evicted.contains(&"keep".to_string()));
    assert!(pool.registry().state("keep").await.unwrap().is_loaded());
}

#[tokio::test]
async fn predictive_caching_preloads_active_but_unloaded_components() {
    let workers = Arc::new(SimulatedWorkerPool::new());
    let pool = pool_with(1_000, Arc::clone(&workers)).await;
    pool.register_component(spec("warm", 100)).await;
    for _ in 0..8 {
        pool.registry().record_access("warm").await;
    }

    let report = pool
        .optimize_cache(CacheStrategy::Balanced, Some(Duration::from_secs(600)), Some(true))
        .await
        .payload
        .unwrap();
    let predictive = report.predictive.expect("predictive pass did not run");
    assert_eq!(predictive.materialized, vec!["warm".to_string()]);
    assert!(pool.registry().state("warm").await.unwrap().is_loaded());
    assert_eq!(pool.cache().predictive_entry_count().await, 1);
    assert!(workers.calls_for(ops::LOAD_COMPONENT).await >= 1);
}

#[tokio::test]
async fn defragmentation_is_reported_through_the_facade() {
    let workers = Arc::new(SimulatedWorkerPool::new());
    let pool = pool_with(1_000, workers).await;
    load_one(&pool, "a", 300).await;
    load_one(&pool, "b", 300).await;
    load_one(&pool, "c", 300).await;
    pool.cache().evict_component("b", "test hole").await.unwrap();

    let report = pool
        .defragment_model_memory(Some(DEV), modelpool_manager::memory::DefragStrategy::Compact, true)
        .await
        .payload
        .unwrap();
    let device_report = &report.devices[0];
    assert!(device_report.performed);
    assert!(device_report.fragmentation_after <= device_report.fragmentation_before);
}

#[tokio::test]
async fn health_and_alerts_degrade_under_load() {
    let workers = Arc::new(SimulatedWorkerPool::new());
    let pool = pool_with(1_000, workers).await;

    let healthy = pool.monitor_memory_health(Some(DEV)).await.payload.unwrap();
    assert_eq!(healthy.health, HealthStatus::Excellent);

    load_one(&pool, "big", 960).await;
    let strained = pool.monitor_memory_health(Some(DEV)).await.payload.unwrap();
    assert_eq!(strained.health, HealthStatus::Critical);

    let metrics = pool.collect_model_performance_metrics(None, None).await;
    assert!(
        metrics.alerts.iter().any(|a| a.metric == "memory_usage_percent"),
        "expected memory alert, got {:?}",
        metrics.alerts
    );

    let dashboard = pool.get_performance_dashboard_data(None).await;
    assert!(!dashboard.active_alerts.is_empty());
}

#[tokio::test]
async fn metrics_driven_optimization_closes_the_loop() {
    let workers = Arc::new(SimulatedWorkerPool::new());
    let pool = pool_with(1_000, workers).await;
    pool.register_component(spec("absent", 10)).await;
    for _ in 0..10 {
        pool.cache().lookup("absent").await;
    }

    let report = pool.optimize_based_on_metrics(OptimizeRequest::default()).await;
    assert!(!report.bottlenecks.is_empty());
    assert!(!report.actions.is_empty());
    // Before/after snapshots are both present for effectiveness math.
    assert!(report.before.cache_hit_rate <= 1.0);
    assert!(report.after.cache_hit_rate <= 1.0);
}

#[tokio::test]
async fn memory_analysis_reports_leak_suspects_and_recommendations() {
    let workers = Arc::new(SimulatedWorkerPool::new());
    let pool = pool_with(1_000, workers).await;

    // Resident without a single recorded access: residency that only
    // sits there reads as a suspected leak.
    pool.register_component(spec("stale", 400)).await;
    pool.memory_optimizer().admit(DEV, "stale", 400).await.unwrap();
    pool.registry()
        .set_state("stale", modelpool_core::ComponentState::Loaded, Some(DEV))
        .await
        .unwrap();

    let analysis = pool
        .analyze_memory_usage_patterns(Some(DEV), Duration::from_secs(60))
        .await
        .payload
        .unwrap();
    assert_eq!(analysis.devices.len(), 1);
    assert!(analysis.leak_suspects.iter().any(|s| s.component_id == "stale"));
    assert!(!analysis.recommendations.is_empty());
}
