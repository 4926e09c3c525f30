//! Advanced model management for accelerator-resident model components.
//!
//! [`ModelPool`] composes five coordinated parts around a shared
//! component registry and device ledger:
//!
//! - the **component coordinator** plans and executes dependency-aware
//!   parallel loading,
//! - the **cache coordinator** analyzes usage, evicts, pre-loads
//!   predictively, and answers memory-pressure signals,
//! - the **memory optimizer** measures fragmentation, defragments,
//!   detects leaks, and predicts requirements,
//! - the **error handler** classifies every failure and runs bounded
//!   automatic recovery,
//! - the **performance monitor** collects metrics, tracks trends, raises
//!   alerts, and feeds optimization back into the other parts.
//!
//! Model execution itself lives behind the [`workers::WorkerPool`]
//! boundary and is consumed as a capability.

pub mod background;
pub mod cache;
pub mod coordinator;
pub mod memory;
pub mod monitor;
pub mod recovery;
pub mod registry;
pub mod workers;

use background::{BackgroundTasks, ShutdownFlag, spawn_guarded_loop};
use cache::pressure_relief::{PressureContext, PressureReliefReport};
use cache::{CacheCoordinator, CacheOptimizationReport, CacheStrategy};
use coordinator::{
    AllocationOptimization, ComponentCoordinator, DependencyAnalysis, LoadOptions, LoadingResult,
};
use memory::prediction::{MemoryPrediction, ModelInfo};
use memory::{
    DefragStrategy, DefragmentationReport, MemoryHealthReport, MemoryOptimizationReport,
    MemoryOptimizer, MemoryUsageAnalysis, OptimizationLevel,
};
use modelpool_core::{
    ComponentSpec, DeviceId, ModelError, OpReport, OperationContext, PoolConfig,
};
use modelpool_device::{DeviceCapabilities, DeviceLedger};
use monitor::{
    DashboardData, MetricsOptimizationReport, OptimizeRequest, PerformanceMetricsReport,
    PerformanceMonitor, TrendAnalysisReport,
};
use recovery::patterns::{ErrorPatternAnalysis, PreventionRule};
use recovery::{ErrorHandler, ErrorReport};
use registry::ComponentRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};
use workers::{GuardedWorkerPool, WorkerPool};

pub use modelpool_core as core_types;

/// The assembled model-management subsystem.
pub struct ModelPool {
    config: PoolConfig,
    registry: Arc<ComponentRegistry>,
    ledger: Arc<DeviceLedger>,
    recovery: Arc<ErrorHandler>,
    memory: Arc<MemoryOptimizer>,
    cache: Arc<CacheCoordinator>,
    monitor: Arc<PerformanceMonitor>,
    coordinator: Arc<ComponentCoordinator>,
    shutdown: Arc<ShutdownFlag>,
    background: Mutex<BackgroundTasks>,
}

impl ModelPool {
    /// Build the subsystem around an external worker pool. The pool is
    /// wrapped with the worker-boundary circuit breaker; configuration
    /// is validated up front.
    pub fn new(config: PoolConfig, workers: Arc<dyn WorkerPool>) -> Result<Arc<Self>, ModelError> {
        let validation = config.validate();
        if !validation.is_valid {
            return Err(ModelError::Validation(validation.errors.join("; ")));
        }
        for warning in &validation.warnings {
            warn!(warning = %warning, "configuration warning");
        }

        let workers: Arc<dyn WorkerPool> = Arc::new(GuardedWorkerPool::new(
            workers,
            config.recovery.breaker_failure_threshold,
            config.recovery.breaker_cooldown,
        ));
        let shutdown = Arc::new(ShutdownFlag::new());
        let registry = Arc::new(ComponentRegistry::new());
        let ledger = Arc::new(DeviceLedger::new());

        let recovery = Arc::new(ErrorHandler::new(config.recovery.clone(), Arc::clone(&workers)));
        let memory = Arc::new(MemoryOptimizer::new(
            config.memory.clone(),
            Arc::clone(&registry),
            Arc::clone(&ledger),
            Arc::clone(&workers),
            Arc::clone(&shutdown),
        ));
        let cache = Arc::new(CacheCoordinator::new(
            config.cache.clone(),
            Arc::clone(&registry),
            Arc::clone(&ledger),
            Arc::clone(&memory),
            Arc::clone(&workers),
        ));
        recovery.wire(Arc::clone(&memory), Arc::clone(&cache));

        let monitor = Arc::new(PerformanceMonitor::new(
            config.monitor.clone(),
            Arc::clone(&ledger),
            Arc::clone(&cache),
            Arc::clone(&memory),
            Arc::clone(&workers),
        ));
        let coordinator = Arc::new(ComponentCoordinator::new(
            config.coordinator.clone(),
            Arc::clone(&registry),
            Arc::clone(&ledger),
            Arc::clone(&workers),
            Arc::clone(&recovery),
            Arc::clone(&cache),
            Arc::clone(&memory),
            Arc::clone(&monitor),
            Arc::clone(&shutdown),
        ));

        Ok(Arc::new(Self {
            config,
            registry,
            ledger,
            recovery,
            memory,
            cache,
            monitor,
            coordinator,
            shutdown,
            background: Mutex::new(BackgroundTasks::default()),
        }))
    }

    /// Register a device with the ledger and the placement maps.
    pub async fn register_device(&self, capabilities: DeviceCapabilities) {
        self.ledger
            .register_device(capabilities.id, capabilities.total_memory_bytes)
            .await;
        self.memory
            .register_device(capabilities.id, capabilities.total_memory_bytes)
            .await;
        info!(device = %capabilities.id, bytes = capabilities.total_memory_bytes, "device registered");
    }

    /// Register a component definition.
    pub async fn register_component(&self, spec: ComponentSpec) {
        self.coordinator.register_component(spec).await;
    }

    fn report_failure<T>(&self, operation: &str, error: ModelError) -> OpReport<T> {
        let ctx = OperationContext::for_operation(operation);
        OpReport::failed(error, &ctx, false)
    }

    // ── Component coordinator surface ───────────────────────────────

    /// Load a component set with dependencies; see
    /// [`ComponentCoordinator::load_component_set`].
    pub async fn load_component_set(
        &self,
        component_ids: &[String],
        device: Option<DeviceId>,
        options: LoadOptions,
    ) -> OpReport<LoadingResult> {
        match self.coordinator.load_component_set(component_ids, device, options).await {
            Ok(result) if result.recovered_loads > 0 => {
                let attempts = result.recovered_loads;
                OpReport::after_recovery(result, attempts)
            }
            Ok(result) => OpReport::succeeded(result),
            Err(err) => self.report_failure("load_component_set", err),
        }
    }

    pub async fn analyze_component_dependencies(
        &self,
        model: &str,
    ) -> OpReport<DependencyAnalysis> {
        match self.coordinator.analyze_component_dependencies(model).await {
            Ok(analysis) => OpReport::succeeded(analysis),
            Err(err) => self.report_failure("analyze_component_dependencies", err),
        }
    }

    pub async fn optimize_component_allocation(
        &self,
        component_ids: &[String],
        device: DeviceId,
        level: OptimizationLevel,
    ) -> OpReport<AllocationOptimization> {
        match self
            .coordinator
            .optimize_component_allocation(component_ids, device, level)
            .await
        {
            Ok(result) => OpReport::succeeded(result),
            Err(err) => self.report_failure("optimize_component_allocation", err),
        }
    }

    // ── Cache coordinator surface ───────────────────────────────────

    pub async fn optimize_cache(
        &self,
        strategy: CacheStrategy,
        analysis_window: Option<Duration>,
        enable_predictive: Option<bool>,
    ) -> OpReport<CacheOptimizationReport> {
        match self.cache.optimize_cache(strategy, analysis_window, enable_predictive).await {
            Ok(report) => OpReport::succeeded(report),
            Err(err) => self.report_failure("optimize_cache", err),
        }
    }

    pub async fn handle_memory_pressure(
        &self,
        ctx: PressureContext,
    ) -> OpReport<PressureReliefReport> {
        match self.cache.handle_memory_pressure(ctx).await {
            Ok(report) => OpReport::succeeded(report),
            Err(err) => self.report_failure("handle_memory_pressure", err),
        }
    }

    // ── Memory optimizer surface ────────────────────────────────────

    pub async fn optimize_model_memory(
        &self,
        device: Option<DeviceId>,
        level: OptimizationLevel,
    ) -> OpReport<MemoryOptimizationReport> {
        match self.memory.optimize_model_memory(device, level).await {
            Ok(report) => OpReport::succeeded(report),
            Err(err) => self.report_failure("optimize_model_memory", err),
        }
    }

    pub async fn analyze_memory_usage_patterns(
        &self,
        device: Option<DeviceId>,
        period: Duration,
    ) -> OpReport<MemoryUsageAnalysis> {
        match self.memory.analyze_memory_usage_patterns(device, period).await {
            Ok(analysis) => OpReport::succeeded(analysis),
            Err(err) => self.report_failure("analyze_memory_usage_patterns", err),
        }
    }

    pub async fn defragment_model_memory(
        &self,
        device: Option<DeviceId>,
        strategy: DefragStrategy,
        force: bool,
    ) -> OpReport<DefragmentationReport> {
        match self.memory.defragment_model_memory(device, strategy, force).await {
            Ok(report) => OpReport::succeeded(report),
            Err(err) => self.report_failure("defragment_model_memory", err),
        }
    }

    pub async fn predict_memory_requirements(
        &self,
        operation_type: &str,
        model_infos: &[ModelInfo],
        device: Option<DeviceId>,
    ) -> OpReport<MemoryPrediction> {
        let active_sessions = self.coordinator.active_session_count().await;
        match self
            .memory
            .predict_memory_requirements(operation_type, model_infos, device, active_sessions)
            .await
        {
            Ok(prediction) => OpReport::succeeded(prediction),
            Err(err) => self.report_failure("predict_memory_requirements", err),
        }
    }

    pub async fn monitor_memory_health(
        &self,
        device: Option<DeviceId>,
    ) -> OpReport<MemoryHealthReport> {
        match self.memory.monitor_memory_health(device).await {
            Ok(report) => OpReport::succeeded(report),
            Err(err) => self.report_failure("monitor_memory_health", err),
        }
    }

    // ── Error handler surface ───────────────────────────────────────

    /// Classify and recover from a failure raised by a collaborator.
    pub async fn handle_model_error(
        &self,
        error: ModelError,
        ctx: OperationContext,
    ) -> ErrorReport {
        self.recovery.handle_error(error, ctx).await
    }

    pub async fn analyze_error_patterns(&self) -> ErrorPatternAnalysis {
        self.recovery.analyze_error_patterns().await
    }

    pub async fn configure_error_prevention(&self, rules: Vec<PreventionRule>) {
        self.recovery.configure_error_prevention(rules).await;
    }

    // ── Performance monitor surface ─────────────────────────────────

    pub async fn collect_model_performance_metrics(
        &self,
        device: Option<DeviceId>,
        period: Option<Duration>,
    ) -> PerformanceMetricsReport {
        self.monitor.collect_model_performance_metrics(device, period).await
    }

    pub async fn analyze_performance_trends(&self, window: usize) -> TrendAnalysisReport {
        self.monitor.analyze_performance_trends(window).await
    }

    pub async fn configure_performance_alerts(
        &self,
        thresholds: modelpool_core::AlertThresholds,
    ) {
        self.monitor.configure_performance_alerts(thresholds).await;
    }

    pub async fn optimize_based_on_metrics(
        &self,
        request: OptimizeRequest,
    ) -> MetricsOptimizationReport {
        self.monitor.optimize_based_on_metrics(request).await
    }

    pub async fn get_performance_dashboard_data(
        &self,
        device: Option<DeviceId>,
    ) -> DashboardData {
        self.monitor.get_performance_dashboard_data(device).await
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Spawn the four periodic maintenance passes. Idempotent.
    pub async fn start_background_tasks(&self) {
        let mut tasks = self.background.lock().await;
        if !tasks.is_empty() {
            return;
        }

        let cache = Arc::clone(&self.cache);
        let coordinator = Arc::clone(&self.coordinator);
        tasks.push(spawn_guarded_loop(
            "cache-optimization",
            self.config.cache.optimization_interval,
            Arc::clone(&self.shutdown),
            self.cache.background_guard(),
            move || {
                let cache = Arc::clone(&cache);
                let coordinator = Arc::clone(&coordinator);
                async move {
                    cache.background_pass().await;
                    coordinator.sweep_sessions().await;
                }
            },
        ));

        let memory = Arc::clone(&self.memory);
        tasks.push(spawn_guarded_loop(
            "memory-health",
            self.config.memory.health_check_interval,
            Arc::clone(&self.shutdown),
            self.memory.health_guard(),
            move || {
                let memory = Arc::clone(&memory);
                async move { memory.health_pass().await }
            },
        ));

        let memory = Arc::clone(&self.memory);
        tasks.push(spawn_guarded_loop(
            "defrag-check",
            self.config.memory.defrag_check_interval,
            Arc::clone(&self.shutdown),
            self.memory.defrag_guard(),
            move || {
                let memory = Arc::clone(&memory);
                async move { memory.defrag_check_pass().await }
            },
        ));

        let monitor = Arc::clone(&self.monitor);
        tasks.push(spawn_guarded_loop(
            "metrics-collection",
            self.config.monitor.collection_interval,
            Arc::clone(&self.shutdown),
            self.monitor.collection_guard(),
            move || {
                let monitor = Arc::clone(&monitor);
                async move { monitor.collection_pass().await }
            },
        ));

        info!(tasks = tasks.len(), "background maintenance tasks started");
    }

    /// Graceful shutdown: reject new sessions, drain in-flight ones up
    /// to the deadline, then stop the background loops.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.shutdown.trigger();

        let drain_started = Instant::now();
        let poll = Duration::from_millis(50);
        loop {
            let active = self.coordinator.active_session_count().await;
            if active == 0 {
                info!("all loading sessions drained");
                break;
            }
            if drain_started.elapsed() >= drain_timeout {
                warn!(active, "shutdown drain deadline exceeded with sessions in flight");
                break;
            }
            tokio::time::sleep(poll).await;
        }

        self.background.lock().await.abort_all();
        info!("model pool shut down");
    }

    // ── Shared-state accessors ──────────────────────────────────────

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<DeviceLedger> {
        &self.ledger
    }

    pub fn cache(&self) -> &Arc<CacheCoordinator> {
        &self.cache
    }

    pub fn memory_optimizer(&self) -> &Arc<MemoryOptimizer> {
        &self.memory
    }

    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.recovery
    }

    pub fn performance_monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn component_coordinator(&self) -> &Arc<ComponentCoordinator> {
        &self.coordinator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::SimulatedWorkerPool;

    #[tokio::test]
    async fn invalid_config_is_rejected_at_construction() {
        let mut config = PoolConfig::default();
        config.coordinator.max_concurrent_loads = 0;
        let err = ModelPool::new(config, Arc::new(SimulatedWorkerPool::new()))
            .err()
            .expect("zero concurrency must be rejected");
        assert!(matches!(err, ModelError::Validation(_)));
    }

    #[tokio::test]
    async fn background_tasks_start_once() {
        let pool = ModelPool::new(PoolConfig::default(), Arc::new(SimulatedWorkerPool::new()))
            .unwrap();
        pool.start_background_tasks().await;
        assert_eq!(pool.background.lock().await.len(), 4);
        pool.start_background_tasks().await;
        assert_eq!(pool.background.lock().await.len(), 4);
        pool.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn shutdown_rejects_new_sessions() {
        let pool = ModelPool::new(PoolConfig::default(), Arc::new(SimulatedWorkerPool::new()))
            .unwrap();
        pool.register_device(DeviceCapabilities::new(DeviceId::cuda(0), 1024)).await;
        pool.shutdown(Duration::from_millis(50)).await;

        let report = pool
            .load_component_set(&["x".to_string()], None, LoadOptions::default())
            .await;
        assert!(!report.is_success());
    }
}
