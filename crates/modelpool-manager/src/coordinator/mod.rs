//! Component loading orchestration.
//!
//! A load request becomes a [`LoadingSession`]: the dependency graph is
//! built and validated, components are grouped into batches where every
//! dependency lives in an earlier batch, and batches execute strictly in
//! sequence with components inside a batch loading in parallel under the
//! global concurrency limiter. A failed component never blocks sibling
//! branches that do not depend on it; its dependents are skipped and the
//! session ends in `PartialFailure`.

pub mod graph;
pub mod session;

use crate::background::ShutdownFlag;
use crate::cache::{CacheCoordinator, CacheStrategy};
use crate::memory::prediction::ModelInfo;
use crate::memory::{MemoryOptimizer, OptimizationLevel};
use crate::monitor::PerformanceMonitor;
use crate::recovery::patterns::LoadAdmission;
use crate::recovery::{ErrorHandler, RecoveryOutcome};
use crate::registry::ComponentRegistry;
use crate::workers::WorkerPool;
use graph::{DependencyGraph, GraphCache};
use modelpool_core::worker::ops;
use modelpool_core::{
    ComponentSpec, ComponentState, CoordinatorConfig, DeviceId, ModelError, OperationContext,
    WorkerRequest,
};
use modelpool_device::{DeviceLedger, MemoryReporter};
use serde::Serialize;
use serde_json::json;
use session::{ComponentLoadResult, LoadingSession, SessionStatus, SessionTable};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Per-request overrides.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub load_timeout: Option<Duration>,
    pub max_parallel_per_batch: Option<usize>,
}

/// One component that could not be loaded.
#[derive(Debug, Clone, Serialize)]
pub struct FailedLoad {
    pub component_id: String,
    pub error: ModelError,
}

/// One component skipped because a dependency failed.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedLoad {
    pub component_id: String,
    pub failed_dependency: String,
}

/// Caller-facing outcome of a load request.
#[derive(Debug, Clone, Serialize)]
pub struct LoadingResult {
    pub session_id: String,
    pub status: SessionStatus,
    pub device: DeviceId,
    pub loaded: Vec<String>,
    pub failed: Vec<FailedLoad>,
    pub skipped: Vec<SkippedLoad>,
    /// Loads that succeeded only after automatic recovery.
    pub recovered_loads: u32,
    pub total_time_ms: u64,
}

/// Read-only dependency analysis for one model.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyAnalysis {
    pub model: String,
    pub component_count: usize,
    pub levels: Vec<Vec<String>>,
    pub critical_path_len: usize,
    pub from_cache: bool,
    pub worker_analysis_error: Option<String>,
}

/// Outcome of a post-load allocation pass.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationOptimization {
    pub device: DeviceId,
    pub relocated: Vec<String>,
    pub evicted_for_room: Vec<String>,
    pub bytes_freed: u64,
}

/// Concurrency instrumentation.
#[derive(Debug, Clone, Serialize)]
pub struct LoadConcurrencyStats {
    pub active_loads: usize,
    pub peak_loads: usize,
    pub limit: usize,
}

/// The component coordinator.
pub struct ComponentCoordinator {
    config: CoordinatorConfig,
    registry: Arc<ComponentRegistry>,
    ledger: Arc<DeviceLedger>,
    workers: Arc<dyn WorkerPool>,
    recovery: Arc<ErrorHandler>,
    cache: Arc<CacheCoordinator>,
    memory: Arc<MemoryOptimizer>,
    monitor: Arc<PerformanceMonitor>,
    graphs: GraphCache,
    sessions: SessionTable,
    load_semaphore: Arc<Semaphore>,
    active_loads: AtomicUsize,
    peak_loads: AtomicUsize,
    shutdown: Arc<ShutdownFlag>,
}

impl ComponentCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<ComponentRegistry>,
        ledger: Arc<DeviceLedger>,
        workers: Arc<dyn WorkerPool>,
        recovery: Arc<ErrorHandler>,
        cache: Arc<CacheCoordinator>,
        memory: Arc<MemoryOptimizer>,
        monitor: Arc<PerformanceMonitor>,
        shutdown: Arc<ShutdownFlag>,
    ) -> Self {
        let load_semaphore = Arc::new(Semaphore::new(config.max_concurrent_loads));
        let graphs = GraphCache::new(config.graph_cache_capacity);
        let sessions = SessionTable::new(config.session_retention);
        Self {
            config,
            registry,
            ledger,
            workers,
            recovery,
            cache,
            memory,
            monitor,
            graphs,
            sessions,
            load_semaphore,
            active_loads: AtomicUsize::new(0),
            peak_loads: AtomicUsize::new(0),
            shutdown,
        }
    }

    /// Register a component; the model's cached graph is invalidated
    /// because its definition changed.
    pub async fn register_component(&self, spec: ComponentSpec) {
        self.graphs.invalidate(&spec.model).await;
        self.registry.register(spec).await;
    }

    pub async fn session(&self, session_id: &str) -> Option<LoadingSession> {
        self.sessions.get(session_id).await
    }

    pub async fn active_session_count(&self) -> usize {
        self.sessions.active_sessions().await.len()
    }

    pub async fn sweep_sessions(&self) -> usize {
        self.sessions.sweep().await
    }

    pub fn load_stats(&self) -> LoadConcurrencyStats {
        LoadConcurrencyStats {
            active_loads: self.active_loads.load(Ordering::Relaxed),
            peak_loads: self.peak_loads.load(Ordering::Relaxed),
            limit: self.config.max_concurrent_loads,
        }
    }

    /// Transitive dependency closure of the requested ids, resolved
    /// against the registry.
    async fn resolve_closure(&self, requested: &[String]) -> Result<Vec<ComponentSpec>, ModelError> {
        let mut resolved: HashMap<String, ComponentSpec> = HashMap::new();
        let mut stack: Vec<String> = requested.to_vec();
        while let Some(id) = stack.pop() {
            if resolved.contains_key(&id) {
                continue;
            }
            let spec = self
                .registry
                .spec(&id)
                .await
                .ok_or_else(|| ModelError::Validation(format!("unknown component {id}")))?;
            stack.extend(spec.dependencies.iter().cloned());
            resolved.insert(id, spec);
        }
        let mut specs: Vec<ComponentSpec> = resolved.into_values().collect();
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(specs)
    }

    /// Pick the device with the most free memory when the caller did
    /// not bind the request.
    async fn pick_device(&self) -> Result<DeviceId, ModelError> {
        let usage = self.ledger.usage_snapshot().await;
        usage
            .iter()
            .max_by_key(|u| u.capacity_bytes.saturating_sub(u.resident_bytes))
            .map(|u| u.device)
            .ok_or_else(|| ModelError::Validation("no devices registered".into()))
    }

    /// Load a component set with its dependencies onto one device.
    pub async fn load_component_set(
        &self,
        component_ids: &[String],
        device: Option<DeviceId>,
        options: LoadOptions,
    ) -> Result<LoadingResult, ModelError> {
        if self.shutdown.is_triggered() {
            return Err(ModelError::Validation("subsystem is shutting down".into()));
        }
        if component_ids.is_empty() {
            return Err(ModelError::Validation("empty component set".into()));
        }
        let started = Instant::now();
        let device = match device {
            Some(d) => d,
            None => self.pick_device().await?,
        };

        let session_id = self.sessions.open(component_ids.to_vec(), device).await;
        info!(session_id = %session_id, device = %device, components = component_ids.len(), "loading session opened");

        match self
            .run_session(&session_id, component_ids, device, &options, started)
            .await
        {
            Ok(result) => Ok(result),
            Err(err) => {
                self.sessions.close(&session_id, SessionStatus::Failed).await;
                self.recovery
                    .note_failure(
                        &err,
                        &OperationContext::for_operation("load_component_set")
                            .with_device(device)
                            .with_session(session_id),
                    )
                    .await;
                Err(err)
            }
        }
    }

    async fn run_session(
        &self,
        session_id: &str,
        component_ids: &[String],
        device: DeviceId,
        options: &LoadOptions,
        started: Instant,
    ) -> Result<LoadingResult, ModelError> {
        // Analyzing: resolve the closure and validate the graph.
        let specs = self.resolve_closure(component_ids).await?;
        let graph = self.graph_for(&specs).await?;

        // Planning: everything in the closure that is not already
        // resident, leveled and chunked.
        self.sessions
            .advance(session_id, SessionStatus::Planning, "planning batches")
            .await;
        let mut to_load: HashSet<String> = HashSet::new();
        let mut already_resident = Vec::new();
        for spec in &specs {
            if self.registry.state(&spec.id).await.is_some_and(|s| s.is_loaded()) {
                already_resident.push(spec.id.clone());
            } else {
                to_load.insert(spec.id.clone());
            }
        }
        let max_parallel = options
            .max_parallel_per_batch
            .unwrap_or(self.config.max_parallel_per_batch);
        let plan = graph.plan_for(&to_load, max_parallel);
        self.sessions.set_plan(session_id, plan.clone()).await;

        // Pin every component the session references: resident ones on
        // their device now, loading ones as they land.
        let mut pinned: Vec<(DeviceId, String)> = Vec::new();
        for id in &already_resident {
            if let Some(resident_device) = self.registry.device(id).await {
                self.ledger.pin(resident_device, id).await;
                pinned.push((resident_device, id.clone()));
            }
        }

        let outcome = self
            .validate_and_execute(session_id, &specs, plan, device, options, &mut pinned)
            .await;

        for (pin_device, id) in pinned {
            self.ledger.unpin(pin_device, &id).await;
        }
        let (failed_ids, recovered_loads) = outcome?;

        // Session closure: exactly one terminal status.
        let session = self
            .sessions
            .get(session_id)
            .await
            .ok_or_else(|| ModelError::Validation(format!("session {session_id} disappeared")))?;
        let mut loaded = already_resident;
        let mut failed = Vec::new();
        let mut skipped = Vec::new();
        for result in &session.results {
            if result.success {
                loaded.push(result.component_id.clone());
            } else if let Some(dep) = &result.skipped_on {
                skipped.push(SkippedLoad {
                    component_id: result.component_id.clone(),
                    failed_dependency: dep.clone(),
                });
            } else {
                failed.push(FailedLoad {
                    component_id: result.component_id.clone(),
                    error: result
                        .error
                        .clone()
                        .unwrap_or_else(|| ModelError::Unknown("missing error detail".into())),
                });
            }
        }

        let status = if failed.is_empty() && skipped.is_empty() && failed_ids.is_empty() {
            SessionStatus::Completed
        } else if loaded.is_empty() {
            SessionStatus::Failed
        } else {
            SessionStatus::PartialFailure
        };
        self.sessions.close(session_id, status).await;

        info!(
            session_id = %session_id,
            status = ?status,
            loaded = loaded.len(),
            failed = failed.len(),
            skipped = skipped.len(),
            "loading session closed"
        );
        metrics::counter!("modelpool_sessions_total").increment(1);

        Ok(LoadingResult {
            session_id: session_id.to_string(),
            status,
            device,
            loaded,
            failed,
            skipped,
            recovered_loads,
            total_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Resource validation plus batch execution. Returns the set of
    /// failed component ids and how many loads needed recovery.
    #[allow(clippy::too_many_arguments)]
    async fn validate_and_execute(
        &self,
        session_id: &str,
        specs: &[ComponentSpec],
        plan: Vec<Vec<String>>,
        device: DeviceId,
        options: &LoadOptions,
        pinned: &mut Vec<(DeviceId, String)>,
    ) -> Result<(HashSet<String>, u32), ModelError> {
        let by_id: HashMap<&str, &ComponentSpec> =
            specs.iter().map(|s| (s.id.as_str(), s)).collect();
        let to_load: Vec<&String> = plan.iter().flatten().collect();
        let required_bytes: u64 =
            to_load.iter().filter_map(|id| by_id.get(id.as_str())).map(|s| s.memory_footprint).sum();
        let largest = to_load
            .iter()
            .filter_map(|id| by_id.get(id.as_str()))
            .map(|s| s.memory_footprint)
            .max()
            .unwrap_or(0);

        // Resource validation: prediction, prevention rules, and a cache
        // optimization pass when the request does not fit as-is.
        self.sessions
            .advance(session_id, SessionStatus::ResourceValidation, "validating resources")
            .await;

        let models: HashSet<&str> = specs.iter().map(|s| s.model.as_str()).collect();
        let model_infos: Vec<ModelInfo> = models
            .iter()
            .map(|m| {
                let members: Vec<&&ComponentSpec> =
                    by_id.values().filter(|s| s.model == *m).collect();
                ModelInfo {
                    model: m.to_string(),
                    component_count: members.len(),
                    total_bytes: members.iter().map(|s| s.memory_footprint).sum(),
                    largest_component_bytes: members
                        .iter()
                        .map(|s| s.memory_footprint)
                        .max()
                        .unwrap_or(0),
                }
            })
            .collect();
        let prediction = self
            .memory
            .predict_memory_requirements(
                ops::LOAD_COMPONENT,
                &model_infos,
                Some(device),
                self.active_session_count().await,
            )
            .await?;

        let memory_now = self.ledger.device_memory(device).await?;
        self.recovery
            .check_admission(&LoadAdmission {
                device,
                required_bytes,
                device_capacity_bytes: memory_now.total_bytes,
                device_free_bytes: memory_now.free_bytes,
                largest_component_bytes: largest,
                predicted_failure_probability: Some(prediction.failure_probability),
            })
            .await?;

        if required_bytes > memory_now.free_bytes {
            debug!(
                session_id = %session_id,
                required_bytes,
                free_bytes = memory_now.free_bytes,
                "insufficient free memory, invoking cache optimization before load"
            );
            let _ = self
                .cache
                .optimize_cache(CacheStrategy::Aggressive, None, Some(false))
                .await;
        }

        // Loading: batches strictly sequential, components within a
        // batch in parallel under the global limiter.
        self.sessions
            .advance(session_id, SessionStatus::Loading, "loading batches")
            .await;
        let load_timeout = options.load_timeout.unwrap_or(self.config.load_timeout);
        let mut failed_ids: HashSet<String> = HashSet::new();
        let mut recovered_loads = 0u32;
        let total_batches = plan.len().max(1);

        for (batch_index, batch) in plan.iter().enumerate() {
            // Cooperative cancellation between batches: report partial
            // results instead of aborting uncleanly.
            if self.shutdown.is_triggered() {
                for id in plan.iter().skip(batch_index).flatten() {
                    self.sessions
                        .push_result(
                            session_id,
                            ComponentLoadResult {
                                component_id: id.clone(),
                                success: false,
                                loading_time_ms: 0,
                                error: Some(ModelError::Validation(
                                    "loading cancelled by shutdown".into(),
                                )),
                                skipped_on: None,
                                recovery_attempts: 0,
                            },
                        )
                        .await;
                    failed_ids.insert(id.clone());
                }
                break;
            }

            // Skip components whose dependencies already failed; they do
            // not block independent siblings.
            let mut runnable = Vec::new();
            for id in batch {
                let failed_dep = by_id
                    .get(id.as_str())
                    .and_then(|s| s.dependencies.iter().find(|d| failed_ids.contains(*d)));
                match failed_dep {
                    Some(dep) => {
                        self.sessions
                            .push_result(
                                session_id,
                                ComponentLoadResult {
                                    component_id: id.clone(),
                                    success: false,
                                    loading_time_ms: 0,
                                    error: None,
                                    skipped_on: Some(dep.clone()),
                                    recovery_attempts: 0,
                                },
                            )
                            .await;
                        failed_ids.insert(id.clone());
                    }
                    None => runnable.push(id.clone()),
                }
            }

            let loads = runnable.iter().map(|id| {
                let spec = (*by_id.get(id.as_str()).expect("planned component has a spec")).clone();
                self.load_one(session_id, spec, device, load_timeout)
            });
            let batch_results = futures::future::join_all(loads).await;

            for result in batch_results {
                if result.success {
                    recovered_loads += result.recovery_attempts.min(1);
                    pinned.push((device, result.component_id.clone()));
                } else {
                    failed_ids.insert(result.component_id.clone());
                }
                self.sessions.push_result(session_id, result).await;
            }

            let progress = (batch_index + 1) as f32 / total_batches as f32 * 100.0;
            self.sessions
                .set_progress(
                    session_id,
                    progress,
                    &format!("batch {}/{total_batches} done", batch_index + 1),
                )
                .await;
        }

        Ok((failed_ids, recovered_loads))
    }

    /// Load one component under the global limiter, with timeout and
    /// automatic recovery.
    async fn load_one(
        &self,
        session_id: &str,
        spec: ComponentSpec,
        device: DeviceId,
        load_timeout: Duration,
    ) -> ComponentLoadResult {
        let component_id = spec.id.clone();
        let bytes = spec.memory_footprint;
        let started = Instant::now();

        let permit = match self.load_semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return ComponentLoadResult {
                    component_id,
                    success: false,
                    loading_time_ms: 0,
                    error: Some(ModelError::Validation("load limiter closed".into())),
                    skipped_on: None,
                    recovery_attempts: 0,
                };
            }
        };
        let active = self.active_loads.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_loads.fetch_max(active, Ordering::SeqCst);

        let _ = self
            .registry
            .set_state(&component_id, ComponentState::Loading, None)
            .await;

        let request = WorkerRequest::new(
            ops::LOAD_COMPONENT,
            json!({
                "component_id": component_id,
                "device": device.to_string(),
                "bytes": bytes,
            }),
        );
        let ctx = OperationContext::for_operation(ops::LOAD_COMPONENT)
            .with_component(component_id.clone())
            .with_device(device)
            .with_session(session_id.to_string())
            .with_worker_request(request.clone());

        let outcome = self
            .recovery
            .run_with_recovery(ctx, || {
                let request = request.clone();
                let component_id = component_id.clone();
                async move {
                    self.memory.admit(device, &component_id, bytes).await?;
                    let response =
                        match tokio::time::timeout(load_timeout, self.workers.execute(request))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => {
                                self.memory.release(device, &component_id).await;
                                return Err(ModelError::Timeout {
                                    operation: ops::LOAD_COMPONENT.into(),
                                    timeout_ms: load_timeout.as_millis() as u64,
                                });
                            }
                        };
                    match response.and_then(|r| r.into_result(ops::LOAD_COMPONENT)) {
                        Ok(response) => Ok(response),
                        Err(err) => {
                            self.memory.release(device, &component_id).await;
                            Err(err)
                        }
                    }
                }
            })
            .await;

        self.active_loads.fetch_sub(1, Ordering::SeqCst);
        drop(permit);
        let elapsed = started.elapsed();

        match outcome {
            RecoveryOutcome::Succeeded { value: response, attempts } => {
                let _ = self
                    .registry
                    .set_state(&component_id, ComponentState::Loaded, Some(device))
                    .await;
                // Pin immediately so an optimization pass between
                // batches cannot evict a component the session needs.
                self.ledger.pin(device, &component_id).await;
                self.registry.record_access(&component_id).await;
                self.memory.record_operation(ops::LOAD_COMPONENT, bytes).await;
                self.monitor.record_load(elapsed, true).await;
                let loading_time_ms = response
                    .metrics
                    .loading_time_ms
                    .unwrap_or(elapsed.as_millis() as u64);
                debug!(component_id = %component_id, device = %device, attempts, "component loaded");
                ComponentLoadResult {
                    component_id,
                    success: true,
                    loading_time_ms,
                    error: None,
                    skipped_on: None,
                    recovery_attempts: attempts,
                }
            }
            RecoveryOutcome::Failed { report } => {
                let _ = self
                    .registry
                    .set_state(
                        &component_id,
                        ComponentState::Failed { error: report.error.to_string() },
                        None,
                    )
                    .await;
                self.monitor.record_load(elapsed, false).await;
                warn!(component_id = %component_id, error = %report.error, "component load failed");
                ComponentLoadResult {
                    component_id,
                    success: false,
                    loading_time_ms: elapsed.as_millis() as u64,
                    error: Some(report.error.clone()),
                    skipped_on: None,
                    recovery_attempts: report.attempts.len() as u32,
                }
            }
        }
    }

    /// Graph lookup or build; single-model closures are cached per
    /// model id.
    async fn graph_for(&self, specs: &[ComponentSpec]) -> Result<Arc<DependencyGraph>, ModelError> {
        let models: HashSet<&str> = specs.iter().map(|s| s.model.as_str()).collect();
        if models.len() == 1 {
            let model = models.into_iter().next().unwrap_or_default().to_string();
            // Cache the graph over the model's full component set so
            // repeated requests share it.
            if let Some(cached) = self.graphs.get(&model).await {
                return Ok(cached);
            }
            let full = self.registry.specs_for_model(&model).await;
            let graph = match DependencyGraph::build(&full) {
                Ok(graph) => Arc::new(graph),
                // The model's full set references components outside the
                // registry's view of it; the requested closure is still
                // self-contained and must validate on its own.
                Err(ModelError::Validation(_)) => Arc::new(DependencyGraph::build(specs)?),
                Err(err) => return Err(err),
            };
            self.graphs.insert(model, Arc::clone(&graph)).await;
            return Ok(graph);
        }
        // Mixed-model closure: build ad hoc, no caching.
        Ok(Arc::new(DependencyGraph::build(specs)?))
    }

    /// Read-only, cacheable dependency analysis for one model.
    pub async fn analyze_component_dependencies(
        &self,
        model: &str,
    ) -> Result<DependencyAnalysis, ModelError> {
        let (graph, from_cache) = match self.graphs.get(model).await {
            Some(graph) => (graph, true),
            None => {
                let specs = self.registry.specs_for_model(model).await;
                if specs.is_empty() {
                    return Err(ModelError::Validation(format!(
                        "no components registered for model {model}"
                    )));
                }
                let graph = Arc::new(DependencyGraph::build(&specs)?);
                self.graphs.insert(model.to_string(), Arc::clone(&graph)).await;
                (graph, false)
            }
        };

        let worker_analysis_error = match self
            .workers
            .execute(WorkerRequest::new(
                ops::ANALYZE_COMPONENT_DEPENDENCIES,
                json!({ "model": model }),
            ))
            .await
            .and_then(|r| r.into_result(ops::ANALYZE_COMPONENT_DEPENDENCIES))
        {
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "worker dependency analysis unavailable");
                Some(err.to_string())
            }
        };

        Ok(DependencyAnalysis {
            model: model.to_string(),
            component_count: graph.component_count(),
            levels: graph.levels().to_vec(),
            critical_path_len: graph.critical_path_len(),
            from_cache,
            worker_analysis_error,
        })
    }

    /// Post-load rebalancing: bring the given components onto `device`,
    /// evicting cold residents when the level allows it.
    pub async fn optimize_component_allocation(
        &self,
        component_ids: &[String],
        device: DeviceId,
        level: OptimizationLevel,
    ) -> Result<AllocationOptimization, ModelError> {
        let mut relocated = Vec::new();
        let mut evicted_for_room = Vec::new();
        let mut bytes_freed = 0u64;

        for component_id in component_ids {
            let Some(spec) = self.registry.spec(component_id).await else {
                return Err(ModelError::Validation(format!("unknown component {component_id}")));
            };
            let current = self.registry.device(component_id).await;
            if current == Some(device) {
                continue;
            }

            // Make room first when allowed.
            let free = self.ledger.device_memory(device).await?.free_bytes;
            if free < spec.memory_footprint && level != OptimizationLevel::Conservative {
                let candidates = self
                    .registry
                    .cold_components(
                        Some(device),
                        self.cache.config().analysis_window,
                        self.cache.config().min_access_frequency,
                    )
                    .await;
                for (candidate, _, _) in candidates {
                    if self.ledger.device_memory(device).await?.free_bytes
                        >= spec.memory_footprint
                    {
                        break;
                    }
                    if let Ok(freed) =
                        self.cache.evict_component(&candidate, "allocation rebalancing").await
                    {
                        bytes_freed += freed;
                        evicted_for_room.push(candidate);
                    }
                }
            }

            // Release the old placement, then admit and load on the
            // target device.
            if let Some(old_device) = current {
                if self.ledger.is_pinned(old_device, component_id).await {
                    continue;
                }
                self.memory.release(old_device, component_id).await;
                let _ = self
                    .registry
                    .set_state(component_id, ComponentState::Unloaded, None)
                    .await;
            }
            if self.memory.admit(device, component_id, spec.memory_footprint).await.is_err() {
                continue;
            }
            let request = WorkerRequest::new(
                ops::LOAD_COMPONENT,
                json!({ "component_id": component_id, "device": device.to_string(), "rebalance": true }),
            );
            match self
                .workers
                .execute(request)
                .await
                .and_then(|r| r.into_result(ops::LOAD_COMPONENT))
            {
                Ok(_) => {
                    let _ = self
                        .registry
                        .set_state(component_id, ComponentState::Loaded, Some(device))
                        .await;
                    relocated.push(component_id.clone());
                }
                Err(err) => {
                    self.memory.release(device, component_id).await;
                    self.recovery
                        .note_failure(
                            &err,
                            &OperationContext::for_operation("optimize_component_allocation")
                                .with_component(component_id.clone())
                                .with_device(device),
                        )
                        .await;
                }
            }
        }

        Ok(AllocationOptimization { device, relocated, evicted_for_room, bytes_freed })
    }
}
