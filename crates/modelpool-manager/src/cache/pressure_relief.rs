//! Memory-pressure escalation.
//!
//! Pressure levels map to an ordered ladder of relief actions: evict
//! low-frequency components, evict predictive entries, hand off to
//! forced defragmentation, and finally ask the worker pool to reduce its
//! own footprint. Higher levels unlock later rungs; execution stops as
//! soon as the pressure level clears, and every local rung runs before
//! any worker-pool-side call.

use crate::cache::CacheCoordinator;
use crate::memory::DefragStrategy;
use modelpool_core::worker::ops;
use modelpool_core::{DeviceId, MemoryPressure, ModelError, WorkerRequest};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

/// Input to a pressure-relief request.
#[derive(Debug, Clone)]
pub struct PressureContext {
    pub device: DeviceId,
    /// Caller-observed level; when absent the ledger's current figures
    /// decide.
    pub observed_level: Option<MemoryPressure>,
}

/// One executed relief action.
#[derive(Debug, Clone, Serialize)]
pub struct ReliefAction {
    pub description: String,
    pub bytes_freed: u64,
    pub succeeded: bool,
}

/// Outcome of one pressure-relief run.
#[derive(Debug, Clone, Serialize)]
pub struct PressureReliefReport {
    pub device: DeviceId,
    pub initial_level: MemoryPressure,
    pub final_level: MemoryPressure,
    pub actions: Vec<ReliefAction>,
    pub cleared: bool,
}

impl CacheCoordinator {
    /// Run the relief ladder for one device.
    pub async fn handle_memory_pressure(
        &self,
        ctx: PressureContext,
    ) -> Result<PressureReliefReport, ModelError> {
        let measured = self.ledger().pressure(ctx.device).await?;
        let initial_level = ctx.observed_level.unwrap_or(measured).max(measured);

        let mut report = PressureReliefReport {
            device: ctx.device,
            initial_level,
            final_level: initial_level,
            actions: Vec::new(),
            cleared: !initial_level.needs_relief(),
        };
        if report.cleared {
            return Ok(report);
        }
        info!(device = %ctx.device, level = %initial_level, "relieving memory pressure");

        // Rung 1 (Medium and above): evict low-frequency components.
        let freed = self.evict_low_frequency(ctx.device).await;
        report.actions.push(ReliefAction {
            description: "evict low-frequency components".into(),
            bytes_freed: freed,
            succeeded: freed > 0,
        });
        if self.pressure_cleared(ctx.device, &mut report).await? {
            return Ok(report);
        }

        // Rung 2 (High and above): drop every predictive entry.
        if initial_level >= MemoryPressure::High {
            let freed = self.evict_all_predictive(ctx.device).await;
            report.actions.push(ReliefAction {
                description: "evict predictive entries".into(),
                bytes_freed: freed,
                succeeded: freed > 0,
            });
            if self.pressure_cleared(ctx.device, &mut report).await? {
                return Ok(report);
            }
        }

        // Rung 3 (Critical): forced defragmentation hand-off.
        if initial_level >= MemoryPressure::Critical {
            let defrag = self
                .memory()
                .defragment_model_memory(Some(ctx.device), DefragStrategy::Compact, true)
                .await?;
            let moved: u64 = defrag.devices.iter().map(|d| d.bytes_moved).sum();
            report.actions.push(ReliefAction {
                description: "forced defragmentation".into(),
                bytes_freed: 0,
                succeeded: moved > 0,
            });
            if self.pressure_cleared(ctx.device, &mut report).await? {
                return Ok(report);
            }

            // Rung 4 (Critical, last): ask the worker pool to shed
            // memory. Always after at least one local relief action.
            let request = WorkerRequest::new(
                ops::EXECUTE_CACHE_OPTIMIZATION,
                json!({ "device": ctx.device.to_string(), "reduce_memory": true }),
            );
            match self
                .workers()
                .execute(request)
                .await
                .and_then(|r| r.into_result(ops::EXECUTE_CACHE_OPTIMIZATION))
            {
                Ok(response) => {
                    report.actions.push(ReliefAction {
                        description: "worker-pool memory reduction".into(),
                        bytes_freed: response.metrics.memory_freed.unwrap_or(0),
                        succeeded: true,
                    });
                }
                Err(err) => {
                    warn!(error = %err, "worker-pool memory reduction failed");
                    report.actions.push(ReliefAction {
                        description: "worker-pool memory reduction".into(),
                        bytes_freed: 0,
                        succeeded: false,
                    });
                }
            }
            self.pressure_cleared(ctx.device, &mut report).await?;
        }

        Ok(report)
    }

    /// Re-measure and record; relief stops once below Medium.
    async fn pressure_cleared(
        &self,
        device: DeviceId,
        report: &mut PressureReliefReport,
    ) -> Result<bool, ModelError> {
        let level = self.ledger().pressure(device).await?;
        report.final_level = level;
        report.cleared = !level.needs_relief();
        Ok(report.cleared)
    }

    async fn evict_low_frequency(&self, device: DeviceId) -> u64 {
        let config = self.config();
        let candidates = self
            .registry()
            .cold_components(
                Some(device),
                config.analysis_window,
                config.min_access_frequency,
            )
            .await;
        let mut freed = 0u64;
        for (component_id, _, _) in candidates.into_iter().take(config.max_eviction_batch) {
            if let Ok(bytes) = self.evict_component(&component_id, "memory pressure").await {
                freed += bytes;
            }
        }
        freed
    }

    async fn evict_all_predictive(&self, device: DeviceId) -> u64 {
        let predictive: Vec<String> = self.predictive_component_ids().await;
        let mut freed = 0u64;
        for component_id in predictive {
            if self.registry().device(&component_id).await == Some(device)
                && let Ok(bytes) = self.evict_component(&component_id, "memory pressure").await
            {
                freed += bytes;
            }
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::ShutdownFlag;
    use crate::cache::CacheCoordinator;
    use crate::memory::MemoryOptimizer;
    use crate::registry::ComponentRegistry;
    use crate::workers::{SimulatedWorkerPool, WorkerPool};
    use modelpool_core::{CacheConfig, ComponentSpec, ComponentState, ComponentType, MemoryConfig};
    use modelpool_device::DeviceLedger;
    use std::sync::Arc;

    const DEV: DeviceId = DeviceId::cuda(0);

    async fn fixture(capacity: u64) -> (Arc<CacheCoordinator>, Arc<ComponentRegistry>, Arc<MemoryOptimizer>, Arc<SimulatedWorkerPool>) {
        let registry = Arc::new(ComponentRegistry::new());
        let ledger = Arc::new(DeviceLedger::new());
        ledger.register_device(DEV, capacity).await;
        let workers = Arc::new(SimulatedWorkerPool::new());
        let memory = Arc::new(MemoryOptimizer::new(
            MemoryConfig::default(),
            Arc::clone(&registry),
            Arc::clone(&ledger),
            workers.clone() as Arc<dyn WorkerPool>,
            Arc::new(ShutdownFlag::new()),
        ));
        memory.register_device(DEV, capacity).await;
        let cache = Arc::new(CacheCoordinator::new(
            CacheConfig::default(),
            Arc::clone(&registry),
            ledger,
            Arc::clone(&memory),
            workers.clone() as Arc<dyn WorkerPool>,
        ));
        (cache, registry, memory, workers)
    }

    async fn load(
        registry: &ComponentRegistry,
        memory: &MemoryOptimizer,
        id: &str,
        bytes: u64,
    ) {
        registry
            .register(ComponentSpec::new(id, "m", ComponentType::Adapter, bytes))
            .await;
        memory.admit(DEV, id, bytes).await.unwrap();
        registry.set_state(id, ComponentState::Loaded, Some(DEV)).await.unwrap();
    }

    #[tokio::test]
    async fn low_pressure_takes_no_action() {
        let (cache, _registry, _memory, _workers) = fixture(1000).await;
        let report = cache
            .handle_memory_pressure(PressureContext { device: DEV, observed_level: None })
            .await
            .unwrap();
        assert!(report.cleared);
        assert!(report.actions.is_empty());
    }

    #[tokio::test]
    async fn medium_pressure_evicts_cold_components_and_stops() {
        let (cache, registry, memory, _workers) = fixture(1000).await;
        // 60% utilization: Medium.
        load(&registry, &memory, "cold1", 300).await;
        load(&registry, &memory, "cold2", 300).await;

        let report = cache
            .handle_memory_pressure(PressureContext { device: DEV, observed_level: None })
            .await
            .unwrap();
        assert_eq!(report.initial_level, MemoryPressure::Medium);
        assert!(report.cleared, "final level {:?}", report.final_level);
        // Only the first rung ran.
        assert_eq!(report.actions.len(), 1);
        assert!(report.actions[0].bytes_freed > 0);
    }

    #[tokio::test]
    async fn critical_pressure_runs_local_relief_before_worker_call() {
        let (cache, registry, memory, workers) = fixture(1000).await;
        // 98% utilization: Critical; pin everything so local evictions
        // free nothing and the ladder walks to the worker rung.
        load(&registry, &memory, "pinned", 980).await;
        cache.ledger().pin(DEV, "pinned").await;

        let report = cache
            .handle_memory_pressure(PressureContext { device: DEV, observed_level: None })
            .await
            .unwrap();
        assert_eq!(report.initial_level, MemoryPressure::Critical);
        assert!(!report.cleared);

        let worker_idx = report
            .actions
            .iter()
            .position(|a| a.description.contains("worker-pool"))
            .expect("worker rung missing");
        assert!(worker_idx >= 1, "worker call must follow local relief actions");
        assert_eq!(workers.calls_for(ops::EXECUTE_CACHE_OPTIMIZATION).await, 1);
    }

    #[tokio::test]
    async fn observed_level_escalates_beyond_measured() {
        let (cache, registry, memory, _workers) = fixture(1000).await;
        load(&registry, &memory, "cold", 600).await;

        // Caller observed Critical even though the ledger says Medium;
        // the ladder honors the higher of the two.
        let report = cache
            .handle_memory_pressure(PressureContext {
                device: DEV,
                observed_level: Some(MemoryPressure::Critical),
            })
            .await
            .unwrap();
        assert_eq!(report.initial_level, MemoryPressure::Critical);
        // The first rung already clears pressure, so later rungs are
        // skipped.
        assert!(report.cleared);
        assert_eq!(report.actions.len(), 1);
    }
}
