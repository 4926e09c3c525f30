//! Memory optimization: fragmentation analysis, defragmentation, leak
//! detection, requirement prediction, and health monitoring.

pub mod block_map;
pub mod prediction;

use crate::background::{ShutdownFlag, SingleFlight};
use crate::registry::ComponentRegistry;
use crate::workers::WorkerPool;
use block_map::{BlockMap, PlacementError};
use modelpool_core::worker::ops;
use modelpool_core::{
    ComponentState, DeviceId, MemoryConfig, MemoryPressure, ModelError, WorkerRequest,
};
use modelpool_device::{DeviceLedger, MemoryReporter};
use prediction::{MemoryPrediction, ModelInfo, PredictionEngine};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// How aggressively an optimization pass reclaims memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationLevel {
    Conservative,
    Balanced,
    Aggressive,
}

/// Defragmentation approach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DefragStrategy {
    /// Slide extents toward offset zero, preserving order.
    Compact,
    /// Re-place extents largest-first to leave one contiguous tail gap.
    Rebuild,
}

/// Fragmentation grading; defragmentation runs at `Moderate` and above
/// unless forced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentationSeverity {
    Negligible,
    Low,
    Moderate,
    High,
    Severe,
}

impl FragmentationSeverity {
    pub fn from_ratio(ratio: f64) -> Self {
        match ratio {
            r if r < 0.10 => FragmentationSeverity::Negligible,
            r if r < 0.35 => FragmentationSeverity::Low,
            r if r < 0.60 => FragmentationSeverity::Moderate,
            r if r < 0.80 => FragmentationSeverity::High,
            _ => FragmentationSeverity::Severe,
        }
    }
}

/// Overall memory health grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

/// Result of one reclamation pass.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryOptimizationReport {
    pub level: OptimizationLevel,
    pub components_released: Vec<String>,
    pub bytes_reclaimed: u64,
    pub defragmented: Option<DefragmentationReport>,
    pub duration_ms: u64,
}

/// Per-device defragmentation outcome.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceDefragReport {
    pub device: DeviceId,
    pub performed: bool,
    pub skipped_reason: Option<String>,
    pub fragmentation_before: f64,
    pub fragmentation_after: f64,
    pub extents_moved: usize,
    pub bytes_moved: u64,
    /// True when the cancellation signal stopped the run early; partial
    /// progress is kept.
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DefragmentationReport {
    pub strategy: DefragStrategy,
    pub devices: Vec<DeviceDefragReport>,
    pub duration_ms: u64,
}

/// Per-device figures inside a usage analysis.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceUsageAnalysis {
    pub device: DeviceId,
    pub utilization_percent: f64,
    pub fragmentation: f64,
    pub fragmentation_severity: FragmentationSeverity,
    pub pressure: MemoryPressure,
    pub resident_components: usize,
}

/// A component whose residency pattern looks like a leak: it only sits
/// there while its access frequency has decayed to nothing.
#[derive(Debug, Clone, Serialize)]
pub struct LeakSuspect {
    pub component_id: String,
    pub resident_bytes: u64,
    pub idle_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryUsageAnalysis {
    pub devices: Vec<DeviceUsageAnalysis>,
    /// Resident-byte growth over the analysis period, per minute.
    pub growth_bytes_per_min: f64,
    pub leak_suspects: Vec<LeakSuspect>,
    pub recommendations: Vec<String>,
    /// Set when the worker-side analysis could not be merged; the
    /// internal analysis above still stands.
    pub worker_analysis_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceHealthEntry {
    pub device: DeviceId,
    pub utilization_percent: f64,
    pub fragmentation: f64,
    pub pressure: MemoryPressure,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryHealthReport {
    pub health: HealthStatus,
    pub devices: Vec<DeviceHealthEntry>,
    pub alerts: Vec<String>,
}

#[derive(Debug, Clone)]
struct MemorySnapshot {
    at: Instant,
    total_resident_bytes: u64,
}

/// The memory optimizer.
///
/// Owns the per-device block maps that model placement; every load and
/// eviction flows through [`MemoryOptimizer::admit`] /
/// [`MemoryOptimizer::release`] so ledger accounting and placement never
/// diverge.
pub struct MemoryOptimizer {
    config: MemoryConfig,
    registry: Arc<ComponentRegistry>,
    ledger: Arc<DeviceLedger>,
    workers: Arc<dyn WorkerPool>,
    block_maps: RwLock<HashMap<DeviceId, BlockMap>>,
    prediction: PredictionEngine,
    snapshots: RwLock<VecDeque<MemorySnapshot>>,
    shutdown: Arc<ShutdownFlag>,
    health_flight: Arc<SingleFlight>,
    defrag_flight: Arc<SingleFlight>,
}

impl MemoryOptimizer {
    pub fn new(
        config: MemoryConfig,
        registry: Arc<ComponentRegistry>,
        ledger: Arc<DeviceLedger>,
        workers: Arc<dyn WorkerPool>,
        shutdown: Arc<ShutdownFlag>,
    ) -> Self {
        Self {
            config,
            registry,
            ledger,
            workers,
            block_maps: RwLock::new(HashMap::new()),
            prediction: PredictionEngine::new(),
            snapshots: RwLock::new(VecDeque::new()),
            shutdown,
            health_flight: Arc::new(SingleFlight::new()),
            defrag_flight: Arc::new(SingleFlight::new()),
        }
    }

    /// Create the placement map for a device. Must be called once per
    /// registered device before components are admitted.
    pub async fn register_device(&self, device: DeviceId, capacity_bytes: u64) {
        let mut maps = self.block_maps.write().await;
        maps.entry(device).or_insert_with(|| BlockMap::new(capacity_bytes));
    }

    /// Reserve ledger budget and place the component. A placement
    /// failure with sufficient total free memory is an allocation
    /// failure caused by fragmentation, distinct from a capacity miss.
    pub async fn admit(
        &self,
        device: DeviceId,
        component_id: &str,
        bytes: u64,
    ) -> Result<(), ModelError> {
        self.ledger.reserve(device, component_id, bytes).await?;

        let mut maps = self.block_maps.write().await;
        let Some(map) = maps.get_mut(&device) else {
            self.ledger.release(device, component_id).await;
            return Err(ModelError::Validation(format!("no placement map for device {device}")));
        };

        match map.allocate(component_id, bytes) {
            Ok(_) => Ok(()),
            Err(PlacementError::Fragmented { free_bytes, largest_gap }) => {
                drop(maps);
                self.ledger.release(device, component_id).await;
                Err(ModelError::AllocationFailed {
                    device,
                    detail: format!(
                        "fragmentation: need {bytes} contiguous bytes, largest gap {largest_gap} of {free_bytes} free"
                    ),
                })
            }
            Err(PlacementError::NoCapacity { free_bytes }) => {
                drop(maps);
                self.ledger.release(device, component_id).await;
                Err(ModelError::InsufficientMemory {
                    device,
                    required_bytes: bytes,
                    available_bytes: free_bytes,
                })
            }
        }
    }

    /// Release a component's placement and ledger budget, returning the
    /// bytes reclaimed.
    pub async fn release(&self, device: DeviceId, component_id: &str) -> u64 {
        {
            let mut maps = self.block_maps.write().await;
            if let Some(map) = maps.get_mut(&device) {
                map.free(component_id);
            }
        }
        self.ledger.release(device, component_id).await
    }

    /// Record the memory a completed operation actually consumed, for
    /// prediction.
    pub async fn record_operation(&self, operation_type: &str, bytes: u64) {
        self.prediction.record_observation(operation_type, bytes).await;
    }

    async fn target_devices(&self, device: Option<DeviceId>) -> Vec<DeviceId> {
        match device {
            Some(d) => vec![d],
            None => self.ledger.devices().await,
        }
    }

    /// Reclaim memory by releasing idle components, then defragment if
    /// the result still warrants it.
    pub async fn optimize_model_memory(
        &self,
        device: Option<DeviceId>,
        level: OptimizationLevel,
    ) -> Result<MemoryOptimizationReport, ModelError> {
        let started = Instant::now();
        let idle_threshold = match level {
            OptimizationLevel::Conservative => self.config.cold_component_idle * 2,
            OptimizationLevel::Balanced => self.config.cold_component_idle,
            OptimizationLevel::Aggressive => self.config.cold_component_idle / 2,
        };

        let mut released = Vec::new();
        let mut bytes_reclaimed = 0u64;
        for target in self.target_devices(device).await {
            for (component_id, _) in self.registry.idle_components(Some(target), idle_threshold).await
            {
                if self.ledger.is_pinned(target, &component_id).await {
                    continue;
                }
                bytes_reclaimed += self.release(target, &component_id).await;
                self.registry
                    .set_state(&component_id, ComponentState::Unloaded, None)
                    .await?;
                released.push(component_id);
            }
        }

        let defragmented = {
            let needs_defrag = self.worst_fragmentation(device).await >= self.config.defrag_threshold;
            if needs_defrag {
                Some(self.defragment_model_memory(device, DefragStrategy::Compact, false).await?)
            } else {
                None
            }
        };

        self.record_snapshot().await;
        let report = MemoryOptimizationReport {
            level,
            components_released: released,
            bytes_reclaimed,
            defragmented,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            level = ?level,
            released = report.components_released.len(),
            bytes_reclaimed,
            "memory optimization pass finished"
        );
        Ok(report)
    }

    async fn worst_fragmentation(&self, device: Option<DeviceId>) -> f64 {
        let maps = self.block_maps.read().await;
        let targets: Vec<DeviceId> = match device {
            Some(d) => vec![d],
            None => maps.keys().copied().collect(),
        };
        targets
            .iter()
            .filter_map(|d| maps.get(d).map(BlockMap::fragmentation))
            .fold(0.0, f64::max)
    }

    /// Deep usage analysis: per-device figures, growth rate, and leak
    /// suspicion, merged with the worker-side view when available.
    pub async fn analyze_memory_usage_patterns(
        &self,
        device: Option<DeviceId>,
        period: Duration,
    ) -> Result<MemoryUsageAnalysis, ModelError> {
        let mut devices = Vec::new();
        for target in self.target_devices(device).await {
            let memory = self.ledger.device_memory(target).await?;
            let fragmentation = {
                let maps = self.block_maps.read().await;
                maps.get(&target).map(BlockMap::fragmentation).unwrap_or(0.0)
            };
            devices.push(DeviceUsageAnalysis {
                device: target,
                utilization_percent: memory.utilization_percent(),
                fragmentation,
                fragmentation_severity: FragmentationSeverity::from_ratio(fragmentation),
                pressure: memory.pressure(),
                resident_components: self.ledger.resident_components(target).await.len(),
            });
        }

        // Leak suspicion: resident components whose access frequency has
        // decayed while they keep occupying memory.
        let leak_idle = period.max(self.config.cold_component_idle);
        let mut leak_suspects = Vec::new();
        for component in self.registry.snapshot().await {
            if component.state.is_loaded()
                && device.is_none_or(|d| component.device == Some(d))
                && component.idle_for().is_none_or(|idle| idle >= leak_idle)
                && component.access_frequency(period) == 0.0
            {
                leak_suspects.push(LeakSuspect {
                    component_id: component.spec.id.clone(),
                    resident_bytes: component.spec.memory_footprint,
                    idle_secs: component.idle_for().map(|d| d.as_secs()).unwrap_or(u64::MAX),
                });
            }
        }

        let growth_bytes_per_min = self.growth_rate(period).await;

        let mut recommendations = Vec::new();
        for entry in &devices {
            if entry.fragmentation_severity >= FragmentationSeverity::Moderate {
                recommendations
                    .push(format!("defragment {}: fragmentation {:.2}", entry.device, entry.fragmentation));
            }
            if entry.pressure >= MemoryPressure::High {
                recommendations.push(format!(
                    "relieve pressure on {}: utilization {:.1}%",
                    entry.device, entry.utilization_percent
                ));
            }
        }
        if !leak_suspects.is_empty() {
            recommendations.push(format!(
                "evict {} idle component(s) suspected of leaking residency",
                leak_suspects.len()
            ));
        }

        // Merge the worker-side analysis; a failed merge degrades the
        // result instead of failing it.
        let worker_analysis_error = match self
            .workers
            .execute(WorkerRequest::new(
                ops::ANALYZE_MEMORY_USAGE_PATTERNS,
                json!({ "period_secs": period.as_secs() }),
            ))
            .await
            .and_then(|resp| resp.into_result(ops::ANALYZE_MEMORY_USAGE_PATTERNS))
        {
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "worker memory analysis unavailable, using internal view only");
                Some(err.to_string())
            }
        };

        Ok(MemoryUsageAnalysis {
            devices,
            growth_bytes_per_min,
            leak_suspects,
            recommendations,
            worker_analysis_error,
        })
    }

    async fn growth_rate(&self, period: Duration) -> f64 {
        let snapshots = self.snapshots.read().await;
        let cutoff = Instant::now().checked_sub(period);
        let window: Vec<&MemorySnapshot> = snapshots
            .iter()
            .filter(|s| cutoff.is_none_or(|c| s.at >= c))
            .collect();
        match (window.first(), window.last()) {
            (Some(first), Some(last)) if last.at > first.at => {
                let minutes = (last.at - first.at).as_secs_f64() / 60.0;
                (last.total_resident_bytes as f64 - first.total_resident_bytes as f64) / minutes
            }
            _ => 0.0,
        }
    }

    async fn record_snapshot(&self) {
        let total: u64 = self
            .ledger
            .usage_snapshot()
            .await
            .iter()
            .map(|u| u.resident_bytes)
            .sum();
        let mut snapshots = self.snapshots.write().await;
        snapshots.push_back(MemorySnapshot { at: Instant::now(), total_resident_bytes: total });
        if snapshots.len() > self.config.analysis_history {
            snapshots.pop_front();
        }
    }

    /// Defragment the placement maps. Skipped below the Moderate
    /// threshold unless `force` is set; cancellation is polled between
    /// extent moves and partial progress is reported, never discarded.
    pub async fn defragment_model_memory(
        &self,
        device: Option<DeviceId>,
        strategy: DefragStrategy,
        force: bool,
    ) -> Result<DefragmentationReport, ModelError> {
        let started = Instant::now();
        let mut reports = Vec::new();

        for target in self.target_devices(device).await {
            let mut maps = self.block_maps.write().await;
            let Some(map) = maps.get_mut(&target) else {
                continue;
            };
            let before = map.fragmentation();
            let severity = FragmentationSeverity::from_ratio(before);

            if !force && before < self.config.defrag_threshold {
                reports.push(DeviceDefragReport {
                    device: target,
                    performed: false,
                    skipped_reason: Some(format!(
                        "fragmentation {before:.2} below threshold ({severity:?})"
                    )),
                    fragmentation_before: before,
                    fragmentation_after: before,
                    extents_moved: 0,
                    bytes_moved: 0,
                    cancelled: false,
                });
                continue;
            }

            let shutdown = Arc::clone(&self.shutdown);
            let stats = match strategy {
                DefragStrategy::Compact => map.compact(move || shutdown.is_triggered()),
                DefragStrategy::Rebuild => {
                    // Re-place largest-first; a cancelled rebuild keeps
                    // whatever has been re-placed so far.
                    let mut occupied = map.occupied();
                    occupied.sort_by(|a, b| b.1.size.cmp(&a.1.size));
                    for (id, _) in &occupied {
                        map.free(id);
                    }
                    let mut stats = block_map::CompactionStats {
                        extents_moved: 0,
                        bytes_moved: 0,
                        completed: true,
                    };
                    for (id, extent) in &occupied {
                        if shutdown.is_triggered() {
                            stats.completed = false;
                            break;
                        }
                        // Placement into an emptied prefix cannot fail.
                        let placed = map.allocate(id, extent.size).expect("rebuild placement");
                        if placed.offset != extent.offset {
                            stats.extents_moved += 1;
                            stats.bytes_moved += extent.size;
                        }
                    }
                    stats
                }
            };

            let after = map.fragmentation();
            debug!(
                device = %target,
                before,
                after,
                moved = stats.extents_moved,
                "defragmentation step finished"
            );
            reports.push(DeviceDefragReport {
                device: target,
                performed: true,
                skipped_reason: None,
                fragmentation_before: before,
                fragmentation_after: after,
                extents_moved: stats.extents_moved,
                bytes_moved: stats.bytes_moved,
                cancelled: !stats.completed,
            });
        }

        Ok(DefragmentationReport {
            strategy,
            devices: reports,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Predict memory requirements for an operation, combining history
    /// with current free memory and in-flight session count.
    pub async fn predict_memory_requirements(
        &self,
        operation_type: &str,
        model_infos: &[ModelInfo],
        device: Option<DeviceId>,
        active_sessions: usize,
    ) -> Result<MemoryPrediction, ModelError> {
        let free_bytes = match device {
            Some(d) => Some(self.ledger.device_memory(d).await?.free_bytes),
            None => {
                let usage = self.ledger.usage_snapshot().await;
                if usage.is_empty() {
                    None
                } else {
                    Some(usage.iter().map(|u| u.capacity_bytes - u.resident_bytes).sum())
                }
            }
        };

        Ok(self
            .prediction
            .predict(operation_type, model_infos, device, free_bytes, active_sessions)
            .await)
    }

    /// Classify overall memory health from the worst device.
    pub async fn monitor_memory_health(
        &self,
        device: Option<DeviceId>,
    ) -> Result<MemoryHealthReport, ModelError> {
        let mut entries = Vec::new();
        let mut alerts = Vec::new();
        let mut worst = HealthStatus::Excellent;

        for target in self.target_devices(device).await {
            let memory = self.ledger.device_memory(target).await?;
            let fragmentation = {
                let maps = self.block_maps.read().await;
                maps.get(&target).map(BlockMap::fragmentation).unwrap_or(0.0)
            };
            let utilization = memory.utilization_percent();
            let grade = grade_device(utilization, fragmentation);
            worst = worst.max(grade);

            if grade >= HealthStatus::Poor {
                alerts.push(format!(
                    "{target}: health {grade:?}, utilization {utilization:.1}%, fragmentation {fragmentation:.2}"
                ));
            }
            entries.push(DeviceHealthEntry {
                device: target,
                utilization_percent: utilization,
                fragmentation,
                pressure: memory.pressure(),
            });
        }

        if entries.is_empty() {
            worst = HealthStatus::Fair;
            alerts.push("no devices registered".into());
        }

        Ok(MemoryHealthReport { health: worst, devices: entries, alerts })
    }

    /// Periodic health pass body; single-flight guarded by the caller's
    /// loop via [`MemoryOptimizer::health_guard`].
    pub async fn health_pass(&self) {
        match self.monitor_memory_health(None).await {
            Ok(report) => {
                self.record_snapshot().await;
                metrics::gauge!("modelpool_memory_health")
                    .set(report.health as u8 as f64);
                for alert in &report.alerts {
                    warn!(alert = %alert, "memory health alert");
                }
            }
            Err(err) => warn!(error = %err, "memory health pass failed"),
        }
    }

    /// Periodic defragmentation check body.
    pub async fn defrag_check_pass(&self) {
        if self.worst_fragmentation(None).await >= self.config.defrag_threshold {
            if let Err(err) =
                self.defragment_model_memory(None, DefragStrategy::Compact, false).await
            {
                warn!(error = %err, "background defragmentation failed");
            }
        }
    }

    pub fn health_guard(&self) -> Arc<SingleFlight> {
        Arc::clone(&self.health_flight)
    }

    pub fn defrag_guard(&self) -> Arc<SingleFlight> {
        Arc::clone(&self.defrag_flight)
    }

    /// Current fragmentation ratio of one device.
    pub async fn fragmentation(&self, device: DeviceId) -> f64 {
        let maps = self.block_maps.read().await;
        maps.get(&device).map(BlockMap::fragmentation).unwrap_or(0.0)
    }
}

fn grade_device(utilization_percent: f64, fragmentation: f64) -> HealthStatus {
    match (utilization_percent, fragmentation) {
        (u, f) if u < 50.0 && f < 0.10 => HealthStatus::Excellent,
        (u, f) if u < 70.0 && f < 0.35 => HealthStatus::Good,
        (u, f) if u < 85.0 && f < 0.60 => HealthStatus::Fair,
        (u, _) if u < 95.0 => HealthStatus::Poor,
        _ => HealthStatus::Critical,
    }
}
