//! Cache coordination: usage analysis, eviction, predictive
//! pre-loading, and memory-pressure response.

pub mod predictive;
pub mod pressure_relief;
pub mod usage;

use crate::background::SingleFlight;
use crate::memory::MemoryOptimizer;
use crate::registry::ComponentRegistry;
use crate::workers::WorkerPool;
use modelpool_core::worker::ops;
use modelpool_core::{
    CacheConfig, ComponentState, DeviceId, ModelError, WorkerRequest,
};
use modelpool_device::DeviceLedger;
use predictive::{PredictiveEntry, PredictiveReport, generate_candidates};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use usage::{UsagePattern, analyze_usage};

/// How aggressively an optimization pass hunts for evictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    Conservative,
    Balanced,
    Aggressive,
}

impl CacheStrategy {
    /// Multiplier applied to the configured eviction frequency
    /// threshold: aggressive passes consider warmer components.
    fn frequency_factor(self) -> f64 {
        match self {
            CacheStrategy::Conservative => 0.5,
            CacheStrategy::Balanced => 1.0,
            CacheStrategy::Aggressive => 2.0,
        }
    }
}

/// One ranked optimization opportunity.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheOpportunity {
    EvictColdComponent { component_id: String, frequency_per_min: f64, estimated_gain_bytes: u64 },
    ReclaimIdleResidency { idle_bytes: u64, idle_percent: f64 },
    PreloadPredicted { component_id: String, confidence: f64 },
}

impl CacheOpportunity {
    fn priority(&self) -> f64 {
        match self {
            // Bigger gains from colder components rank first.
            CacheOpportunity::EvictColdComponent { frequency_per_min, estimated_gain_bytes, .. } => {
                *estimated_gain_bytes as f64 / (frequency_per_min + 0.01)
            }
            CacheOpportunity::ReclaimIdleResidency { idle_bytes, .. } => *idle_bytes as f64,
            CacheOpportunity::PreloadPredicted { confidence, .. } => *confidence * 1024.0,
        }
    }
}

/// Result of one cache optimization pass.
#[derive(Debug, Clone, Serialize)]
pub struct CacheOptimizationReport {
    pub strategy: CacheStrategy,
    pub patterns_analyzed: usize,
    pub opportunities: Vec<CacheOpportunity>,
    pub evicted: Vec<String>,
    pub bytes_freed: u64,
    pub predictive: Option<PredictiveReport>,
    /// Set when worker-side pattern analysis could not be merged.
    pub worker_analysis_error: Option<String>,
    pub duration_ms: u64,
}

/// Hit/miss and eviction counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub predictive_entries: usize,
}

/// The cache coordinator.
pub struct CacheCoordinator {
    config: CacheConfig,
    registry: Arc<ComponentRegistry>,
    ledger: Arc<DeviceLedger>,
    memory: Arc<MemoryOptimizer>,
    workers: Arc<dyn WorkerPool>,
    predictive_entries: RwLock<HashMap<String, PredictiveEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    flight: Arc<SingleFlight>,
}

impl CacheCoordinator {
    pub fn new(
        config: CacheConfig,
        registry: Arc<ComponentRegistry>,
        ledger: Arc<DeviceLedger>,
        memory: Arc<MemoryOptimizer>,
        workers: Arc<dyn WorkerPool>,
    ) -> Self {
        Self {
            config,
            registry,
            ledger,
            memory,
            workers,
            predictive_entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            flight: Arc::new(SingleFlight::new()),
        }
    }

    pub(crate) fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn memory(&self) -> &Arc<MemoryOptimizer> {
        &self.memory
    }

    pub(crate) fn ledger(&self) -> &Arc<DeviceLedger> {
        &self.ledger
    }

    pub(crate) fn workers(&self) -> &Arc<dyn WorkerPool> {
        &self.workers
    }

    pub(crate) fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub(crate) async fn predictive_component_ids(&self) -> Vec<String> {
        self.predictive_entries.read().await.keys().cloned().collect()
    }

    /// Check residency for a component about to be used. Records the
    /// access and the hit/miss; a hit on a predictive entry promotes it
    /// to a regular one (the forecast came true).
    pub async fn lookup(&self, component_id: &str) -> bool {
        self.registry.record_access(component_id).await;
        let resident = self
            .registry
            .state(component_id)
            .await
            .is_some_and(|s| s.is_loaded());
        if resident {
            self.hits.fetch_add(1, Ordering::Relaxed);
            let mut entries = self.predictive_entries.write().await;
            if entries.remove(component_id).is_some() {
                debug!(component_id, "predictive entry promoted by real access");
                metrics::counter!("modelpool_predictive_hits").increment(1);
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        resident
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 { 1.0 } else { hits as f64 / total as f64 }
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
            evictions: self.evictions.load(Ordering::Relaxed),
            predictive_entries: self.predictive_entries.read().await.len(),
        }
    }

    /// Evict one component, refusing if a session has it pinned.
    /// Returns the bytes freed.
    pub async fn evict_component(&self, component_id: &str, reason: &str) -> Result<u64, ModelError> {
        let Some(device) = self.registry.device(component_id).await else {
            return Err(ModelError::Cache(format!("component {component_id} is not resident")));
        };
        if self.ledger.is_pinned(device, component_id).await {
            return Err(ModelError::Cache(format!(
                "component {component_id} is pinned by an active session"
            )));
        }

        let freed = self.memory.release(device, component_id).await;
        self.registry
            .set_state(component_id, ComponentState::Unloaded, None)
            .await?;
        self.predictive_entries.write().await.remove(component_id);
        self.evictions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("modelpool_evictions").increment(1);
        info!(component_id, reason, freed_bytes = freed, "component evicted");
        Ok(freed)
    }

    /// Evict every unpinned resident component (the CacheClear recovery
    /// strategy). Returns total bytes freed.
    pub async fn clear_unpinned(&self, device: Option<DeviceId>) -> u64 {
        let mut freed = 0u64;
        for component_id in self.registry.loaded_components(device).await {
            match self.evict_component(&component_id, "cache clear").await {
                Ok(bytes) => freed += bytes,
                Err(_) => continue,
            }
        }
        freed
    }

    /// The optimization pipeline: analyze usage, rank opportunities,
    /// execute evictions respecting pins, then optionally run the
    /// predictive pass.
    pub async fn optimize_cache(
        &self,
        strategy: CacheStrategy,
        analysis_window: Option<Duration>,
        enable_predictive: Option<bool>,
    ) -> Result<CacheOptimizationReport, ModelError> {
        let started = Instant::now();
        let window = analysis_window.unwrap_or(self.config.analysis_window);

        // (a) analyze usage, merging the worker-reported view when it is
        // available.
        let patterns = analyze_usage(&self.registry, window).await;
        let worker_analysis_error = match self
            .workers
            .execute(WorkerRequest::new(
                ops::ANALYZE_CACHE_PATTERNS,
                json!({ "window_secs": window.as_secs() }),
            ))
            .await
            .and_then(|resp| resp.into_result(ops::ANALYZE_CACHE_PATTERNS))
        {
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "worker cache analysis unavailable");
                Some(err.to_string())
            }
        };

        // (b) identify and rank opportunities.
        let threshold = self.config.min_access_frequency * strategy.frequency_factor();
        let mut opportunities = Vec::new();

        let mut resident_bytes = 0u64;
        let mut idle_bytes = 0u64;
        for pattern in patterns.iter().filter(|p| p.loaded) {
            resident_bytes += pattern.memory_footprint;
            if pattern.frequency_per_min < threshold {
                idle_bytes += pattern.memory_footprint;
                opportunities.push(CacheOpportunity::EvictColdComponent {
                    component_id: pattern.component_id.clone(),
                    frequency_per_min: pattern.frequency_per_min,
                    estimated_gain_bytes: pattern.memory_footprint,
                });
            }
        }
        if resident_bytes > 0 {
            let idle_percent = idle_bytes as f64 / resident_bytes as f64 * 100.0;
            if idle_percent >= self.config.waste_threshold_percent {
                opportunities
                    .push(CacheOpportunity::ReclaimIdleResidency { idle_bytes, idle_percent });
            }
        }
        opportunities.sort_by(|a, b| {
            b.priority().partial_cmp(&a.priority()).unwrap_or(std::cmp::Ordering::Equal)
        });

        // (c) execute: evict cold components, bounded per pass, skipping
        // anything pinned by an in-flight session.
        let mut evicted = Vec::new();
        let mut bytes_freed = 0u64;
        for opportunity in &opportunities {
            if evicted.len() >= self.config.max_eviction_batch {
                break;
            }
            if let CacheOpportunity::EvictColdComponent { component_id, .. } = opportunity {
                match self.evict_component(component_id, "below access-frequency threshold").await
                {
                    Ok(bytes) => {
                        bytes_freed += bytes;
                        evicted.push(component_id.clone());
                    }
                    Err(err) => debug!(component_id = %component_id, error = %err, "eviction skipped"),
                }
            }
        }

        // (d) predictive pass.
        let run_predictive =
            enable_predictive.unwrap_or(self.config.predictive.enabled);
        let predictive = if run_predictive {
            let report = self
                .enable_predictive_caching(
                    &patterns,
                    self.config.predictive.prediction_window,
                    self.config.predictive.confidence_threshold,
                )
                .await;
            for id in &report.materialized {
                opportunities.push(CacheOpportunity::PreloadPredicted {
                    component_id: id.clone(),
                    confidence: self
                        .predictive_entries
                        .read()
                        .await
                        .get(id)
                        .map(|e| e.confidence)
                        .unwrap_or(0.0),
                });
            }
            Some(report)
        } else {
            None
        };

        metrics::gauge!("modelpool_cache_hit_rate").set(self.hit_rate());
        let report = CacheOptimizationReport {
            strategy,
            patterns_analyzed: patterns.len(),
            opportunities,
            evicted,
            bytes_freed,
            predictive,
            worker_analysis_error,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            strategy = ?strategy,
            evicted = report.evicted.len(),
            bytes_freed,
            "cache optimization pass finished"
        );
        Ok(report)
    }

    /// Generate, validate, and materialize predictive entries.
    ///
    /// Each candidate is admitted only if free memory covers it right
    /// now; materialized entries expire at the end of the prediction
    /// window.
    pub async fn enable_predictive_caching(
        &self,
        patterns: &[UsagePattern],
        prediction_window: Duration,
        confidence_threshold: f64,
    ) -> PredictiveReport {
        let candidates = generate_candidates(patterns, prediction_window);
        let mut report = PredictiveReport {
            candidates_considered: candidates.len(),
            ..Default::default()
        };

        for candidate in candidates {
            {
                let entries = self.predictive_entries.read().await;
                if entries.len() >= self.config.predictive.max_entries {
                    break;
                }
                if entries.contains_key(&candidate.component_id) {
                    continue;
                }
            }
            if candidate.confidence < confidence_threshold {
                report.rejected_low_confidence += 1;
                continue;
            }

            // Validate against currently free resources; only a
            // validated entry is materialized and counted.
            let Some(device) = self.pick_device_for(candidate.bytes).await else {
                report.rejected_no_resources += 1;
                continue;
            };
            if let Err(err) = self.memory.admit(device, &candidate.component_id, candidate.bytes).await
            {
                debug!(component_id = %candidate.component_id, error = %err, "predictive admit failed");
                report.rejected_no_resources += 1;
                continue;
            }

            let request = WorkerRequest::new(
                ops::LOAD_COMPONENT,
                json!({ "component_id": candidate.component_id, "device": device.to_string(), "predictive": true }),
            );
            match self.workers.execute(request).await.and_then(|r| r.into_result(ops::LOAD_COMPONENT)) {
                Ok(_) => {
                    if self
                        .registry
                        .set_state(&candidate.component_id, ComponentState::Loaded, Some(device))
                        .await
                        .is_err()
                    {
                        self.memory.release(device, &candidate.component_id).await;
                        report.failed_loads += 1;
                        continue;
                    }
                    let now = Instant::now();
                    self.predictive_entries.write().await.insert(
                        candidate.component_id.clone(),
                        PredictiveEntry {
                            component_id: candidate.component_id.clone(),
                            confidence: candidate.confidence,
                            bytes: candidate.bytes,
                            materialized_at: now,
                            window_end: now + prediction_window,
                        },
                    );
                    info!(
                        component_id = %candidate.component_id,
                        confidence = candidate.confidence,
                        "predictive entry materialized"
                    );
                    report.materialized.push(candidate.component_id);
                }
                Err(err) => {
                    warn!(component_id = %candidate.component_id, error = %err, "predictive load failed");
                    self.memory.release(device, &candidate.component_id).await;
                    report.failed_loads += 1;
                }
            }
        }
        report
    }

    /// First registered device with room for `bytes`.
    async fn pick_device_for(&self, bytes: u64) -> Option<DeviceId> {
        use modelpool_device::MemoryReporter;
        for device in self.ledger.devices().await {
            if let Ok(memory) = self.ledger.device_memory(device).await
                && memory.free_bytes >= bytes
            {
                return Some(device);
            }
        }
        None
    }

    /// Evict predictive entries whose window has closed and drop metas
    /// orphaned by out-of-band eviction. Returns bytes freed.
    pub async fn expire_predictive_entries(&self) -> u64 {
        let expired: Vec<String> = {
            let entries = self.predictive_entries.read().await;
            entries
                .values()
                .filter(|e| e.is_expired())
                .map(|e| e.component_id.clone())
                .collect()
        };

        let mut freed = 0u64;
        for component_id in expired {
            match self.evict_component(&component_id, "predictive window expired").await {
                Ok(bytes) => freed += bytes,
                // Pinned or already gone: drop only the meta.
                Err(_) => {
                    self.predictive_entries.write().await.remove(&component_id);
                }
            }
        }

        // Orphan sweep: metas for components no longer resident.
        let orphaned: Vec<String> = {
            let entries = self.predictive_entries.read().await;
            let mut orphaned = Vec::new();
            for id in entries.keys() {
                if !self.registry.state(id).await.is_some_and(|s| s.is_loaded()) {
                    orphaned.push(id.clone());
                }
            }
            orphaned
        };
        if !orphaned.is_empty() {
            let mut entries = self.predictive_entries.write().await;
            for id in orphaned {
                entries.remove(&id);
            }
        }
        freed
    }

    /// Background pass body: expire predictive entries, then run a
    /// balanced optimization.
    pub async fn background_pass(&self) {
        self.expire_predictive_entries().await;
        if let Err(err) = self.optimize_cache(CacheStrategy::Balanced, None, None).await {
            warn!(error = %err, "background cache optimization failed");
        }
    }

    pub fn background_guard(&self) -> Arc<SingleFlight> {
        Arc::clone(&self.flight)
    }

    pub async fn predictive_entry_count(&self) -> usize {
        self.predictive_entries.read().await.len()
    }
}
