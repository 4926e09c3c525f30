//! Configuration for the five subsystem parts, with validation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Component Coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Global cap on simultaneously executing component-load operations
    /// across all sessions.
    pub max_concurrent_loads: usize,
    /// Cap on components loaded in parallel within one batch.
    pub max_parallel_per_batch: usize,
    /// Per-component load timeout; expiry is classified as a Timeout
    /// error and handled through the normal error path.
    pub load_timeout: Duration,
    /// How long completed sessions stay queryable before the sweep
    /// discards them.
    pub session_retention: Duration,
    /// Dependency graphs cached per logical model.
    pub graph_cache_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_loads: num_cpus::get().max(2),
            max_parallel_per_batch: 4,
            load_timeout: Duration::from_secs(120),
            session_retention: Duration::from_secs(300),
            graph_cache_capacity: 32,
        }
    }
}

/// Predictive pre-loading settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictiveConfig {
    pub enabled: bool,
    /// How far ahead predicted accesses are considered; entries expire
    /// at the end of this window.
    pub prediction_window: Duration,
    /// Minimum confidence for a candidate to be materialized.
    pub confidence_threshold: f64,
    /// Cap on simultaneously live predictive entries.
    pub max_entries: usize,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prediction_window: Duration::from_secs(120),
            confidence_threshold: 0.7,
            max_entries: 4,
        }
    }
}

/// Cache Coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Interval of the background optimization pass.
    pub optimization_interval: Duration,
    /// Usage-analysis window.
    pub analysis_window: Duration,
    /// Components accessed less often than this (per minute) are
    /// eviction candidates.
    pub min_access_frequency: f64,
    /// Resident-but-idle share (percent) above which reclamation is
    /// flagged as an opportunity.
    pub waste_threshold_percent: f64,
    /// Most components evicted by a single optimization pass.
    pub max_eviction_batch: usize,
    pub predictive: PredictiveConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            optimization_interval: Duration::from_secs(60),
            analysis_window: Duration::from_secs(300),
            min_access_frequency: 0.5,
            waste_threshold_percent: 30.0,
            max_eviction_batch: 8,
            predictive: PredictiveConfig::default(),
        }
    }
}

/// Memory Optimizer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Fragmentation ratio at or above which defragmentation runs
    /// (the "Moderate" threshold); below it, defrag is skipped unless
    /// forced.
    pub defrag_threshold: f64,
    /// Interval of the periodic health check.
    pub health_check_interval: Duration,
    /// Interval of the background defragmentation check.
    pub defrag_check_interval: Duration,
    /// Snapshots retained for usage analysis and leak detection.
    pub analysis_history: usize,
    /// Components idle longer than this are reclamation candidates for
    /// `optimize_model_memory`.
    pub cold_component_idle: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            defrag_threshold: 0.35,
            health_check_interval: Duration::from_secs(30),
            defrag_check_interval: Duration::from_secs(120),
            analysis_history: 1000,
            cold_component_idle: Duration::from_secs(600),
        }
    }
}

/// Error Handler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Upper bound on recovery attempts for a single error.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    /// Timeout applied to each individual recovery attempt.
    pub attempt_timeout: Duration,
    /// Worker-boundary circuit breaker: failures before opening.
    pub breaker_failure_threshold: u64,
    /// Worker-boundary circuit breaker: cool-down before half-open.
    pub breaker_cooldown: Duration,
    /// Recurring failures of one root cause within the analysis window
    /// before a prevention rule is installed automatically.
    pub auto_prevention_threshold: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(30),
            breaker_failure_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            auto_prevention_threshold: 3,
        }
    }
}

/// Alert thresholds evaluated on every metrics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Device memory utilization (percent) above which an alert fires.
    pub memory_usage_percent: f64,
    /// Average loading time above which an alert fires.
    pub loading_time_ms: u64,
    /// Cache hit rate below which an alert fires.
    pub cache_hit_rate: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self { memory_usage_percent: 90.0, loading_time_ms: 30_000, cache_hit_rate: 0.80 }
    }
}

/// Performance Monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Interval of the periodic collection pass.
    pub collection_interval: Duration,
    /// Snapshots retained in the rolling history.
    pub history_capacity: usize,
    /// Snapshots per device folded into the rolling baseline.
    pub baseline_window: usize,
    /// Wait between applying optimization actions and re-snapshotting
    /// when measuring effectiveness.
    pub settle_delay: Duration,
    pub alerts: AlertThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            collection_interval: Duration::from_secs(15),
            history_capacity: 1000,
            baseline_window: 20,
            settle_delay: Duration::from_secs(2),
            alerts: AlertThresholds::default(),
        }
    }
}

/// Top-level configuration for the subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    pub coordinator: CoordinatorConfig,
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
    pub recovery: RecoveryConfig,
    pub monitor: MonitorConfig,
}

/// Outcome of configuration validation.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl PoolConfig {
    /// Validate the configuration, collecting every error and warning
    /// rather than stopping at the first.
    pub fn validate(&self) -> ConfigValidation {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.coordinator.max_concurrent_loads == 0 {
            errors.push("coordinator.max_concurrent_loads must be at least 1".into());
        }
        if self.coordinator.max_parallel_per_batch == 0 {
            errors.push("coordinator.max_parallel_per_batch must be at least 1".into());
        }
        if self.coordinator.max_parallel_per_batch > self.coordinator.max_concurrent_loads {
            warnings.push(
                "coordinator.max_parallel_per_batch exceeds max_concurrent_loads; \
                 the global limiter will dominate"
                    .into(),
            );
        }
        if self.coordinator.load_timeout.is_zero() {
            errors.push("coordinator.load_timeout must be non-zero".into());
        }

        if !(0.0..=1.0).contains(&self.cache.predictive.confidence_threshold) {
            errors.push("cache.predictive.confidence_threshold must be within [0, 1]".into());
        }
        if self.cache.min_access_frequency < 0.0 {
            errors.push("cache.min_access_frequency must be non-negative".into());
        }
        if !(0.0..=100.0).contains(&self.cache.waste_threshold_percent) {
            errors.push("cache.waste_threshold_percent must be within [0, 100]".into());
        }
        if self.cache.max_eviction_batch == 0 {
            errors.push("cache.max_eviction_batch must be at least 1".into());
        }

        if !(0.0..=1.0).contains(&self.memory.defrag_threshold) {
            errors.push("memory.defrag_threshold must be within [0, 1]".into());
        }

        if self.recovery.max_attempts == 0 {
            errors.push("recovery.max_attempts must be at least 1".into());
        }
        if self.recovery.backoff_multiplier < 1.0 {
            warnings.push("recovery.backoff_multiplier below 1.0 shrinks backoff".into());
        }

        if !(0.0..=100.0).contains(&self.monitor.alerts.memory_usage_percent) {
            errors.push("monitor.alerts.memory_usage_percent must be within [0, 100]".into());
        }
        if !(0.0..=1.0).contains(&self.monitor.alerts.cache_hit_rate) {
            errors.push("monitor.alerts.cache_hit_rate must be within [0, 1]".into());
        }
        if self.monitor.baseline_window == 0 {
            errors.push("monitor.baseline_window must be at least 1".into());
        }

        ConfigValidation { is_valid: errors.is_empty(), errors, warnings }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let report = PoolConfig::default().validate();
        assert!(report.is_valid, "errors: {:?}", report.errors);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = PoolConfig::default();
        config.coordinator.max_concurrent_loads = 0;
        let report = config.validate();
        assert!(!report.is_valid);
        assert!(report.errors.iter().any(|e| e.contains("max_concurrent_loads")));
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        let mut config = PoolConfig::default();
        config.cache.predictive.confidence_threshold = 1.5;
        assert!(!config.validate().is_valid);
    }

    #[test]
    fn batch_cap_above_global_cap_warns() {
        let mut config = PoolConfig::default();
        config.coordinator.max_parallel_per_batch = config.coordinator.max_concurrent_loads + 1;
        let report = config.validate();
        assert!(report.is_valid);
        assert!(!report.warnings.is_empty());
    }
}
