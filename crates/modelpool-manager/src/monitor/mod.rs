//! Performance monitoring: metric collection, trend analysis against
//! rolling baselines, alerting, and the metrics-driven optimization
//! loop that feeds decisions back into the cache coordinator and memory
//! optimizer.

use crate::background::SingleFlight;
use crate::cache::{CacheCoordinator, CacheStats, CacheStrategy};
use crate::memory::{MemoryOptimizer, OptimizationLevel};
use crate::workers::WorkerPool;
use modelpool_core::worker::ops;
use modelpool_core::{AlertThresholds, DeviceId, MonitorConfig, Severity, WorkerRequest};
use modelpool_device::{DeviceLedger, DeviceUsage};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One alert raised by a threshold breach.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub severity: Severity,
    pub device: Option<DeviceId>,
    pub message: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Derived indicators for one collection.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceIndicators {
    pub cache_hit_rate: f64,
    pub avg_loading_time_ms: f64,
    pub loads_total: u64,
    pub load_failures: u64,
    /// Completed loads per minute over the recent window.
    pub throughput_per_min: f64,
    pub worst_device_utilization_percent: f64,
}

/// Full collection result.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetricsReport {
    pub indicators: PerformanceIndicators,
    pub devices: Vec<DeviceUsage>,
    pub cache: CacheStats,
    pub alerts: Vec<Alert>,
    /// Set when the worker-side figures could not be merged.
    pub worker_metrics_error: Option<String>,
    pub collected_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
struct PerfSnapshot {
    cache_hit_rate: f64,
    avg_loading_time_ms: f64,
    worst_device_utilization_percent: f64,
}

/// Direction of a metric against its baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Degrading,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricTrend {
    pub metric: String,
    pub direction: TrendDirection,
    pub recent_avg: f64,
    pub baseline_avg: f64,
    pub delta_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendAnalysisReport {
    pub trends: Vec<MetricTrend>,
    pub snapshots_analyzed: usize,
}

/// Request for the metrics-driven optimization loop.
#[derive(Debug, Clone, Default)]
pub struct OptimizeRequest {
    pub device: Option<DeviceId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsOptimizationReport {
    pub before: PerformanceIndicators,
    pub bottlenecks: Vec<String>,
    pub actions: Vec<String>,
    pub after: PerformanceIndicators,
    /// Composite-score improvement; negative when things got worse.
    pub effectiveness_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardData {
    pub current: PerformanceMetricsReport,
    pub active_alerts: Vec<Alert>,
    pub uptime_secs: u64,
}

/// The performance monitor.
pub struct PerformanceMonitor {
    config: MonitorConfig,
    ledger: Arc<DeviceLedger>,
    cache: Arc<CacheCoordinator>,
    memory: Arc<MemoryOptimizer>,
    workers: Arc<dyn WorkerPool>,
    loads_total: AtomicU64,
    load_failures: AtomicU64,
    total_load_ms: AtomicU64,
    recent_loads: RwLock<VecDeque<Instant>>,
    history: RwLock<VecDeque<PerfSnapshot>>,
    baselines: RwLock<HashMap<DeviceId, VecDeque<f64>>>,
    thresholds: RwLock<AlertThresholds>,
    active_alerts: RwLock<Vec<Alert>>,
    started_at: Instant,
    flight: Arc<SingleFlight>,
}

impl PerformanceMonitor {
    pub fn new(
        config: MonitorConfig,
        ledger: Arc<DeviceLedger>,
        cache: Arc<CacheCoordinator>,
        memory: Arc<MemoryOptimizer>,
        workers: Arc<dyn WorkerPool>,
    ) -> Self {
        let thresholds = config.alerts.clone();
        Self {
            config,
            ledger,
            cache,
            memory,
            workers,
            loads_total: AtomicU64::new(0),
            load_failures: AtomicU64::new(0),
            total_load_ms: AtomicU64::new(0),
            recent_loads: RwLock::new(VecDeque::new()),
            history: RwLock::new(VecDeque::new()),
            baselines: RwLock::new(HashMap::new()),
            thresholds: RwLock::new(thresholds),
            active_alerts: RwLock::new(Vec::new()),
            started_at: Instant::now(),
            flight: Arc::new(SingleFlight::new()),
        }
    }

    /// Record one finished component load.
    pub async fn record_load(&self, duration: Duration, success: bool) {
        self.loads_total.fetch_add(1, Ordering::Relaxed);
        self.total_load_ms.fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        if !success {
            self.load_failures.fetch_add(1, Ordering::Relaxed);
        }
        metrics::histogram!("modelpool_load_duration_ms").record(duration.as_millis() as f64);

        let mut recent = self.recent_loads.write().await;
        recent.push_back(Instant::now());
        while recent.len() > 4096 {
            recent.pop_front();
        }
    }

    async fn indicators(&self) -> PerformanceIndicators {
        let loads_total = self.loads_total.load(Ordering::Relaxed);
        let load_failures = self.load_failures.load(Ordering::Relaxed);
        let total_ms = self.total_load_ms.load(Ordering::Relaxed);
        let avg_loading_time_ms =
            if loads_total == 0 { 0.0 } else { total_ms as f64 / loads_total as f64 };

        let throughput_per_min = {
            let recent = self.recent_loads.read().await;
            let window = Duration::from_secs(60);
            let cutoff = Instant::now().checked_sub(window);
            let count = recent
                .iter()
                .filter(|t| cutoff.is_none_or(|c| **t >= c))
                .count();
            count as f64
        };

        let worst_device_utilization_percent = self
            .ledger
            .usage_snapshot()
            .await
            .iter()
            .map(|u| {
                if u.capacity_bytes == 0 {
                    100.0
                } else {
                    u.resident_bytes as f64 / u.capacity_bytes as f64 * 100.0
                }
            })
            .fold(0.0, f64::max);

        PerformanceIndicators {
            cache_hit_rate: self.cache.hit_rate(),
            avg_loading_time_ms,
            loads_total,
            load_failures,
            throughput_per_min,
            worst_device_utilization_percent,
        }
    }

    /// Collect a full metrics report: internal counters merged with the
    /// worker-reported view, derived indicators, baseline update, and
    /// alert evaluation.
    pub async fn collect_model_performance_metrics(
        &self,
        device: Option<DeviceId>,
        _period: Option<Duration>,
    ) -> PerformanceMetricsReport {
        let indicators = self.indicators().await;
        let mut devices = self.ledger.usage_snapshot().await;
        if let Some(filter) = device {
            devices.retain(|u| u.device == filter);
        }

        let worker_metrics_error = match self
            .workers
            .execute(WorkerRequest::new(
                ops::COLLECT_COMPREHENSIVE_PERFORMANCE_METRICS,
                json!({ "device": device.map(|d| d.to_string()) }),
            ))
            .await
            .and_then(|r| r.into_result(ops::COLLECT_COMPREHENSIVE_PERFORMANCE_METRICS))
        {
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "worker metrics unavailable");
                Some(err.to_string())
            }
        };

        // Update rolling history and per-device baselines.
        {
            let mut history = self.history.write().await;
            history.push_back(PerfSnapshot {
                cache_hit_rate: indicators.cache_hit_rate,
                avg_loading_time_ms: indicators.avg_loading_time_ms,
                worst_device_utilization_percent: indicators.worst_device_utilization_percent,
            });
            if history.len() > self.config.history_capacity {
                history.pop_front();
            }
        }
        {
            let mut baselines = self.baselines.write().await;
            for usage in &devices {
                let utilization = if usage.capacity_bytes == 0 {
                    100.0
                } else {
                    usage.resident_bytes as f64 / usage.capacity_bytes as f64 * 100.0
                };
                let baseline = baselines.entry(usage.device).or_default();
                baseline.push_back(utilization);
                if baseline.len() > self.config.baseline_window {
                    baseline.pop_front();
                }
            }
        }

        let alerts = self.evaluate_alerts(&indicators, &devices).await;
        {
            let mut active = self.active_alerts.write().await;
            *active = alerts.clone();
        }

        metrics::gauge!("modelpool_cache_hit_rate").set(indicators.cache_hit_rate);
        metrics::gauge!("modelpool_avg_loading_time_ms").set(indicators.avg_loading_time_ms);
        metrics::gauge!("modelpool_worst_device_utilization_percent")
            .set(indicators.worst_device_utilization_percent);

        PerformanceMetricsReport {
            indicators,
            devices,
            cache: self.cache.stats().await,
            alerts,
            worker_metrics_error,
            collected_at: chrono::Utc::now(),
        }
    }

    async fn evaluate_alerts(
        &self,
        indicators: &PerformanceIndicators,
        devices: &[DeviceUsage],
    ) -> Vec<Alert> {
        let thresholds = self.thresholds.read().await.clone();
        let mut alerts = Vec::new();
        let now = chrono::Utc::now();

        for usage in devices {
            let utilization = if usage.capacity_bytes == 0 {
                100.0
            } else {
                usage.resident_bytes as f64 / usage.capacity_bytes as f64 * 100.0
            };
            if utilization > thresholds.memory_usage_percent {
                alerts.push(Alert {
                    metric: "memory_usage_percent".into(),
                    value: utilization,
                    threshold: thresholds.memory_usage_percent,
                    severity: Severity::High,
                    device: Some(usage.device),
                    message: format!(
                        "memory usage {utilization:.1}% on {} exceeds {:.1}%",
                        usage.device, thresholds.memory_usage_percent
                    ),
                    at: now,
                });
            }
        }

        if indicators.avg_loading_time_ms > thresholds.loading_time_ms as f64 {
            alerts.push(Alert {
                metric: "avg_loading_time_ms".into(),
                value: indicators.avg_loading_time_ms,
                threshold: thresholds.loading_time_ms as f64,
                severity: Severity::Medium,
                device: None,
                message: format!(
                    "average loading time {:.0} ms exceeds {} ms",
                    indicators.avg_loading_time_ms, thresholds.loading_time_ms
                ),
                at: now,
            });
        }

        if indicators.cache_hit_rate < thresholds.cache_hit_rate {
            alerts.push(Alert {
                metric: "cache_hit_rate".into(),
                value: indicators.cache_hit_rate,
                threshold: thresholds.cache_hit_rate,
                severity: Severity::Medium,
                device: None,
                message: format!(
                    "cache hit rate {:.2} below {:.2}",
                    indicators.cache_hit_rate, thresholds.cache_hit_rate
                ),
                at: now,
            });
        }

        for alert in &alerts {
            metrics::counter!("modelpool_alerts_total").increment(1);
            warn!(metric = %alert.metric, value = alert.value, threshold = alert.threshold, "performance alert");
        }
        alerts
    }

    /// Compare recent snapshots against the rolling baseline, the way a
    /// regression check does: the recent half of the window against the
    /// half before it.
    pub async fn analyze_performance_trends(
        &self,
        window: usize,
    ) -> TrendAnalysisReport {
        let history = self.history.read().await;
        let snapshots: Vec<&PerfSnapshot> =
            history.iter().rev().take(window.max(4)).collect();
        let half = snapshots.len() / 2;
        if half == 0 {
            return TrendAnalysisReport { trends: Vec::new(), snapshots_analyzed: snapshots.len() };
        }

        let recent = &snapshots[..half];
        let baseline = &snapshots[half..];
        let avg = |slice: &[&PerfSnapshot], f: fn(&PerfSnapshot) -> f64| {
            slice.iter().map(|s| f(s)).sum::<f64>() / slice.len() as f64
        };

        let mut trends = Vec::new();
        // (name, extractor, higher_is_better)
        let metrics_spec: [(&str, fn(&PerfSnapshot) -> f64, bool); 3] = [
            ("cache_hit_rate", |s| s.cache_hit_rate, true),
            ("avg_loading_time_ms", |s| s.avg_loading_time_ms, false),
            (
                "worst_device_utilization_percent",
                |s| s.worst_device_utilization_percent,
                false,
            ),
        ];
        for (name, extract, higher_is_better) in metrics_spec {
            let recent_avg = avg(recent, extract);
            let baseline_avg = avg(baseline, extract);
            let delta_percent = if baseline_avg.abs() < f64::EPSILON {
                0.0
            } else {
                (recent_avg - baseline_avg) / baseline_avg * 100.0
            };
            let direction = if delta_percent.abs() < 5.0 {
                TrendDirection::Stable
            } else if (delta_percent > 0.0) == higher_is_better {
                TrendDirection::Improving
            } else {
                TrendDirection::Degrading
            };
            trends.push(MetricTrend {
                metric: name.into(),
                direction,
                recent_avg,
                baseline_avg,
                delta_percent,
            });
        }

        TrendAnalysisReport { trends, snapshots_analyzed: snapshots.len() }
    }

    /// Replace the alert thresholds.
    pub async fn configure_performance_alerts(&self, thresholds: AlertThresholds) {
        info!(?thresholds, "alert thresholds updated");
        *self.thresholds.write().await = thresholds;
    }

    /// Close the loop: snapshot, find bottlenecks, invoke cache/memory
    /// actions, wait, re-snapshot, and compute effectiveness.
    pub async fn optimize_based_on_metrics(
        &self,
        request: OptimizeRequest,
    ) -> MetricsOptimizationReport {
        let before = self.indicators().await;
        let thresholds = self.thresholds.read().await.clone();

        let mut bottlenecks = Vec::new();
        let mut actions = Vec::new();

        if before.cache_hit_rate < thresholds.cache_hit_rate {
            bottlenecks.push(format!("cache hit rate {:.2}", before.cache_hit_rate));
            match self
                .cache
                .optimize_cache(CacheStrategy::Aggressive, None, Some(true))
                .await
            {
                Ok(report) => actions.push(format!(
                    "cache optimization: {} evicted, {} bytes freed",
                    report.evicted.len(),
                    report.bytes_freed
                )),
                Err(err) => actions.push(format!("cache optimization failed: {err}")),
            }
        }

        if before.worst_device_utilization_percent > thresholds.memory_usage_percent {
            bottlenecks.push(format!(
                "device utilization {:.1}%",
                before.worst_device_utilization_percent
            ));
            match self
                .memory
                .optimize_model_memory(request.device, OptimizationLevel::Balanced)
                .await
            {
                Ok(report) => actions.push(format!(
                    "memory optimization reclaimed {} bytes",
                    report.bytes_reclaimed
                )),
                Err(err) => actions.push(format!("memory optimization failed: {err}")),
            }
        }

        if before.avg_loading_time_ms > thresholds.loading_time_ms as f64 {
            bottlenecks.push(format!("avg loading time {:.0} ms", before.avg_loading_time_ms));
            actions.push("predictive caching enabled for next cache pass".into());
        }

        if actions.is_empty() {
            debug!("no bottlenecks found, skipping optimization actions");
        } else {
            tokio::time::sleep(self.config.settle_delay).await;
        }

        let after = self.indicators().await;
        let effectiveness_percent = composite_score(&after) - composite_score(&before);

        MetricsOptimizationReport { before, bottlenecks, actions, after, effectiveness_percent }
    }

    /// Dashboard snapshot: current report, active alerts, uptime.
    pub async fn get_performance_dashboard_data(
        &self,
        device: Option<DeviceId>,
    ) -> DashboardData {
        let current = self.collect_model_performance_metrics(device, None).await;
        let active_alerts = self.active_alerts.read().await.clone();
        DashboardData {
            current,
            active_alerts,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Background collection pass body.
    pub async fn collection_pass(&self) {
        let report = self.collect_model_performance_metrics(None, None).await;
        debug!(
            hit_rate = report.indicators.cache_hit_rate,
            avg_load_ms = report.indicators.avg_loading_time_ms,
            alerts = report.alerts.len(),
            "metrics collection pass finished"
        );
    }

    pub fn collection_guard(&self) -> Arc<SingleFlight> {
        Arc::clone(&self.flight)
    }

    pub async fn active_alert_count(&self) -> usize {
        self.active_alerts.read().await.len()
    }
}

/// 0–100 composite of hit rate and memory headroom, for effectiveness
/// comparison.
fn composite_score(indicators: &PerformanceIndicators) -> f64 {
    let hit_component = indicators.cache_hit_rate * 50.0;
    let headroom_component = (100.0 - indicators.worst_device_utilization_percent) / 2.0;
    hit_component + headroom_component
}
