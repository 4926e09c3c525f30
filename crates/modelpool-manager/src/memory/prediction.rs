//! Memory requirement prediction.
//!
//! Combines historical allocations observed for an operation type with
//! the request itself and current system state to produce a point
//! estimate, a confidence interval, and an allocation-failure risk
//! classification. Low confidence or high risk carries alternative,
//! lower-memory configurations instead of a single answer.

use modelpool_core::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

/// Observations retained per operation type.
const HISTORY_CAP: usize = 256;
/// Exponential smoothing factor for the historical estimate.
const EWMA_ALPHA: f64 = 0.3;

/// What the caller intends to place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model: String,
    pub component_count: usize,
    pub total_bytes: u64,
    /// Largest single component, used for sequential-loading
    /// alternatives.
    pub largest_component_bytes: u64,
}

/// Probability class of an allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationRisk {
    Low,
    Moderate,
    High,
}

/// A lower-memory configuration offered when the primary answer is
/// uncertain or risky.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlternativeConfig {
    pub description: String,
    pub estimated_bytes: u64,
}

/// Full prediction result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPrediction {
    pub operation_type: String,
    pub device: Option<DeviceId>,
    pub estimated_bytes: u64,
    pub interval_low_bytes: u64,
    pub interval_high_bytes: u64,
    /// 0.0–1.0; grows with sample count, shrinks with variance.
    pub confidence: f64,
    pub risk: AllocationRisk,
    pub failure_probability: f64,
    pub alternatives: Vec<AlternativeConfig>,
}

#[derive(Debug, Default)]
struct OperationHistory {
    observations: VecDeque<u64>,
    ewma: Option<f64>,
}

impl OperationHistory {
    fn record(&mut self, bytes: u64) {
        self.observations.push_back(bytes);
        if self.observations.len() > HISTORY_CAP {
            self.observations.pop_front();
        }
        self.ewma = Some(match self.ewma {
            Some(prev) => EWMA_ALPHA * bytes as f64 + (1.0 - EWMA_ALPHA) * prev,
            None => bytes as f64,
        });
    }

    fn std_dev(&self) -> f64 {
        let n = self.observations.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.observations.iter().sum::<u64>() as f64 / n as f64;
        let var = self
            .observations
            .iter()
            .map(|&x| {
                let d = x as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / (n - 1) as f64;
        var.sqrt()
    }
}

/// Historical allocation tracker and prediction engine.
#[derive(Debug, Default)]
pub struct PredictionEngine {
    history: RwLock<HashMap<String, OperationHistory>>,
}

impl PredictionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record how much memory an operation of this type actually used.
    pub async fn record_observation(&self, operation_type: &str, bytes: u64) {
        let mut history = self.history.write().await;
        history.entry(operation_type.to_string()).or_default().record(bytes);
    }

    /// Predict the requirement for `operation_type` over `model_infos`,
    /// given current free memory and in-flight session count.
    pub async fn predict(
        &self,
        operation_type: &str,
        model_infos: &[ModelInfo],
        device: Option<DeviceId>,
        free_bytes: Option<u64>,
        active_sessions: usize,
    ) -> MemoryPrediction {
        let requested: u64 = model_infos.iter().map(|m| m.total_bytes).sum();

        let (estimate, spread, confidence) = {
            let history = self.history.read().await;
            match history.get(operation_type) {
                Some(h) if h.ewma.is_some() => {
                    let ewma = h.ewma.unwrap_or(requested as f64);
                    // Blend the request with what this operation type has
                    // historically consumed.
                    let estimate = 0.5 * requested as f64 + 0.5 * ewma;
                    let spread = h.std_dev().max(estimate * 0.05);
                    let samples = h.observations.len() as f64;
                    let sample_factor = (samples / 20.0).min(1.0);
                    let cv = if estimate > 0.0 { (spread / estimate).min(1.0) } else { 0.0 };
                    let confidence = (sample_factor * (1.0 - cv)).clamp(0.05, 0.99);
                    (estimate, spread, confidence)
                }
                // No history: the request is the estimate, with a wide
                // interval and low confidence.
                _ => (requested as f64, requested as f64 * 0.25, 0.3),
            }
        };

        // In-flight sessions contend for the same headroom.
        let contention = 1.0 + 0.05 * active_sessions as f64;
        let estimate = estimate * contention;
        let interval_low = (estimate - 1.96 * spread).max(0.0) as u64;
        let interval_high = (estimate + 1.96 * spread) as u64;
        let estimated_bytes = estimate as u64;

        let (risk, failure_probability) = match free_bytes {
            Some(free) if free >= interval_high => (AllocationRisk::Low, 0.05),
            Some(free) if free >= estimated_bytes => (AllocationRisk::Moderate, 0.35),
            Some(_) => (AllocationRisk::High, 0.85),
            // No device figures available: uncertain, not safe.
            None => (AllocationRisk::Moderate, 0.5),
        };

        let alternatives = if risk == AllocationRisk::High || confidence < 0.5 {
            build_alternatives(model_infos, estimated_bytes)
        } else {
            Vec::new()
        };

        MemoryPrediction {
            operation_type: operation_type.to_string(),
            device,
            estimated_bytes,
            interval_low_bytes: interval_low,
            interval_high_bytes: interval_high,
            confidence,
            risk,
            failure_probability,
            alternatives,
        }
    }
}

fn build_alternatives(model_infos: &[ModelInfo], estimated_bytes: u64) -> Vec<AlternativeConfig> {
    let mut alternatives = Vec::new();

    let peak_sequential = model_infos.iter().map(|m| m.largest_component_bytes).max().unwrap_or(0);
    if peak_sequential > 0 && peak_sequential < estimated_bytes {
        alternatives.push(AlternativeConfig {
            description: "load components sequentially, one resident at a time".into(),
            estimated_bytes: peak_sequential,
        });
    }

    alternatives.push(AlternativeConfig {
        description: "use half-precision component variants".into(),
        estimated_bytes: estimated_bytes / 2,
    });

    alternatives
}

#[cfg(test)]
mod tests {
    use super::*;

    fn infos(total: u64, largest: u64) -> Vec<ModelInfo> {
        vec![ModelInfo {
            model: "sd-xl".into(),
            component_count: 3,
            total_bytes: total,
            largest_component_bytes: largest,
        }]
    }

    #[tokio::test]
    async fn cold_start_has_low_confidence_and_alternatives() {
        let engine = PredictionEngine::new();
        let p = engine.predict("load_model", &infos(1000, 600), None, Some(10_000), 0).await;
        assert!(p.confidence < 0.5);
        assert!(!p.alternatives.is_empty());
        assert_eq!(p.estimated_bytes, 1000);
    }

    #[tokio::test]
    async fn history_tightens_confidence() {
        let engine = PredictionEngine::new();
        for _ in 0..30 {
            engine.record_observation("load_model", 1000).await;
        }
        let p = engine.predict("load_model", &infos(1000, 600), None, Some(10_000), 0).await;
        assert!(p.confidence > 0.8, "confidence {}", p.confidence);
        assert_eq!(p.risk, AllocationRisk::Low);
        assert!(p.alternatives.is_empty());
    }

    #[tokio::test]
    async fn risk_scales_with_free_memory() {
        let engine = PredictionEngine::new();
        for _ in 0..30 {
            engine.record_observation("load_model", 1000).await;
        }
        let tight = engine.predict("load_model", &infos(1000, 600), None, Some(500), 0).await;
        assert_eq!(tight.risk, AllocationRisk::High);
        assert!(!tight.alternatives.is_empty());

        let roomy = engine.predict("load_model", &infos(1000, 600), None, Some(100_000), 0).await;
        assert_eq!(roomy.risk, AllocationRisk::Low);
        assert!(tight.failure_probability > roomy.failure_probability);
    }

    #[tokio::test]
    async fn active_sessions_inflate_the_estimate() {
        let engine = PredictionEngine::new();
        let idle = engine.predict("op", &infos(1000, 500), None, Some(10_000), 0).await;
        let busy = engine.predict("op", &infos(1000, 500), None, Some(10_000), 4).await;
        assert!(busy.estimated_bytes > idle.estimated_bytes);
    }

    #[tokio::test]
    async fn sequential_alternative_uses_peak_component() {
        let engine = PredictionEngine::new();
        let p = engine.predict("op", &infos(1000, 400), None, Some(100), 0).await;
        assert_eq!(p.risk, AllocationRisk::High);
        let seq = p
            .alternatives
            .iter()
            .find(|a| a.description.contains("sequentially"))
            .expect("sequential alternative missing");
        assert_eq!(seq.estimated_bytes, 400);
    }
}
