//! Predictive pre-loading.
//!
//! Candidates are generated from usage patterns, scored for confidence,
//! and only materialized after validation against currently free
//! resources. A materialized entry counts against the memory budget like
//! any other resident component and expires at the end of the prediction
//! window unless it is accessed first.

use crate::cache::usage::{TrendDirection, UsagePattern};
use serde::Serialize;
use std::time::{Duration, Instant};

/// A speculatively materialized cache entry.
#[derive(Debug, Clone)]
pub struct PredictiveEntry {
    pub component_id: String,
    pub confidence: f64,
    pub bytes: u64,
    pub materialized_at: Instant,
    pub window_end: Instant,
}

impl PredictiveEntry {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.window_end
    }
}

/// A scored pre-load candidate, before validation.
#[derive(Debug, Clone, Serialize)]
pub struct PredictiveCandidate {
    pub component_id: String,
    pub confidence: f64,
    pub bytes: u64,
}

/// Outcome of one predictive pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PredictiveReport {
    pub candidates_considered: usize,
    pub materialized: Vec<String>,
    pub rejected_low_confidence: usize,
    pub rejected_no_resources: usize,
    pub failed_loads: usize,
}

/// Generate candidates from usage patterns: components that are not
/// resident but whose activity forecasts an access inside the prediction
/// window. Sorted by confidence, highest first.
pub fn generate_candidates(
    patterns: &[UsagePattern],
    prediction_window: Duration,
) -> Vec<PredictiveCandidate> {
    let mut candidates: Vec<PredictiveCandidate> = patterns
        .iter()
        .filter(|p| !p.loaded && p.sample_count > 0)
        .filter_map(|p| {
            let confidence = confidence_of(p, prediction_window);
            (confidence > 0.0).then(|| PredictiveCandidate {
                component_id: p.component_id.clone(),
                confidence,
                bytes: p.memory_footprint,
            })
        })
        .collect();
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.component_id.cmp(&b.component_id))
    });
    candidates
}

/// Deterministic confidence score in [0, 1].
///
/// Base from the trend direction, boosted by access frequency and by a
/// periodic pattern whose next access falls inside the window.
fn confidence_of(pattern: &UsagePattern, prediction_window: Duration) -> f64 {
    let base = match pattern.trend {
        TrendDirection::Rising => 0.6,
        TrendDirection::Stable => 0.4,
        TrendDirection::Falling => 0.1,
    };
    let frequency_boost = (pattern.frequency_per_min / 10.0).min(0.2);
    let periodic_boost = match pattern.next_access_in() {
        Some(eta) if eta <= prediction_window.as_secs() => 0.25,
        _ => 0.0,
    };
    (base + frequency_boost + periodic_boost).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(
        id: &str,
        loaded: bool,
        trend: TrendDirection,
        frequency: f64,
        samples: usize,
    ) -> UsagePattern {
        UsagePattern {
            component_id: id.into(),
            frequency_per_min: frequency,
            trend,
            periodicity_secs: None,
            sample_count: samples,
            idle_secs: 5,
            loaded,
            memory_footprint: 1024,
        }
    }

    #[test]
    fn loaded_components_are_not_candidates() {
        let patterns = vec![pattern("resident", true, TrendDirection::Rising, 5.0, 10)];
        assert!(generate_candidates(&patterns, Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn rising_unloaded_component_is_a_candidate() {
        let patterns = vec![
            pattern("warm", false, TrendDirection::Rising, 5.0, 10),
            pattern("cooling", false, TrendDirection::Falling, 0.1, 2),
        ];
        let candidates = generate_candidates(&patterns, Duration::from_secs(60));
        assert_eq!(candidates[0].component_id, "warm");
        assert!(candidates[0].confidence > candidates[1].confidence);
    }

    #[test]
    fn periodic_pattern_due_in_window_scores_higher() {
        let mut periodic = pattern("tick", false, TrendDirection::Stable, 2.0, 8);
        periodic.periodicity_secs = Some(30);
        periodic.idle_secs = 25;
        let aperiodic = pattern("noise", false, TrendDirection::Stable, 2.0, 8);

        let candidates =
            generate_candidates(&[periodic, aperiodic], Duration::from_secs(60));
        assert_eq!(candidates[0].component_id, "tick");
        assert!(candidates[0].confidence - candidates[1].confidence >= 0.2);
    }

    #[test]
    fn never_accessed_components_are_skipped() {
        let patterns = vec![pattern("fresh", false, TrendDirection::Stable, 0.0, 0)];
        assert!(generate_candidates(&patterns, Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn expiry_window_is_respected() {
        let entry = PredictiveEntry {
            component_id: "x".into(),
            confidence: 0.9,
            bytes: 1,
            materialized_at: Instant::now(),
            window_end: Instant::now() + Duration::from_secs(60),
        };
        assert!(!entry.is_expired());

        let expired = PredictiveEntry { window_end: Instant::now(), ..entry };
        assert!(expired.is_expired());
    }
}
