//! Usage-pattern analysis over the component registry.
//!
//! Produces per-component rolling statistics: access frequency, trend
//! direction across the analysis window, and a periodicity marker when
//! the inter-access gaps are regular enough to predict from.

use crate::registry::ComponentRegistry;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Direction of access activity across the analysis window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Rising,
    Stable,
    Falling,
}

/// Rolling statistics for one component.
#[derive(Debug, Clone, Serialize)]
pub struct UsagePattern {
    pub component_id: String,
    pub frequency_per_min: f64,
    pub trend: TrendDirection,
    /// Mean inter-access gap when accesses are regular; absent for
    /// bursty or sparse activity.
    pub periodicity_secs: Option<u64>,
    pub sample_count: usize,
    pub idle_secs: u64,
    pub loaded: bool,
    pub memory_footprint: u64,
}

impl UsagePattern {
    /// Seconds until the next access this pattern forecasts, if its
    /// periodicity supports a forecast.
    pub fn next_access_in(&self) -> Option<u64> {
        let period = self.periodicity_secs?;
        Some(period.saturating_sub(self.idle_secs))
    }
}

/// Analyze every registered component over `window`.
pub async fn analyze_usage(registry: &ComponentRegistry, window: Duration) -> Vec<UsagePattern> {
    let now = Instant::now();
    let mut patterns: Vec<UsagePattern> = registry
        .snapshot()
        .await
        .into_iter()
        .map(|component| {
            let accesses = component.accesses_within(window);
            let trend = trend_of(&accesses, window, now);
            let periodicity_secs = periodicity_of(&accesses);
            UsagePattern {
                component_id: component.spec.id.clone(),
                frequency_per_min: component.access_frequency(window),
                trend,
                periodicity_secs,
                sample_count: accesses.len(),
                idle_secs: component.idle_for().map(|d| d.as_secs()).unwrap_or(u64::MAX),
                loaded: component.state.is_loaded(),
                memory_footprint: component.spec.memory_footprint,
            }
        })
        .collect();
    patterns.sort_by(|a, b| a.component_id.cmp(&b.component_id));
    patterns
}

/// Compare the two halves of the window: markedly more accesses in the
/// recent half is a rising trend, markedly fewer a falling one.
fn trend_of(accesses: &[Instant], window: Duration, now: Instant) -> TrendDirection {
    if accesses.len() < 4 {
        return TrendDirection::Stable;
    }
    let midpoint = now.checked_sub(window / 2);
    let Some(midpoint) = midpoint else {
        return TrendDirection::Stable;
    };
    let recent = accesses.iter().filter(|t| **t >= midpoint).count() as f64;
    let older = (accesses.len() as f64) - recent;
    if older == 0.0 {
        return TrendDirection::Rising;
    }
    let ratio = recent / older;
    if ratio > 1.25 {
        TrendDirection::Rising
    } else if ratio < 0.75 {
        TrendDirection::Falling
    } else {
        TrendDirection::Stable
    }
}

/// Accesses are periodic when at least three inter-access gaps exist and
/// their spread stays within a quarter of the mean gap.
fn periodicity_of(accesses: &[Instant]) -> Option<u64> {
    if accesses.len() < 4 {
        return None;
    }
    let gaps: Vec<f64> = accesses.windows(2).map(|w| (w[1] - w[0]).as_secs_f64()).collect();
    let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
    if mean <= 0.0 {
        return None;
    }
    let var = gaps.iter().map(|g| (g - mean) * (g - mean)).sum::<f64>() / gaps.len() as f64;
    let cv = var.sqrt() / mean;
    (cv < 0.25).then_some(mean.round() as u64)
}
