//! Graded memory-pressure signal for eviction and relief decisions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Memory pressure levels, ordered from lowest to highest.
///
/// Levels are derived from device utilization: below 50% is `Low`,
/// 50–80% `Medium`, 80–95% `High`, and 95% or above `Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    Low,
    Medium,
    High,
    Critical,
}

impl MemoryPressure {
    pub const MEDIUM_THRESHOLD: f64 = 50.0;
    pub const HIGH_THRESHOLD: f64 = 80.0;
    pub const CRITICAL_THRESHOLD: f64 = 95.0;

    /// Classify a utilization percentage (0.0–100.0).
    pub fn from_utilization(percent: f64) -> Self {
        match percent {
            p if p < Self::MEDIUM_THRESHOLD => MemoryPressure::Low,
            p if p < Self::HIGH_THRESHOLD => MemoryPressure::Medium,
            p if p < Self::CRITICAL_THRESHOLD => MemoryPressure::High,
            _ => MemoryPressure::Critical,
        }
    }

    /// Classify from used and total bytes. A zero-capacity device is
    /// treated as critically pressured.
    pub fn from_bytes(used_bytes: u64, total_bytes: u64) -> Self {
        if total_bytes == 0 {
            return MemoryPressure::Critical;
        }
        Self::from_utilization(used_bytes as f64 / total_bytes as f64 * 100.0)
    }

    /// Whether relief actions should run at this level.
    pub fn needs_relief(&self) -> bool {
        *self >= MemoryPressure::Medium
    }
}

impl fmt::Display for MemoryPressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemoryPressure::Low => "Low",
            MemoryPressure::Medium => "Medium",
            MemoryPressure::High => "High",
            MemoryPressure::Critical => "Critical",
        };
        write!(f, "{s}")
    }
}
