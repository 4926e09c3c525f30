//! The device/memory reporting boundary.

use async_trait::async_trait;
use modelpool_core::{DeviceId, MemoryPressure, ModelError};
use serde::{Deserialize, Serialize};

/// Point-in-time memory figures for one device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceMemory {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl DeviceMemory {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }

    /// Utilization as a percentage (0.0–100.0).
    pub fn utilization_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            self.used_bytes() as f64 / self.total_bytes as f64 * 100.0
        }
    }

    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_bytes(self.used_bytes(), self.total_bytes)
    }
}

/// Per-device capacity and free-memory query interface.
///
/// Consulted before every allocation decision and by the memory
/// optimizer's prediction engine.
#[async_trait]
pub trait MemoryReporter: Send + Sync {
    /// Devices currently known to the reporter.
    async fn devices(&self) -> Vec<DeviceId>;

    /// Memory figures for one device; unknown devices are a validation
    /// failure, not a panic.
    async fn device_memory(&self, device: DeviceId) -> Result<DeviceMemory, ModelError>;
}
