//! Authoritative per-device memory accounting.
//!
//! The ledger enforces two invariants for the whole subsystem: the sum of
//! resident component footprints on a device never exceeds its capacity,
//! and a component pinned by an in-flight loading session is never
//! reported as evictable. All mutation goes through `reserve`/`release`
//! so the accounting cannot drift from the residency it describes.

use crate::reporter::{DeviceMemory, MemoryReporter};
use async_trait::async_trait;
use modelpool_core::{DeviceId, MemoryPressure, ModelError};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct DeviceAccount {
    capacity_bytes: u64,
    /// Resident component footprints, keyed by component id.
    resident: HashMap<String, u64>,
    /// Pin counts; a component with a non-zero count is referenced by at
    /// least one in-flight session.
    pins: HashMap<String, u32>,
}

impl DeviceAccount {
    fn resident_bytes(&self) -> u64 {
        self.resident.values().sum()
    }
}

/// Snapshot of one device's accounting.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceUsage {
    pub device: DeviceId,
    pub capacity_bytes: u64,
    pub resident_bytes: u64,
    pub component_count: usize,
    pub pinned_count: usize,
    pub pressure: MemoryPressure,
}

/// Thread-safe device memory ledger.
#[derive(Debug, Default)]
pub struct DeviceLedger {
    accounts: RwLock<HashMap<DeviceId, DeviceAccount>>,
}

impl DeviceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device with its capacity. Re-registration updates the
    /// capacity but keeps existing residency.
    pub async fn register_device(&self, device: DeviceId, capacity_bytes: u64) {
        let mut accounts = self.accounts.write().await;
        accounts.entry(device).or_default().capacity_bytes = capacity_bytes;
        debug!(device = %device, capacity_bytes, "device registered in ledger");
    }

    /// Reserve `bytes` for a component, failing if the device would
    /// exceed its capacity or is unknown.
    pub async fn reserve(
        &self,
        device: DeviceId,
        component_id: &str,
        bytes: u64,
    ) -> Result<(), ModelError> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(&device)
            .ok_or_else(|| ModelError::Validation(format!("unknown device {device}")))?;

        if account.resident.contains_key(component_id) {
            return Err(ModelError::Validation(format!(
                "component {component_id} already resident on {device}"
            )));
        }

        let resident = account.resident_bytes();
        let available = account.capacity_bytes.saturating_sub(resident);
        if bytes > available {
            return Err(ModelError::InsufficientMemory {
                device,
                required_bytes: bytes,
                available_bytes: available,
            });
        }

        account.resident.insert(component_id.to_string(), bytes);
        Ok(())
    }

    /// Release a component's reservation, returning the bytes freed
    /// (zero if it was not resident).
    pub async fn release(&self, device: DeviceId, component_id: &str) -> u64 {
        let mut accounts = self.accounts.write().await;
        let Some(account) = accounts.get_mut(&device) else {
            return 0;
        };
        account.resident.remove(component_id).unwrap_or(0)
    }

    /// Pin a component on behalf of an in-flight session.
    pub async fn pin(&self, device: DeviceId, component_id: &str) {
        let mut accounts = self.accounts.write().await;
        if let Some(account) = accounts.get_mut(&device) {
            *account.pins.entry(component_id.to_string()).or_insert(0) += 1;
        }
    }

    /// Drop one pin; the component becomes evictable once all pins are
    /// released.
    pub async fn unpin(&self, device: DeviceId, component_id: &str) {
        let mut accounts = self.accounts.write().await;
        if let Some(account) = accounts.get_mut(&device)
            && let Some(count) = account.pins.get_mut(component_id)
        {
            *count -= 1;
            if *count == 0 {
                account.pins.remove(component_id);
            }
        }
    }

    pub async fn is_pinned(&self, device: DeviceId, component_id: &str) -> bool {
        let accounts = self.accounts.read().await;
        accounts
            .get(&device)
            .is_some_and(|a| a.pins.get(component_id).copied().unwrap_or(0) > 0)
    }

    /// Resident components on a device with their footprints.
    pub async fn resident_components(&self, device: DeviceId) -> Vec<(String, u64)> {
        let accounts = self.accounts.read().await;
        accounts
            .get(&device)
            .map(|a| a.resident.iter().map(|(id, bytes)| (id.clone(), *bytes)).collect())
            .unwrap_or_default()
    }

    /// Accounting snapshot across all registered devices.
    pub async fn usage_snapshot(&self) -> Vec<DeviceUsage> {
        let accounts = self.accounts.read().await;
        let mut usage: Vec<DeviceUsage> = accounts
            .iter()
            .map(|(device, account)| {
                let resident = account.resident_bytes();
                DeviceUsage {
                    device: *device,
                    capacity_bytes: account.capacity_bytes,
                    resident_bytes: resident,
                    component_count: account.resident.len(),
                    pinned_count: account.pins.len(),
                    pressure: MemoryPressure::from_bytes(resident, account.capacity_bytes),
                }
            })
            .collect();
        usage.sort_by_key(|u| u.device);
        usage
    }

    /// Current pressure on one device.
    pub async fn pressure(&self, device: DeviceId) -> Result<MemoryPressure, ModelError> {
        self.device_memory(device).await.map(|m| m.pressure())
    }
}

#[async_trait]
impl MemoryReporter for DeviceLedger {
    async fn devices(&self) -> Vec<DeviceId> {
        let accounts = self.accounts.read().await;
        let mut devices: Vec<DeviceId> = accounts.keys().copied().collect();
        devices.sort();
        devices
    }

    async fn device_memory(&self, device: DeviceId) -> Result<DeviceMemory, ModelError> {
        let accounts = self.accounts.read().await;
        let account = accounts
            .get(&device)
            .ok_or_else(|| ModelError::Validation(format!("unknown device {device}")))?;
        let resident = account.resident_bytes();
        Ok(DeviceMemory {
            total_bytes: account.capacity_bytes,
            free_bytes: account.capacity_bytes.saturating_sub(resident),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV: DeviceId = DeviceId::cuda(0);

    async fn ledger(capacity: u64) -> DeviceLedger {
        let ledger = DeviceLedger::new();
        ledger.register_device(DEV, capacity).await;
        ledger
    }

    #[tokio::test]
    async fn reserve_respects_capacity() {
        let ledger = ledger(1000).await;
        ledger.reserve(DEV, "a", 600).await.unwrap();

        let err = ledger.reserve(DEV, "b", 500).await.unwrap_err();
        match err {
            ModelError::InsufficientMemory { required_bytes, available_bytes, .. } => {
                assert_eq!(required_bytes, 500);
                assert_eq!(available_bytes, 400);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // Exactly fitting the remainder is allowed.
        ledger.reserve(DEV, "c", 400).await.unwrap();
        let mem = ledger.device_memory(DEV).await.unwrap();
        assert_eq!(mem.free_bytes, 0);
    }

    #[tokio::test]
    async fn release_returns_freed_bytes() {
        let ledger = ledger(1000).await;
        ledger.reserve(DEV, "a", 300).await.unwrap();
        assert_eq!(ledger.release(DEV, "a").await, 300);
        assert_eq!(ledger.release(DEV, "a").await, 0);
        let mem = ledger.device_memory(DEV).await.unwrap();
        assert_eq!(mem.free_bytes, 1000);
    }

    #[tokio::test]
    async fn double_reserve_is_rejected() {
        let ledger = ledger(1000).await;
        ledger.reserve(DEV, "a", 100).await.unwrap();
        assert!(matches!(
            ledger.reserve(DEV, "a", 100).await,
            Err(ModelError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn pin_counts_are_reference_counted() {
        let ledger = ledger(1000).await;
        ledger.reserve(DEV, "a", 100).await.unwrap();

        ledger.pin(DEV, "a").await;
        ledger.pin(DEV, "a").await;
        assert!(ledger.is_pinned(DEV, "a").await);

        ledger.unpin(DEV, "a").await;
        assert!(ledger.is_pinned(DEV, "a").await);

        ledger.unpin(DEV, "a").await;
        assert!(!ledger.is_pinned(DEV, "a").await);
    }

    #[tokio::test]
    async fn unknown_device_is_validation_error() {
        let ledger = DeviceLedger::new();
        assert!(matches!(
            ledger.reserve(DeviceId::cuda(7), "a", 1).await,
            Err(ModelError::Validation(_))
        ));
        assert!(matches!(
            ledger.device_memory(DeviceId::cuda(7)).await,
            Err(ModelError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn conservation_under_interleaved_ops() {
        let ledger = ledger(10_000).await;
        for i in 0..20 {
            ledger.reserve(DEV, &format!("c{i}"), 400).await.unwrap();
            if i % 2 == 0 {
                ledger.release(DEV, &format!("c{i}")).await;
            }
            let mem = ledger.device_memory(DEV).await.unwrap();
            assert!(mem.used_bytes() <= mem.total_bytes);
        }
        let snapshot = ledger.usage_snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].component_count, 10);
        assert_eq!(snapshot[0].resident_bytes, 4000);
    }
}
