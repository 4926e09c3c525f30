//! Shared component registry.
//!
//! Runtime table of every component the subsystem has seen: spec, state,
//! device binding, and access bookkeeping. The coordinator drives state
//! transitions, the cache coordinator reads access statistics, and the
//! memory optimizer scans residency. State-plus-device updates happen
//! under one write lock so the pair is always consistent.

use modelpool_core::{Component, ComponentSpec, ComponentState, DeviceId, ModelError};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct ComponentRegistry {
    table: RwLock<HashMap<String, Component>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component spec; the component starts `Unloaded`.
    /// Registering an existing id replaces the spec but keeps runtime
    /// bookkeeping.
    pub async fn register(&self, spec: ComponentSpec) {
        let mut table = self.table.write().await;
        match table.get_mut(&spec.id) {
            Some(existing) => existing.spec = spec,
            None => {
                table.insert(spec.id.clone(), Component::new(spec));
            }
        }
    }

    pub async fn spec(&self, id: &str) -> Option<ComponentSpec> {
        let table = self.table.read().await;
        table.get(id).map(|c| c.spec.clone())
    }

    pub async fn state(&self, id: &str) -> Option<ComponentState> {
        let table = self.table.read().await;
        table.get(id).map(|c| c.state.clone())
    }

    pub async fn device(&self, id: &str) -> Option<DeviceId> {
        let table = self.table.read().await;
        table.get(id).and_then(|c| c.device)
    }

    /// Transition a component's state; `Loaded` binds it to a device,
    /// any other state clears the binding.
    pub async fn set_state(
        &self,
        id: &str,
        state: ComponentState,
        device: Option<DeviceId>,
    ) -> Result<(), ModelError> {
        let mut table = self.table.write().await;
        let component = table
            .get_mut(id)
            .ok_or_else(|| ModelError::Validation(format!("unknown component {id}")))?;
        component.device = if state.is_loaded() { device } else { None };
        component.state = state;
        Ok(())
    }

    pub async fn record_access(&self, id: &str) {
        let mut table = self.table.write().await;
        if let Some(component) = table.get_mut(id) {
            component.record_access();
        }
    }

    /// Ids of components currently loaded on `device`, or on any device
    /// when `device` is `None`.
    pub async fn loaded_components(&self, device: Option<DeviceId>) -> Vec<String> {
        let table = self.table.read().await;
        table
            .values()
            .filter(|c| c.state.is_loaded() && device.is_none_or(|d| c.device == Some(d)))
            .map(|c| c.spec.id.clone())
            .collect()
    }

    /// Loaded components whose access frequency over `window` is below
    /// `min_frequency`, coldest first.
    pub async fn cold_components(
        &self,
        device: Option<DeviceId>,
        window: Duration,
        min_frequency: f64,
    ) -> Vec<(String, u64, f64)> {
        let table = self.table.read().await;
        let mut cold: Vec<(String, u64, f64)> = table
            .values()
            .filter(|c| c.state.is_loaded() && device.is_none_or(|d| c.device == Some(d)))
            .map(|c| (c.spec.id.clone(), c.spec.memory_footprint, c.access_frequency(window)))
            .filter(|(_, _, freq)| *freq < min_frequency)
            .collect();
        cold.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));
        cold
    }

    /// Loaded components idle for at least `idle`, stalest first.
    pub async fn idle_components(
        &self,
        device: Option<DeviceId>,
        idle: Duration,
    ) -> Vec<(String, u64)> {
        let table = self.table.read().await;
        let mut idle_set: Vec<(String, u64, Duration)> = table
            .values()
            .filter(|c| c.state.is_loaded() && device.is_none_or(|d| c.device == Some(d)))
            .filter_map(|c| {
                let idle_for = c.idle_for().unwrap_or(Duration::MAX);
                (idle_for >= idle).then(|| (c.spec.id.clone(), c.spec.memory_footprint, idle_for))
            })
            .collect();
        idle_set.sort_by(|a, b| b.2.cmp(&a.2));
        idle_set.into_iter().map(|(id, bytes, _)| (id, bytes)).collect()
    }

    /// Specs of every component belonging to one logical model.
    pub async fn specs_for_model(&self, model: &str) -> Vec<ComponentSpec> {
        let table = self.table.read().await;
        let mut specs: Vec<ComponentSpec> = table
            .values()
            .filter(|c| c.spec.model == model)
            .map(|c| c.spec.clone())
            .collect();
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        specs
    }

    /// Snapshot of every component for analysis passes.
    pub async fn snapshot(&self) -> Vec<Component> {
        let table = self.table.read().await;
        table.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelpool_core::ComponentType;

    fn spec(id: &str, bytes: u64) -> ComponentSpec {
        ComponentSpec::new(id, "sd-xl", ComponentType::Denoiser, bytes)
    }

    #[tokio::test]
    async fn register_and_transition() {
        let registry = ComponentRegistry::new();
        registry.register(spec("unet", 4096)).await;
        assert_eq!(registry.state("unet").await, Some(ComponentState::Unloaded));

        registry
            .set_state("unet", ComponentState::Loaded, Some(DeviceId::cuda(0)))
            .await
            .unwrap();
        assert_eq!(registry.device("unet").await, Some(DeviceId::cuda(0)));

        registry.set_state("unet", ComponentState::Unloaded, None).await.unwrap();
        assert_eq!(registry.device("unet").await, None);
    }

    #[tokio::test]
    async fn unknown_component_transition_fails() {
        let registry = ComponentRegistry::new();
        assert!(registry.set_state("ghost", ComponentState::Loading, None).await.is_err());
    }

    #[tokio::test]
    async fn cold_scan_orders_by_frequency() {
        let registry = ComponentRegistry::new();
        registry.register(spec("hot", 100)).await;
        registry.register(spec("cold", 100)).await;
        for id in ["hot", "cold"] {
            registry
                .set_state(id, ComponentState::Loaded, Some(DeviceId::cuda(0)))
                .await
                .unwrap();
        }
        for _ in 0..10 {
            registry.record_access("hot").await;
        }

        let cold = registry
            .cold_components(Some(DeviceId::cuda(0)), Duration::from_secs(60), 5.0)
            .await;
        assert_eq!(cold.len(), 1);
        assert_eq!(cold[0].0, "cold");
    }

    #[tokio::test]
    async fn reregistration_keeps_bookkeeping() {
        let registry = ComponentRegistry::new();
        registry.register(spec("vae", 100)).await;
        registry.record_access("vae").await;
        registry.register(spec("vae", 200)).await;
        let snap = registry.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].spec.memory_footprint, 200);
        assert!(snap[0].last_access.is_some());
    }
}
