//! Loadable model components and their runtime bookkeeping.

use crate::device::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Maximum access timestamps retained per component for the sliding window.
const ACCESS_WINDOW_CAP: usize = 256;

/// Kind of loadable unit a component represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    Tokenizer,
    TextEncoder,
    Denoiser,
    Decoder,
    Adapter,
    BaseModel,
}

/// Lifecycle state of a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Unloaded,
    Loading,
    Loaded,
    Failed { error: String },
}

impl ComponentState {
    pub fn is_loaded(&self) -> bool {
        matches!(self, ComponentState::Loaded)
    }
}

/// Static description of a loadable component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub id: String,
    /// Logical model this component belongs to; dependency graphs are
    /// cached per model.
    pub model: String,
    pub component_type: ComponentType,
    /// Estimated or measured device-memory footprint in bytes.
    pub memory_footprint: u64,
    /// Component ids that must reach `Loaded` before this one may load.
    pub dependencies: Vec<String>,
}

impl ComponentSpec {
    pub fn new(
        id: impl Into<String>,
        model: impl Into<String>,
        component_type: ComponentType,
        memory_footprint: u64,
    ) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            component_type,
            memory_footprint,
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// Runtime record for one component: spec plus mutable lifecycle and
/// access bookkeeping.
#[derive(Debug, Clone)]
pub struct Component {
    pub spec: ComponentSpec,
    pub state: ComponentState,
    /// Device the component is bound to once loaded.
    pub device: Option<DeviceId>,
    pub last_access: Option<Instant>,
    access_window: VecDeque<Instant>,
}

impl Component {
    pub fn new(spec: ComponentSpec) -> Self {
        Self {
            spec,
            state: ComponentState::Unloaded,
            device: None,
            last_access: None,
            access_window: VecDeque::with_capacity(32),
        }
    }

    /// Record one access at the current instant.
    pub fn record_access(&mut self) {
        let now = Instant::now();
        self.last_access = Some(now);
        self.access_window.push_back(now);
        if self.access_window.len() > ACCESS_WINDOW_CAP {
            self.access_window.pop_front();
        }
    }

    /// Number of recorded accesses within `window` of now.
    pub fn access_count(&self, window: Duration) -> usize {
        let cutoff = Instant::now().checked_sub(window);
        match cutoff {
            Some(cutoff) => self.access_window.iter().filter(|t| **t >= cutoff).count(),
            // Window larger than process uptime: everything counts.
            None => self.access_window.len(),
        }
    }

    /// Accesses per minute over `window`.
    pub fn access_frequency(&self, window: Duration) -> f64 {
        let count = self.access_count(window);
        let minutes = window.as_secs_f64() / 60.0;
        if minutes <= 0.0 { 0.0 } else { count as f64 / minutes }
    }

    /// Time since the last recorded access, if any.
    pub fn idle_for(&self) -> Option<Duration> {
        self.last_access.map(|t| t.elapsed())
    }

    /// Instants of recorded accesses within `window`, oldest first.
    pub fn accesses_within(&self, window: Duration) -> Vec<Instant> {
        let cutoff = Instant::now().checked_sub(window);
        self.access_window
            .iter()
            .copied()
            .filter(|t| cutoff.is_none_or(|c| *t >= c))
            .collect()
    }
}
