//! Common types for the modelpool model-management subsystem
//!
//! This crate provides the foundational types shared across the workspace:
//! component and device identity, the typed error taxonomy with its
//! classification table, memory-pressure levels, worker-boundary message
//! types, configuration, and caller-facing result envelopes.

pub mod component;
pub mod config;
pub mod device;
pub mod envelope;
pub mod error;
pub mod pressure;
pub mod worker;

pub use component::{Component, ComponentSpec, ComponentState, ComponentType};
pub use config::{
    AlertThresholds, CacheConfig, ConfigValidation, CoordinatorConfig, MemoryConfig,
    MonitorConfig, PoolConfig, PredictiveConfig, RecoveryConfig,
};
pub use device::{DeviceId, DeviceKind};
pub use envelope::{ClassifiedFailure, OpReport, Resolution};
pub use error::{
    ErrorCategory, ErrorClassification, ModelError, OperationContext, RecoveryStrategy,
    RootCause, Severity, classify,
};
pub use pressure::MemoryPressure;
pub use worker::{WorkerMetrics, WorkerRequest, WorkerResponse};
