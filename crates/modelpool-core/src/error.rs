//! Typed error taxonomy and deterministic classification.
//!
//! Failures carry their own variant rather than relying on runtime type
//! inspection; [`classify`] maps every variant to exactly one
//! classification tuple (category, severity, recoverable, strategy, root
//! cause), matched exhaustively so the compiler enforces totality.

use crate::device::DeviceId;
use crate::worker::WorkerRequest;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All failure modes the subsystem classifies.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum ModelError {
    #[error(
        "insufficient memory on {device}: required {required_bytes} bytes, {available_bytes} available"
    )]
    InsufficientMemory { device: DeviceId, required_bytes: u64, available_bytes: u64 },

    #[error("component artifact missing or corrupt: {path}")]
    ArtifactUnavailable { path: String },

    #[error("memory allocation failed on {device}: {detail}")]
    AllocationFailed { device: DeviceId, detail: String },

    #[error("component {component_id} incompatible: {detail}")]
    Incompatible { component_id: String, detail: String },

    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("cache operation failed: {0}")]
    Cache(String),

    #[error("worker pool failure during {operation}: {detail}")]
    ExternalWorker { operation: String, detail: String },

    #[error("unclassified failure: {0}")]
    Unknown(String),
}

/// Where in the subsystem a failure originated.
///
/// Carried alongside the error so diagnostics and pattern analysis can
/// group failures; classification itself depends only on the error
/// variant and is therefore deterministic for repeated classification of
/// the same failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationContext {
    pub operation: String,
    pub component_id: Option<String>,
    pub device: Option<DeviceId>,
    pub session_id: Option<String>,
    /// The worker request that failed, when the operation was a worker
    /// call; enables the Retry strategy to replay it.
    pub worker_request: Option<WorkerRequest>,
}

impl OperationContext {
    pub fn for_operation(operation: impl Into<String>) -> Self {
        Self { operation: operation.into(), ..Default::default() }
    }

    pub fn with_component(mut self, component_id: impl Into<String>) -> Self {
        self.component_id = Some(component_id.into());
        self
    }

    pub fn with_device(mut self, device: DeviceId) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_worker_request(mut self, request: WorkerRequest) -> Self {
        self.worker_request = Some(request);
        self
    }
}

/// Error taxonomy category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Loading,
    Memory,
    Compatibility,
    Timeout,
    Validation,
    Cache,
    ExternalWorker,
    Unknown,
}

/// Impact grade of a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Automatic recovery strategy selected for a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    None,
    Retry,
    MemoryOptimization,
    ComponentReload,
    CacheClear,
    ResourceReallocation,
}

/// Root-cause category used by pattern analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootCause {
    MemoryExhaustion,
    MissingArtifact,
    VersionSkew,
    Contention,
    InvalidDefinition,
    CacheInconsistency,
    ExternalService,
    Undetermined,
}

/// Full classification tuple for one failure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub recoverable: bool,
    pub strategy: RecoveryStrategy,
    pub root_cause: RootCause,
    /// Set for unclassified failures that must be surfaced for manual
    /// review rather than retried.
    pub needs_manual_review: bool,
}

/// Classify a failure. Total over every [`ModelError`] variant and
/// deterministic: the same error always yields the same tuple.
pub fn classify(error: &ModelError, _ctx: &OperationContext) -> ErrorClassification {
    use ErrorCategory as C;
    use RecoveryStrategy as S;
    use RootCause as R;
    use Severity as V;

    let tuple = |category, severity, recoverable, strategy, root_cause, review| {
        ErrorClassification {
            category,
            severity,
            recoverable,
            strategy,
            root_cause,
            needs_manual_review: review,
        }
    };

    match error {
        ModelError::InsufficientMemory { .. } => {
            tuple(C::Loading, V::High, true, S::MemoryOptimization, R::MemoryExhaustion, false)
        }
        ModelError::ArtifactUnavailable { .. } => {
            tuple(C::Loading, V::Medium, false, S::None, R::MissingArtifact, false)
        }
        ModelError::AllocationFailed { .. } => {
            tuple(C::Memory, V::High, true, S::MemoryOptimization, R::MemoryExhaustion, false)
        }
        ModelError::Incompatible { .. } => {
            tuple(C::Compatibility, V::Medium, false, S::None, R::VersionSkew, false)
        }
        ModelError::Timeout { .. } => {
            tuple(C::Timeout, V::Medium, true, S::Retry, R::Contention, false)
        }
        ModelError::DependencyCycle { .. } => {
            tuple(C::Validation, V::Medium, false, S::None, R::InvalidDefinition, false)
        }
        ModelError::Validation(_) => {
            tuple(C::Validation, V::Medium, false, S::None, R::InvalidDefinition, false)
        }
        ModelError::Cache(_) => {
            tuple(C::Cache, V::Medium, true, S::CacheClear, R::CacheInconsistency, false)
        }
        ModelError::ExternalWorker { .. } => {
            tuple(C::ExternalWorker, V::Medium, true, S::Retry, R::ExternalService, false)
        }
        ModelError::Unknown(_) => tuple(C::Unknown, V::High, false, S::None, R::Undetermined, true),
    }
}
