//! Wire types for the external worker-pool boundary.
//!
//! The subsystem issues operation requests to a worker pool it does not
//! own. Each request is a structured message with an operation name and a
//! JSON payload; each response carries a success flag, optional numeric
//! metrics, and an error string on failure. Malformed or unsuccessful
//! responses are converted into classified [`ModelError`]s, never panics.

use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operation names understood by the worker pool.
pub mod ops {
    pub const LOAD_COMPONENT: &str = "load_component";
    pub const ANALYZE_COMPONENT_DEPENDENCIES: &str = "analyze_component_dependencies";
    pub const ANALYZE_CACHE_PATTERNS: &str = "analyze_cache_patterns";
    pub const EXECUTE_CACHE_OPTIMIZATION: &str = "execute_cache_optimization";
    pub const ANALYZE_MEMORY_USAGE_PATTERNS: &str = "analyze_memory_usage_patterns";
    pub const COLLECT_COMPREHENSIVE_PERFORMANCE_METRICS: &str =
        "collect_comprehensive_performance_metrics";
}

/// One request to the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub operation: String,
    pub payload: Value,
}

impl WorkerRequest {
    pub fn new(operation: impl Into<String>, payload: Value) -> Self {
        Self { operation: operation.into(), payload }
    }
}

/// Numeric metrics a worker may attach to a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub memory_freed: Option<u64>,
    pub loading_time_ms: Option<u64>,
    pub memory_allocated: Option<u64>,
}

/// Structured worker response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub success: bool,
    #[serde(default)]
    pub metrics: WorkerMetrics,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkerResponse {
    pub fn ok() -> Self {
        Self { success: true, metrics: WorkerMetrics::default(), error: None }
    }

    pub fn ok_with_metrics(metrics: WorkerMetrics) -> Self {
        Self { success: true, metrics, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, metrics: WorkerMetrics::default(), error: Some(error.into()) }
    }

    /// Convert an unsuccessful response into a classified error.
    ///
    /// A response claiming failure without an error string is still
    /// malformed but must not crash; it maps to a generic detail.
    pub fn into_result(self, operation: &str) -> Result<WorkerResponse, ModelError> {
        if self.success {
            Ok(self)
        } else {
            Err(ModelError::ExternalWorker {
                operation: operation.to_string(),
                detail: self.error.unwrap_or_else(|| "worker reported failure without detail".into()),
            })
        }
    }
}
