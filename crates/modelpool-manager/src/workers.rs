//! Worker-pool boundary.
//!
//! Model-execution workers live outside this subsystem and are consumed
//! as a capability: a [`WorkerPool`] accepts structured operation
//! requests and returns structured responses. [`GuardedWorkerPool`] wraps
//! any implementation with the recovery circuit breaker so a failing
//! worker fleet short-circuits instead of being hammered.
//! [`SimulatedWorkerPool`] is a deterministic stand-in for tests and
//! local development.

use crate::recovery::breaker::CircuitBreaker;
use async_trait::async_trait;
use modelpool_core::worker::ops;
use modelpool_core::{ModelError, WorkerMetrics, WorkerRequest, WorkerResponse};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

/// Capability interface to the external worker pool.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Execute one operation. Transport-level failures surface as
    /// `ModelError::ExternalWorker`; an application-level failure is a
    /// well-formed response with `success == false`.
    async fn execute(&self, request: WorkerRequest) -> Result<WorkerResponse, ModelError>;
}

/// Execute a request and fold an unsuccessful response into a classified
/// error, so callers handle exactly one failure path.
pub async fn execute_checked(
    pool: &dyn WorkerPool,
    request: WorkerRequest,
) -> Result<WorkerResponse, ModelError> {
    let operation = request.operation.clone();
    let response = pool.execute(request).await?;
    response.into_result(&operation)
}

/// Worker pool wrapper that applies a circuit breaker to every call.
///
/// While the breaker is open, calls fail fast with a classified
/// external-worker error instead of reaching the fleet.
pub struct GuardedWorkerPool {
    inner: Arc<dyn WorkerPool>,
    breaker: CircuitBreaker,
}

impl GuardedWorkerPool {
    pub fn new(inner: Arc<dyn WorkerPool>, failure_threshold: u64, cooldown: Duration) -> Self {
        Self { inner, breaker: CircuitBreaker::new(failure_threshold, cooldown) }
    }

    pub async fn breaker_state(&self) -> crate::recovery::breaker::BreakerState {
        self.breaker.state().await
    }
}

#[async_trait]
impl WorkerPool for GuardedWorkerPool {
    async fn execute(&self, request: WorkerRequest) -> Result<WorkerResponse, ModelError> {
        if !self.breaker.can_execute().await {
            warn!(operation = %request.operation, "worker call short-circuited, breaker open");
            return Err(ModelError::ExternalWorker {
                operation: request.operation,
                detail: "circuit breaker open".into(),
            });
        }

        match self.inner.execute(request).await {
            Ok(response) if response.success => {
                self.breaker.record_success().await;
                Ok(response)
            }
            Ok(response) => {
                self.breaker.record_failure().await;
                Ok(response)
            }
            Err(err) => {
                self.breaker.record_failure().await;
                Err(err)
            }
        }
    }
}

/// Deterministic in-process worker pool for tests and local runs.
///
/// Every operation succeeds with plausible metrics unless a failure has
/// been scripted for it. Failure scripts are consumed call by call, so
/// "fail the first two loads, then recover" scenarios are expressible.
#[derive(Default)]
pub struct SimulatedWorkerPool {
    latency: Option<Duration>,
    scripted_failures: Mutex<HashMap<String, u64>>,
    calls: Mutex<HashMap<String, u64>>,
    total_calls: AtomicU64,
}

impl SimulatedWorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Script the next `count` calls of `operation` to fail.
    pub async fn fail_next(&self, operation: &str, count: u64) {
        let mut scripted = self.scripted_failures.lock().await;
        *scripted.entry(operation.to_string()).or_insert(0) += count;
    }

    /// Number of calls seen for `operation`.
    pub async fn calls_for(&self, operation: &str) -> u64 {
        let calls = self.calls.lock().await;
        calls.get(operation).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    fn metrics_for(operation: &str) -> WorkerMetrics {
        match operation {
            ops::LOAD_COMPONENT => WorkerMetrics {
                loading_time_ms: Some(25),
                memory_allocated: Some(1024),
                ..Default::default()
            },
            ops::EXECUTE_CACHE_OPTIMIZATION => {
                WorkerMetrics { memory_freed: Some(2048), ..Default::default() }
            }
            _ => WorkerMetrics::default(),
        }
    }
}

#[async_trait]
impl WorkerPool for SimulatedWorkerPool {
    async fn execute(&self, request: WorkerRequest) -> Result<WorkerResponse, ModelError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        self.total_calls.fetch_add(1, Ordering::Relaxed);
        {
            let mut calls = self.calls.lock().await;
            *calls.entry(request.operation.clone()).or_insert(0) += 1;
        }

        let mut scripted = self.scripted_failures.lock().await;
        if let Some(remaining) = scripted.get_mut(&request.operation)
            && *remaining > 0
        {
            *remaining -= 1;
            return Ok(WorkerResponse::failed(format!(
                "simulated failure for {}",
                request.operation
            )));
        }

        Ok(WorkerResponse::ok_with_metrics(Self::metrics_for(&request.operation)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn simulated_pool_succeeds_by_default() {
        let pool = SimulatedWorkerPool::new();
        let resp = pool
            .execute(WorkerRequest::new(ops::LOAD_COMPONENT, json!({"component": "unet"})))
            .await
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.metrics.loading_time_ms, Some(25));
        assert_eq!(pool.calls_for(ops::LOAD_COMPONENT).await, 1);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let pool = SimulatedWorkerPool::new();
        pool.fail_next(ops::LOAD_COMPONENT, 2).await;

        for _ in 0..2 {
            let resp = pool
                .execute(WorkerRequest::new(ops::LOAD_COMPONENT, json!({})))
                .await
                .unwrap();
            assert!(!resp.success);
        }
        let resp = pool.execute(WorkerRequest::new(ops::LOAD_COMPONENT, json!({}))).await.unwrap();
        assert!(resp.success);
    }

    #[tokio::test]
    async fn execute_checked_classifies_failures() {
        let pool = SimulatedWorkerPool::new();
        pool.fail_next(ops::ANALYZE_CACHE_PATTERNS, 1).await;
        let err = execute_checked(
            &pool,
            WorkerRequest::new(ops::ANALYZE_CACHE_PATTERNS, json!({})),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ModelError::ExternalWorker { .. }));
    }

    #[tokio::test]
    async fn guarded_pool_opens_after_threshold() {
        let inner = Arc::new(SimulatedWorkerPool::new());
        inner.fail_next(ops::LOAD_COMPONENT, 10).await;
        let guarded = GuardedWorkerPool::new(inner.clone(), 3, Duration::from_secs(60));

        for _ in 0..3 {
            let _ = guarded.execute(WorkerRequest::new(ops::LOAD_COMPONENT, json!({}))).await;
        }

        // Breaker is now open: the inner pool must not see this call.
        let before = inner.total_calls();
        let err = guarded
            .execute(WorkerRequest::new(ops::LOAD_COMPONENT, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::ExternalWorker { .. }));
        assert_eq!(inner.total_calls(), before);
    }
}
