//! Structured error handling and bounded automatic recovery.
//!
//! Every failure is classified before it is reported. Recoverable
//! classifications run their selected strategy with bounded attempts and
//! exponential backoff, exiting on first success; exhaustion always
//! surfaces a manual-intervention signal. The per-error lifecycle is an
//! explicit state machine so exhaustion and success paths are
//! independently testable.

pub mod breaker;
pub mod patterns;

use crate::cache::CacheCoordinator;
use crate::memory::{DefragStrategy, MemoryOptimizer, OptimizationLevel};
use crate::workers::WorkerPool;
use modelpool_core::worker::ops;
use modelpool_core::{
    ErrorClassification, ModelError, OperationContext, RecoveryConfig, RecoveryStrategy,
    WorkerRequest, classify,
};
use patterns::{ErrorPatternAnalysis, ErrorRecord, LoadAdmission, PreventionRule};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Retained error records.
const HISTORY_CAP: usize = 1024;

/// Lifecycle of one error-handling session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    Analyzing,
    Classified,
    RecoveryPlanning,
    AttemptingRecovery { attempt: u32 },
    RecoveredSuccessfully { attempts: u32 },
    RequiresManualIntervention,
    HandlingFailed,
}

impl RecoveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecoveryState::RecoveredSuccessfully { .. }
                | RecoveryState::RequiresManualIntervention
                | RecoveryState::HandlingFailed
        )
    }
}

/// Events driving the state machine.
#[derive(Debug, Clone, Copy)]
pub enum RecoveryEvent {
    Classified,
    /// Unrecoverable classification; `manual_review` picks the terminal
    /// state.
    Unrecoverable { manual_review: bool },
    PlanSelected,
    AttemptStarted,
    AttemptSucceeded,
    AttemptsExhausted,
}

/// Explicit transition table. Any combination outside it is a handling
/// defect and lands in `HandlingFailed` rather than panicking.
pub fn advance(state: RecoveryState, event: RecoveryEvent) -> RecoveryState {
    use RecoveryEvent as E;
    use RecoveryState as S;
    match (state, event) {
        (S::Analyzing, E::Classified) => S::Classified,
        (S::Classified, E::Unrecoverable { manual_review: true }) => S::RequiresManualIntervention,
        (S::Classified, E::Unrecoverable { manual_review: false }) => S::HandlingFailed,
        (S::Classified, E::PlanSelected) => S::RecoveryPlanning,
        (S::RecoveryPlanning, E::AttemptStarted) => S::AttemptingRecovery { attempt: 1 },
        (S::AttemptingRecovery { attempt }, E::AttemptStarted) => {
            S::AttemptingRecovery { attempt: attempt + 1 }
        }
        (S::AttemptingRecovery { attempt }, E::AttemptSucceeded) => {
            S::RecoveredSuccessfully { attempts: attempt }
        }
        (S::AttemptingRecovery { .. }, E::AttemptsExhausted) => S::RequiresManualIntervention,
        _ => S::HandlingFailed,
    }
}

/// One recovery attempt with its actions and yield.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAttempt {
    pub attempt: u32,
    pub strategy: RecoveryStrategy,
    pub success: bool,
    pub duration_ms: u64,
    pub actions: Vec<String>,
    pub memory_recovered_bytes: u64,
}

/// Full report for one handled error.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub error: ModelError,
    pub classification: ErrorClassification,
    pub final_state: RecoveryState,
    pub attempts: Vec<RecoveryAttempt>,
    pub duration_ms: u64,
}

/// Outcome of running an operation under recovery.
pub enum RecoveryOutcome<T> {
    /// The operation succeeded, possibly after recovery attempts.
    Succeeded { value: T, attempts: u32 },
    /// Recovery could not rescue the operation.
    Failed { report: Box<ErrorReport> },
}

struct StrategyOutcome {
    success: bool,
    actions: Vec<String>,
    memory_recovered_bytes: u64,
}

/// The error handler.
pub struct ErrorHandler {
    config: RecoveryConfig,
    workers: Arc<dyn WorkerPool>,
    memory: OnceLock<Arc<MemoryOptimizer>>,
    cache: OnceLock<Arc<CacheCoordinator>>,
    history: RwLock<VecDeque<ErrorRecord>>,
    rules: RwLock<Vec<PreventionRule>>,
}

impl ErrorHandler {
    pub fn new(config: RecoveryConfig, workers: Arc<dyn WorkerPool>) -> Self {
        Self {
            config,
            workers,
            memory: OnceLock::new(),
            cache: OnceLock::new(),
            history: RwLock::new(VecDeque::new()),
            rules: RwLock::new(Vec::new()),
        }
    }

    /// Wire the collaborators the recovery strategies act on. Called
    /// once during pool construction.
    pub fn wire(&self, memory: Arc<MemoryOptimizer>, cache: Arc<CacheCoordinator>) {
        let _ = self.memory.set(memory);
        let _ = self.cache.set(cache);
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.config.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let backoff = self.config.initial_backoff.mul_f64(factor);
        backoff.min(self.config.max_backoff)
    }

    /// Handle an already-raised error with no operation to replay:
    /// classify, then run the strategy's resource actions with bounded
    /// attempts.
    pub async fn handle_error(&self, error: ModelError, ctx: OperationContext) -> ErrorReport {
        let started = Instant::now();
        let mut state = RecoveryState::Analyzing;
        let classification = classify(&error, &ctx);
        state = advance(state, RecoveryEvent::Classified);
        debug!(error = %error, classification = ?classification, "error classified");

        let mut attempts = Vec::new();
        if !classification.recoverable {
            state = advance(
                state,
                RecoveryEvent::Unrecoverable {
                    manual_review: classification.needs_manual_review,
                },
            );
        } else {
            state = advance(state, RecoveryEvent::PlanSelected);
            for attempt in 1..=self.config.max_attempts {
                state = advance(state, RecoveryEvent::AttemptStarted);
                if attempt > 1 {
                    tokio::time::sleep(self.backoff_for(attempt)).await;
                }

                let attempt_started = Instant::now();
                let outcome = self
                    .execute_strategy(classification.strategy, &ctx, attempt)
                    .await;
                attempts.push(RecoveryAttempt {
                    attempt,
                    strategy: classification.strategy,
                    success: outcome.success,
                    duration_ms: attempt_started.elapsed().as_millis() as u64,
                    actions: outcome.actions,
                    memory_recovered_bytes: outcome.memory_recovered_bytes,
                });

                if outcome.success {
                    state = advance(state, RecoveryEvent::AttemptSucceeded);
                    break;
                }
            }
            if !state.is_terminal() {
                state = advance(state, RecoveryEvent::AttemptsExhausted);
            }
        }

        let recovered = matches!(state, RecoveryState::RecoveredSuccessfully { .. });
        self.record(&error, &classification, &ctx, recovered).await;

        if recovered {
            info!(error = %error, "error recovered automatically");
        } else {
            warn!(error = %error, final_state = ?state, "error not recovered");
        }

        ErrorReport {
            error,
            classification,
            final_state: state,
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Run `op` under automatic recovery: on a recoverable failure,
    /// execute the strategy's resource actions and replay the operation,
    /// bounded by the attempt budget. Exits on the first success.
    pub async fn run_with_recovery<T, F, Fut>(
        &self,
        ctx: OperationContext,
        op: F,
    ) -> RecoveryOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ModelError>>,
    {
        let started = Instant::now();
        let first_error = match op().await {
            Ok(value) => return RecoveryOutcome::Succeeded { value, attempts: 0 },
            Err(err) => err,
        };

        let mut state = RecoveryState::Analyzing;
        let classification = classify(&first_error, &ctx);
        state = advance(state, RecoveryEvent::Classified);

        let mut attempts = Vec::new();
        let mut last_error = first_error.clone();

        if !classification.recoverable {
            state = advance(
                state,
                RecoveryEvent::Unrecoverable {
                    manual_review: classification.needs_manual_review,
                },
            );
        } else {
            state = advance(state, RecoveryEvent::PlanSelected);
            for attempt in 1..=self.config.max_attempts {
                state = advance(state, RecoveryEvent::AttemptStarted);
                tokio::time::sleep(self.backoff_for(attempt)).await;

                let attempt_started = Instant::now();
                // With an operation to replay, the replay itself is the
                // retry; only the other strategies need side actions.
                let side = if classification.strategy == RecoveryStrategy::Retry {
                    StrategyOutcome {
                        success: true,
                        actions: vec![format!("backoff before retry (attempt {attempt})")],
                        memory_recovered_bytes: 0,
                    }
                } else {
                    self.execute_strategy(classification.strategy, &ctx, attempt).await
                };
                let mut actions = side.actions;

                let replay = tokio::time::timeout(self.config.attempt_timeout, op()).await;
                let (success, error) = match replay {
                    Ok(Ok(value)) => {
                        actions.push("replayed original operation".into());
                        attempts.push(RecoveryAttempt {
                            attempt,
                            strategy: classification.strategy,
                            success: true,
                            duration_ms: attempt_started.elapsed().as_millis() as u64,
                            actions,
                            memory_recovered_bytes: side.memory_recovered_bytes,
                        });
                        let state = advance(state, RecoveryEvent::AttemptSucceeded);
                        debug_assert!(state.is_terminal());
                        self.record(&last_error, &classification, &ctx, true).await;
                        info!(
                            operation = %ctx.operation,
                            attempt,
                            "operation recovered"
                        );
                        return RecoveryOutcome::Succeeded { value, attempts: attempt };
                    }
                    Ok(Err(err)) => {
                        actions.push("replayed original operation".into());
                        (false, err)
                    }
                    Err(_) => (
                        false,
                        ModelError::Timeout {
                            operation: ctx.operation.clone(),
                            timeout_ms: self.config.attempt_timeout.as_millis() as u64,
                        },
                    ),
                };

                attempts.push(RecoveryAttempt {
                    attempt,
                    strategy: classification.strategy,
                    success,
                    duration_ms: attempt_started.elapsed().as_millis() as u64,
                    actions,
                    memory_recovered_bytes: side.memory_recovered_bytes,
                });
                last_error = error;
            }
            state = advance(state, RecoveryEvent::AttemptsExhausted);
        }

        self.record(&last_error, &classification, &ctx, false).await;
        warn!(
            operation = %ctx.operation,
            error = %last_error,
            final_state = ?state,
            "operation failed after recovery"
        );
        RecoveryOutcome::Failed {
            report: Box::new(ErrorReport {
                error: last_error,
                classification,
                final_state: state,
                attempts,
                duration_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    /// Execute one strategy's resource actions.
    async fn execute_strategy(
        &self,
        strategy: RecoveryStrategy,
        ctx: &OperationContext,
        attempt: u32,
    ) -> StrategyOutcome {
        let mut actions = Vec::new();
        let mut recovered = 0u64;
        let success = match strategy {
            RecoveryStrategy::None => false,
            RecoveryStrategy::Retry => {
                // The replay itself is the action; with a standalone
                // worker request in context, replay it here.
                match &ctx.worker_request {
                    Some(request) => {
                        actions.push(format!("replay worker operation {}", request.operation));
                        matches!(
                            self.workers.execute(request.clone()).await,
                            Ok(response) if response.success
                        )
                    }
                    None => {
                        actions.push(format!("backoff before retry (attempt {attempt})"));
                        true
                    }
                }
            }
            RecoveryStrategy::MemoryOptimization => match self.memory.get() {
                Some(memory) => {
                    match memory
                        .optimize_model_memory(ctx.device, OptimizationLevel::Aggressive)
                        .await
                    {
                        Ok(report) => {
                            recovered = report.bytes_reclaimed;
                            actions.push(format!(
                                "memory optimization reclaimed {} bytes",
                                report.bytes_reclaimed
                            ));
                            report.bytes_reclaimed > 0 || report.defragmented.is_some()
                        }
                        Err(err) => {
                            actions.push(format!("memory optimization failed: {err}"));
                            false
                        }
                    }
                }
                None => {
                    actions.push("memory optimizer unavailable".into());
                    false
                }
            },
            RecoveryStrategy::CacheClear => match self.cache.get() {
                Some(cache) => {
                    recovered = cache.clear_unpinned(ctx.device).await;
                    actions.push(format!("cache clear freed {recovered} bytes"));
                    true
                }
                None => {
                    actions.push("cache coordinator unavailable".into());
                    false
                }
            },
            RecoveryStrategy::ResourceReallocation => match self.memory.get() {
                Some(memory) => {
                    match memory
                        .defragment_model_memory(ctx.device, DefragStrategy::Compact, true)
                        .await
                    {
                        Ok(report) => {
                            let moved: u64 =
                                report.devices.iter().map(|d| d.bytes_moved).sum();
                            actions.push(format!("reallocation moved {moved} bytes"));
                            report.devices.iter().any(|d| d.performed)
                        }
                        Err(err) => {
                            actions.push(format!("reallocation failed: {err}"));
                            false
                        }
                    }
                }
                None => {
                    actions.push("memory optimizer unavailable".into());
                    false
                }
            },
            RecoveryStrategy::ComponentReload => {
                let Some(component_id) = &ctx.component_id else {
                    actions.push("no component in context to reload".into());
                    return StrategyOutcome { success: false, actions, memory_recovered_bytes: 0 };
                };
                if let Some(cache) = self.cache.get() {
                    if let Ok(freed) = cache.evict_component(component_id, "component reload").await
                    {
                        recovered = freed;
                        actions.push(format!("unloaded {component_id} ({freed} bytes)"));
                    }
                }
                let request = WorkerRequest::new(
                    ops::LOAD_COMPONENT,
                    serde_json::json!({ "component_id": component_id, "reload": true }),
                );
                actions.push(format!("reload {component_id} via worker pool"));
                matches!(
                    self.workers.execute(request).await,
                    Ok(response) if response.success
                )
            }
        };
        StrategyOutcome { success, actions, memory_recovered_bytes: recovered }
    }

    /// Record a failure that was handled elsewhere (degraded merges,
    /// skipped dependents) so pattern analysis still sees it.
    pub async fn note_failure(&self, error: &ModelError, ctx: &OperationContext) {
        let classification = classify(error, ctx);
        self.record(error, &classification, ctx, false).await;
    }

    async fn record(
        &self,
        error: &ModelError,
        classification: &ErrorClassification,
        ctx: &OperationContext,
        recovered: bool,
    ) {
        {
            let mut history = self.history.write().await;
            history.push_back(ErrorRecord {
                at: chrono::Utc::now(),
                error: error.clone(),
                classification: *classification,
                operation: ctx.operation.clone(),
                component_id: ctx.component_id.clone(),
                device: ctx.device,
                recovered,
            });
            if history.len() > HISTORY_CAP {
                history.pop_front();
            }
        }
        metrics::counter!("modelpool_errors_total").increment(1);
        if recovered {
            metrics::counter!("modelpool_recoveries_total").increment(1);
        }
        self.install_auto_rules().await;
    }

    /// Recurring failure classes feed prevention rules automatically so
    /// repeats are pre-empted rather than retried.
    async fn install_auto_rules(&self) {
        let analysis = {
            let history = self.history.read().await;
            let records: Vec<ErrorRecord> = history.iter().cloned().collect();
            patterns::analyze_records(&records, self.config.auto_prevention_threshold)
        };
        if analysis.recommended_rules.is_empty() {
            return;
        }
        let mut rules = self.rules.write().await;
        for rule in analysis.recommended_rules {
            if !rules.contains(&rule) {
                info!(rule = ?rule, "installing automatic prevention rule");
                rules.push(rule);
            }
        }
    }

    /// Aggregate the retained history into recurring patterns.
    pub async fn analyze_error_patterns(&self) -> ErrorPatternAnalysis {
        let history = self.history.read().await;
        let records: Vec<ErrorRecord> = history.iter().cloned().collect();
        patterns::analyze_records(&records, self.config.auto_prevention_threshold)
    }

    /// Install caller-supplied prevention rules, keeping existing ones.
    pub async fn configure_error_prevention(&self, new_rules: Vec<PreventionRule>) {
        let mut rules = self.rules.write().await;
        for rule in new_rules {
            if !rules.contains(&rule) {
                rules.push(rule);
            }
        }
    }

    pub async fn prevention_rules(&self) -> Vec<PreventionRule> {
        self.rules.read().await.clone()
    }

    /// Check a load about to be admitted against the installed rules.
    pub async fn check_admission(&self, admission: &LoadAdmission) -> Result<(), ModelError> {
        let rules = self.rules.read().await;
        patterns::evaluate_rules(&rules, admission)
    }

    pub async fn error_history_len(&self) -> usize {
        self.history.read().await.len()
    }
}
