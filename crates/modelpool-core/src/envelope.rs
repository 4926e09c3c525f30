//! Caller-facing result envelopes.
//!
//! Operations on the public surface return a structured report rather
//! than raising: a success flag, a typed payload on success, and on
//! failure the original error together with its classification. Callers
//! can distinguish a clean success, a success reached through automatic
//! recovery, and a failure that requires manual intervention.

use crate::error::{ErrorClassification, ModelError, classify, OperationContext};
use serde::Serialize;

/// How an operation concluded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Succeeded,
    SucceededAfterRecovery { attempts: u32 },
    Failed,
    RequiresManualIntervention,
}

/// A failure with its classification attached, root cause preserved.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedFailure {
    pub error: ModelError,
    pub classification: ErrorClassification,
}

impl ClassifiedFailure {
    pub fn new(error: ModelError, ctx: &OperationContext) -> Self {
        let classification = classify(&error, ctx);
        Self { error, classification }
    }
}

/// Structured result for one caller-facing operation.
#[derive(Debug, Clone, Serialize)]
pub struct OpReport<T> {
    pub resolution: Resolution,
    pub payload: Option<T>,
    pub failure: Option<ClassifiedFailure>,
}

impl<T> OpReport<T> {
    pub fn succeeded(payload: T) -> Self {
        Self { resolution: Resolution::Succeeded, payload: Some(payload), failure: None }
    }

    pub fn after_recovery(payload: T, attempts: u32) -> Self {
        Self {
            resolution: Resolution::SucceededAfterRecovery { attempts },
            payload: Some(payload),
            failure: None,
        }
    }

    /// Build a failure report; exhausted-or-unrecoverable failures that
    /// were flagged for review resolve to manual intervention.
    pub fn failed(error: ModelError, ctx: &OperationContext, manual_intervention: bool) -> Self {
        let failure = ClassifiedFailure::new(error, ctx);
        let resolution = if manual_intervention || failure.classification.needs_manual_review {
            Resolution::RequiresManualIntervention
        } else {
            Resolution::Failed
        };
        Self { resolution, payload: None, failure: Some(failure) }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.resolution,
            Resolution::Succeeded | Resolution::SucceededAfterRecovery { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Severity;

    #[test]
    fn success_report_carries_payload() {
        let report = OpReport::succeeded(42u32);
        assert!(report.is_success());
        assert_eq!(report.payload, Some(42));
        assert!(report.failure.is_none());
    }

    #[test]
    fn unknown_error_escalates_to_manual_intervention() {
        let ctx = OperationContext::for_operation("x");
        let report: OpReport<()> = OpReport::failed(ModelError::Unknown("boom".into()), &ctx, false);
        assert_eq!(report.resolution, Resolution::RequiresManualIntervention);
        let failure = report.failure.unwrap();
        assert_eq!(failure.classification.severity, Severity::High);
    }

    #[test]
    fn recovery_resolution_records_attempts() {
        let report = OpReport::after_recovery("ok", 2);
        assert!(report.is_success());
        assert_eq!(report.resolution, Resolution::SucceededAfterRecovery { attempts: 2 });
    }
}
