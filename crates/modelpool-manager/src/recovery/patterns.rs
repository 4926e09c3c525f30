//! Error-pattern aggregation and prevention rules.
//!
//! Historical errors are aggregated to find recurring root causes;
//! recurring classes feed threshold rules that short-circuit anticipated
//! failures before work is admitted, instead of merely retrying them.

use modelpool_core::{DeviceId, ErrorCategory, ErrorClassification, ModelError, RootCause};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One recorded failure, classification attached.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub at: chrono::DateTime<chrono::Utc>,
    pub error: ModelError,
    pub classification: ErrorClassification,
    pub operation: String,
    pub component_id: Option<String>,
    pub device: Option<DeviceId>,
    /// Whether automatic recovery eventually succeeded.
    pub recovered: bool,
}

/// A root cause seen often enough to act on.
#[derive(Debug, Clone, Serialize)]
pub struct RecurringPattern {
    pub root_cause: RootCause,
    pub count: usize,
    pub recovered_count: usize,
    pub recommendation: String,
}

/// Aggregated view over the error history.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPatternAnalysis {
    pub total_errors: usize,
    pub by_category: Vec<(ErrorCategory, usize)>,
    pub recurring: Vec<RecurringPattern>,
    pub recommended_rules: Vec<PreventionRule>,
}

/// Threshold rules that refuse work predicted to fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum PreventionRule {
    /// Refuse loads whose predicted allocation-failure probability
    /// exceeds the bound.
    RefuseHighRiskLoads { max_failure_probability: f64 },
    /// Refuse loads that would leave less than this share of the device
    /// free.
    RequireFreeHeadroom { device: Option<DeviceId>, min_free_percent: f64 },
    /// Refuse any single component above this size.
    MaxComponentBytes { max_bytes: u64 },
}

/// Facts about a load about to be admitted, checked against the rules.
#[derive(Debug, Clone)]
pub struct LoadAdmission {
    pub device: DeviceId,
    pub required_bytes: u64,
    pub device_capacity_bytes: u64,
    pub device_free_bytes: u64,
    pub largest_component_bytes: u64,
    /// From the memory optimizer's prediction, when one was made.
    pub predicted_failure_probability: Option<f64>,
}

/// Evaluate an admission against the installed rules; the first breach
/// refuses the load.
pub fn evaluate_rules(rules: &[PreventionRule], admission: &LoadAdmission) -> Result<(), ModelError> {
    for rule in rules {
        match rule {
            PreventionRule::RefuseHighRiskLoads { max_failure_probability } => {
                if let Some(p) = admission.predicted_failure_probability
                    && p > *max_failure_probability
                {
                    return Err(ModelError::Validation(format!(
                        "load refused by prevention rule: predicted failure probability {p:.2} exceeds {max_failure_probability:.2}"
                    )));
                }
            }
            PreventionRule::RequireFreeHeadroom { device, min_free_percent } => {
                if device.is_none_or(|d| d == admission.device)
                    && admission.device_capacity_bytes > 0
                {
                    let free_after = admission
                        .device_free_bytes
                        .saturating_sub(admission.required_bytes);
                    let free_after_percent =
                        free_after as f64 / admission.device_capacity_bytes as f64 * 100.0;
                    if free_after_percent < *min_free_percent {
                        return Err(ModelError::Validation(format!(
                            "load refused by prevention rule: {free_after_percent:.1}% headroom would remain on {}, {min_free_percent:.1}% required",
                            admission.device
                        )));
                    }
                }
            }
            PreventionRule::MaxComponentBytes { max_bytes } => {
                if admission.largest_component_bytes > *max_bytes {
                    return Err(ModelError::Validation(format!(
                        "load refused by prevention rule: component of {} bytes exceeds cap {max_bytes}",
                        admission.largest_component_bytes
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Aggregate records into recurring patterns and recommended rules.
/// `recurrence_threshold` is how many failures of one root cause count
/// as a pattern.
pub fn analyze_records(
    records: &[ErrorRecord],
    recurrence_threshold: usize,
) -> ErrorPatternAnalysis {
    let mut by_category: HashMap<ErrorCategory, usize> = HashMap::new();
    let mut by_root_cause: HashMap<RootCause, (usize, usize)> = HashMap::new();
    for record in records {
        *by_category.entry(record.classification.category).or_insert(0) += 1;
        let entry = by_root_cause.entry(record.classification.root_cause).or_insert((0, 0));
        entry.0 += 1;
        if record.recovered {
            entry.1 += 1;
        }
    }

    let mut recurring: Vec<RecurringPattern> = by_root_cause
        .into_iter()
        .filter(|(_, (count, _))| *count >= recurrence_threshold)
        .map(|(root_cause, (count, recovered_count))| RecurringPattern {
            recommendation: recommendation_for(root_cause),
            root_cause,
            count,
            recovered_count,
        })
        .collect();
    recurring.sort_by(|a, b| b.count.cmp(&a.count));

    let recommended_rules = recurring
        .iter()
        .filter_map(|p| rule_for(p.root_cause))
        .collect();

    let mut by_category: Vec<(ErrorCategory, usize)> = by_category.into_iter().collect();
    by_category.sort_by(|a, b| b.1.cmp(&a.1));

    ErrorPatternAnalysis {
        total_errors: records.len(),
        by_category,
        recurring,
        recommended_rules,
    }
}

fn recommendation_for(root_cause: RootCause) -> String {
    match root_cause {
        RootCause::MemoryExhaustion => {
            "refuse high-risk loads and keep free headroom on the device".into()
        }
        RootCause::MissingArtifact => "verify artifact paths before registering components".into(),
        RootCause::VersionSkew => "pin compatible component versions per model".into(),
        RootCause::Contention => "lower the concurrent-load cap or raise timeouts".into(),
        RootCause::InvalidDefinition => "validate model definitions at registration".into(),
        RootCause::CacheInconsistency => "shorten the cache optimization interval".into(),
        RootCause::ExternalService => "inspect worker-pool health; the breaker limits blast radius".into(),
        RootCause::Undetermined => "collect diagnostics; flag for manual review".into(),
    }
}

/// Root causes that translate into an installable threshold rule.
fn rule_for(root_cause: RootCause) -> Option<PreventionRule> {
    match root_cause {
        RootCause::MemoryExhaustion => {
            Some(PreventionRule::RefuseHighRiskLoads { max_failure_probability: 0.7 })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelpool_core::{OperationContext, classify};

    fn record(error: ModelError, recovered: bool) -> ErrorRecord {
        let ctx = OperationContext::for_operation("load_component_set");
        let classification = classify(&error, &ctx);
        ErrorRecord {
            at: chrono::Utc::now(),
            error,
            classification,
            operation: ctx.operation,
            component_id: None,
            device: None,
            recovered,
        }
    }

    fn oom() -> ModelError {
        ModelError::InsufficientMemory {
            device: DeviceId::cuda(0),
            required_bytes: 100,
            available_bytes: 10,
        }
    }

    #[test]
    fn recurring_memory_exhaustion_recommends_a_rule() {
        let records: Vec<ErrorRecord> = (0..3).map(|_| record(oom(), false)).collect();
        let analysis = analyze_records(&records, 3);
        assert_eq!(analysis.total_errors, 3);
        assert_eq!(analysis.recurring.len(), 1);
        assert_eq!(analysis.recurring[0].root_cause, RootCause::MemoryExhaustion);
        assert!(matches!(
            analysis.recommended_rules[0],
            PreventionRule::RefuseHighRiskLoads { .. }
        ));
    }

    #[test]
    fn below_threshold_is_not_recurring() {
        let records = vec![record(oom(), false), record(oom(), true)];
        let analysis = analyze_records(&records, 3);
        assert!(analysis.recurring.is_empty());
        assert!(analysis.recommended_rules.is_empty());
    }

    fn admission(free: u64, prob: Option<f64>) -> LoadAdmission {
        LoadAdmission {
            device: DeviceId::cuda(0),
            required_bytes: 100,
            device_capacity_bytes: 1000,
            device_free_bytes: free,
            largest_component_bytes: 100,
            predicted_failure_probability: prob,
        }
    }

    #[test]
    fn high_risk_rule_refuses_predicted_failures() {
        let rules = vec![PreventionRule::RefuseHighRiskLoads { max_failure_probability: 0.7 }];
        assert!(evaluate_rules(&rules, &admission(500, Some(0.85))).is_err());
        assert!(evaluate_rules(&rules, &admission(500, Some(0.3))).is_ok());
        // No prediction available: the rule cannot fire.
        assert!(evaluate_rules(&rules, &admission(500, None)).is_ok());
    }

    #[test]
    fn headroom_rule_accounts_for_the_load_itself() {
        let rules = vec![PreventionRule::RequireFreeHeadroom { device: None, min_free_percent: 20.0 }];
        // 250 free - 100 load = 150 = 15% < 20%: refused.
        assert!(evaluate_rules(&rules, &admission(250, None)).is_err());
        // 350 free - 100 = 250 = 25%: admitted.
        assert!(evaluate_rules(&rules, &admission(350, None)).is_ok());
    }

    #[test]
    fn component_size_cap() {
        let rules = vec![PreventionRule::MaxComponentBytes { max_bytes: 50 }];
        assert!(evaluate_rules(&rules, &admission(900, None)).is_err());
    }
}
