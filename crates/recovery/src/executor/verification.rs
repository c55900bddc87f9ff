//! Resolution verification against the analysis' criteria.

use serde_json::Value;

use crate::model::{
    CausalAnalysisResult, Comparison, CriterionOutcome, ResolutionVerdict, SystemState,
    VerificationCriterion,
};

/// Confidence reported when no criteria are available
pub const ASSUMED_RESOLUTION_CONFIDENCE: f64 = 0.5;

pub fn evaluate_criterion(criterion: &VerificationCriterion, state: &SystemState) -> CriterionOutcome {
    let observed = state.lookup(&criterion.path).filter(|v| !v.is_null());
    let satisfied = match (&observed, criterion.comparison) {
        (None, _) => false,
        (Some(_), Comparison::Exists) => true,
        (Some(value), Comparison::Equals) => values_equal(value, &criterion.expected),
        (Some(value), Comparison::NotEquals) => !values_equal(value, &criterion.expected),
        (Some(value), comparison) => match (value.as_f64(), criterion.expected.as_f64()) {
            (Some(actual), Some(expected)) => match comparison {
                Comparison::LessThan => actual < expected,
                Comparison::LessOrEqual => actual <= expected,
                Comparison::GreaterThan => actual > expected,
                Comparison::GreaterOrEqual => actual >= expected,
                _ => false,
            },
            _ => false,
        },
    };
    CriterionOutcome {
        criterion: criterion.clone(),
        observed,
        satisfied,
    }
}

/// Numbers compare by value so `1` equals `1.0`
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
        _ => a == b,
    }
}

/// Decide whether the diagnosed fault is gone in `state`.
///
/// With criteria, resolution requires every criterion to hold and confidence
/// is the satisfied fraction. Without criteria resolution is assumed at low
/// confidence. Dry runs change nothing, so they never resolve anything.
pub fn verify_resolution(
    analysis: &CausalAnalysisResult,
    state: &SystemState,
    dry_run: bool,
) -> ResolutionVerdict {
    if dry_run {
        return ResolutionVerdict {
            resolved: false,
            confidence: 0.0,
            assumed: false,
            criteria: Vec::new(),
            reason: "dry run: no changes were applied".to_string(),
        };
    }
    if analysis.verification_criteria.is_empty() {
        return ResolutionVerdict {
            resolved: true,
            confidence: ASSUMED_RESOLUTION_CONFIDENCE,
            assumed: true,
            criteria: Vec::new(),
            reason: "no verification criteria; resolution assumed".to_string(),
        };
    }

    let criteria: Vec<CriterionOutcome> = analysis
        .verification_criteria
        .iter()
        .map(|c| evaluate_criterion(c, state))
        .collect();
    let satisfied = criteria.iter().filter(|c| c.satisfied).count();
    let total = criteria.len();
    ResolutionVerdict {
        resolved: satisfied == total,
        confidence: satisfied as f64 / total as f64,
        assumed: false,
        reason: format!("{}/{} verification criteria satisfied", satisfied, total),
        criteria,
    }
}
