use crate::model::RolloutPlan;
use std::time::Duration;
use thiserror::Error;

/// Reasons a RolloutPlan is rejected at start
#[derive(Debug, Error, PartialEq)]
pub enum PlanValidationError {
    #[error("{0} cannot be empty")]
    EmptyField(&'static str),

    #[error("{field} '{value}' is not a valid DNS-1123 name")]
    InvalidName { field: &'static str, value: String },

    #[error("{field} must be {min}-100, got {value}")]
    WeightOutOfRange {
        field: &'static str,
        min: i32,
        value: i32,
    },

    #[error("initialWeight ({initial}) cannot exceed maxWeight ({max})")]
    InitialAboveMax { initial: i32, max: i32 },

    #[error("successThreshold must be in (0.0, 1.0], got {0}")]
    InvalidThreshold(f64),

    #[error("{field} invalid: '{value}' (expected e.g. \"30s\", \"5m\", \"1h\")")]
    InvalidDuration { field: &'static str, value: String },

    #[error("stableRevision and canaryRevision must differ")]
    SameRevision,

    #[error("stable and canary ingress must differ")]
    SameIngress,

    #[error("maxLatencyMs must be > 0, got {0}")]
    InvalidLatency(f64),
}

/// Validate a RolloutPlan before it is allowed to start
///
/// # Validation Rules
/// - `service`, revisions and ingress names are non-empty DNS-1123 names
/// - revisions differ, ingress names differ
/// - `initialWeight` is 0-100, `stepSize` and `maxWeight` are 1-100
/// - `initialWeight <= maxWeight`
/// - `successThreshold` is in (0, 1]
/// - `stepInterval` and `bakeDuration` parse (see [`parse_duration`])
/// - `maxLatencyMs` is positive
pub fn validate_plan(plan: &RolloutPlan) -> Result<(), PlanValidationError> {
    validate_name("service", &plan.service)?;
    validate_name("namespace", &plan.namespace)?;

    if plan.stable_revision.trim().is_empty() {
        return Err(PlanValidationError::EmptyField("stableRevision"));
    }
    if plan.canary_revision.trim().is_empty() {
        return Err(PlanValidationError::EmptyField("canaryRevision"));
    }
    if plan.stable_revision == plan.canary_revision {
        return Err(PlanValidationError::SameRevision);
    }

    check_weight("initialWeight", plan.initial_weight, 0)?;
    check_weight("stepSize", plan.step_size, 1)?;
    check_weight("maxWeight", plan.max_weight, 1)?;

    if plan.initial_weight > plan.max_weight {
        return Err(PlanValidationError::InitialAboveMax {
            initial: plan.initial_weight,
            max: plan.max_weight,
        });
    }

    if !(plan.success_threshold > 0.0 && plan.success_threshold <= 1.0) {
        return Err(PlanValidationError::InvalidThreshold(plan.success_threshold));
    }

    if parse_duration(&plan.step_interval).is_none() {
        return Err(PlanValidationError::InvalidDuration {
            field: "stepInterval",
            value: plan.step_interval.clone(),
        });
    }

    if let Some(bake) = &plan.bake_duration {
        if parse_duration(bake).is_none() {
            return Err(PlanValidationError::InvalidDuration {
                field: "bakeDuration",
                value: bake.clone(),
            });
        }
    }

    if let Some(latency) = plan.max_latency_ms {
        if !(latency > 0.0) {
            return Err(PlanValidationError::InvalidLatency(latency));
        }
    }

    let stable_ingress = plan.stable_ingress();
    let canary_ingress = plan.canary_ingress();
    validate_name("ingress.stable", &stable_ingress)?;
    validate_name("ingress.canary", &canary_ingress)?;
    if stable_ingress == canary_ingress {
        return Err(PlanValidationError::SameIngress);
    }

    if let Some(routing) = &plan.routing {
        if routing.host.trim().is_empty() {
            return Err(PlanValidationError::EmptyField("routing.host"));
        }
        if !(1..=65535).contains(&routing.port) {
            return Err(PlanValidationError::WeightOutOfRange {
                field: "routing.port",
                min: 1,
                value: routing.port,
            });
        }
    }

    Ok(())
}

fn check_weight(field: &'static str, value: i32, min: i32) -> Result<(), PlanValidationError> {
    if (min..=100).contains(&value) {
        Ok(())
    } else {
        Err(PlanValidationError::WeightOutOfRange { field, min, value })
    }
}

/// DNS-1123 label: lowercase alphanumerics and '-', 1-63 chars, alphanumeric at both ends
fn validate_name(field: &'static str, value: &str) -> Result<(), PlanValidationError> {
    if value.is_empty() {
        return Err(PlanValidationError::EmptyField(field));
    }

    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_ends = !value.starts_with('-') && !value.ends_with('-');

    if value.len() > 63 || !valid_chars || !valid_ends {
        return Err(PlanValidationError::InvalidName {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Parse a duration string like "5m", "30s", "1h" into std::time::Duration
///
/// Supported formats:
/// - "30s" → 30 seconds (max 24h = 86400s)
/// - "5m" → 5 minutes (max 24h = 1440m)
/// - "2h" → 2 hours (max 1 week = 168h)
///
/// Zero durations are rejected.
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let duration_str = duration_str.trim();

    if duration_str.is_empty() {
        return None;
    }

    let unit = duration_str.chars().last()?;
    let number_str = &duration_str[..duration_str.len() - unit.len_utf8()];
    let number: u64 = number_str.parse().ok()?;

    if number == 0 {
        return None;
    }

    match unit {
        's' if number <= 86400 => Some(Duration::from_secs(number)),
        'm' if number <= 1440 => number.checked_mul(60).map(Duration::from_secs),
        // Hours above a week are almost certainly a typo
        'h' if number <= 168 => number.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}
