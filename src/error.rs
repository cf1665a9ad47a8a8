//! Error taxonomy shared by the control API and the CLI
//!
//! Module errors map onto an [`ErrorKind`], which fixes both the HTTP status
//! returned by the control API and the CLI exit code.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Internal,
    PlanValidation,
    NotFound,
    Conflict,
    Apply,
    ProbeUnavailable,
    InvalidState,
}

impl ErrorKind {
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Internal => 500,
            ErrorKind::PlanValidation => 422,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict | ErrorKind::InvalidState => 409,
            ErrorKind::Apply => 502,
            ErrorKind::ProbeUnavailable => 503,
        }
    }

    /// CLI exit code (2 is reserved for usage errors, 9 for an unreachable controller)
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Internal => 1,
            ErrorKind::PlanValidation => 3,
            ErrorKind::NotFound => 4,
            ErrorKind::Conflict => 5,
            ErrorKind::Apply => 6,
            ErrorKind::ProbeUnavailable => 7,
            ErrorKind::InvalidState => 8,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Internal => "internal",
            ErrorKind::PlanValidation => "plan_validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Apply => "apply",
            ErrorKind::ProbeUnavailable => "probe_unavailable",
            ErrorKind::InvalidState => "invalid_state",
        };
        f.write_str(s)
    }
}

/// JSON error body of the control API
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}
