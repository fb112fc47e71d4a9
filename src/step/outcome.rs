use crate::error::IssueKind;
use serde::{Deserialize, Serialize};

/// Where a value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Oracle,
    Fallback,
}

/// Why a step ended on its fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackCause {
    /// Transport error, timeout or provider failure on any call
    Oracle,
    /// The repair response was still rejected
    Validation,
    /// The task running the step died before producing an outcome
    Task,
}

impl FallbackCause {
    pub fn issue_kind(self) -> IssueKind {
        match self {
            FallbackCause::Validation => IssueKind::ValidationFailure,
            FallbackCause::Oracle | FallbackCause::Task => IssueKind::OracleFailure,
        }
    }
}

/// Result of one step: accepted on the first call, accepted after the repair
/// call, or produced by the deterministic fallback.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome<T> {
    Ok(T),
    Repaired(T),
    Fallback {
        value: T,
        cause: FallbackCause,
        reason: String,
    },
}

impl<T> StepOutcome<T> {
    pub fn provenance(&self) -> Provenance {
        match self {
            StepOutcome::Ok(_) | StepOutcome::Repaired(_) => Provenance::Oracle,
            StepOutcome::Fallback { .. } => Provenance::Fallback,
        }
    }

    pub fn value(&self) -> &T {
        match self {
            StepOutcome::Ok(v) | StepOutcome::Repaired(v) => v,
            StepOutcome::Fallback { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            StepOutcome::Ok(v) | StepOutcome::Repaired(v) => v,
            StepOutcome::Fallback { value, .. } => value,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, StepOutcome::Fallback { .. })
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            StepOutcome::Fallback { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub fn fallback_cause(&self) -> Option<FallbackCause> {
        match self {
            StepOutcome::Fallback { cause, .. } => Some(*cause),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StepOutcome<U> {
        match self {
            StepOutcome::Ok(v) => StepOutcome::Ok(f(v)),
            StepOutcome::Repaired(v) => StepOutcome::Repaired(f(v)),
            StepOutcome::Fallback { value, cause, reason } => StepOutcome::Fallback {
                value: f(value),
                cause,
                reason,
            },
        }
    }
}
