use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Oracle error: {0}")]
    Oracle(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Structural inconsistency: {0}")]
    Structural(String),

    #[error("Dependency cycle among derived attributes: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SchemaError {
    /// Whether this error came from the oracle boundary (transport, timeout,
    /// provider) rather than from the content of a response.
    pub fn is_oracle_failure(&self) -> bool {
        matches!(self, SchemaError::Oracle(_))
    }
}

pub type Result<T> = std::result::Result<T, SchemaError>;

/// Category of a recovered, item-level problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    GroundingFailure,
    ValidationFailure,
    OracleFailure,
    StructuralInconsistency,
}

/// A problem attached to one item (entity, relation, attribute, key) instead
/// of aborting the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemIssue {
    pub item: String,
    pub kind: IssueKind,
    pub detail: String,
}

impl ItemIssue {
    pub fn new(item: impl Into<String>, kind: IssueKind, detail: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            kind,
            detail: detail.into(),
        }
    }

    pub fn structural(item: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(item, IssueKind::StructuralInconsistency, detail)
    }
}
