use std::{error::Error, str::FromStr};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field-keyed validation error messages.
///
/// Messages per field keep their first-seen order; duplicates are suppressed
/// at insertion time by the context, so consumers can treat the vectors as
/// ordered sets.
pub type FieldErrors = IndexMap<String, Vec<String>>;

/// The business operation a pipeline run is performing.
///
/// Stored inside the context's `meta` table under the `operation` key and
/// consumed by rule evaluation to decide identifier-field exclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Creating a new record; identifier fields are excluded from validation.
    Create,
    /// Updating an existing record. This is the default for every context.
    #[default]
    Update,
}

impl Operation {
    /// Wire representation used inside `meta["operation"]`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
        }
    }
}

impl FromStr for Operation {
    type Err = ParseOperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            _ => Err(ParseOperationError),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOperationError;

impl std::fmt::Display for ParseOperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("invalid operation; expected 'create' or 'update'")
    }
}

impl Error for ParseOperationError {}

/// Completion status of a pipeline context.
///
/// The status is monotonic: once a context reaches [`ContextStatus::Complete`]
/// it never reverts, and further action invocations against it are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStatus {
    /// The pipeline has not finished; actions may still run.
    #[default]
    Incomplete,
    /// Terminal state reached after a successful run.
    Complete,
}

impl ContextStatus {
    /// Returns true when the context has reached its terminal state.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// Structured capture of the last unexpected error raised during a run.
///
/// Built by the engine when an error escapes a unit of work and stored under
/// `internal_only["error_info"]` for post-mortem inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Best-effort classification of the error (downcast name or `"error"`).
    pub kind: String,
    /// Top-level error message.
    pub message: String,
    /// Display lines for the underlying cause chain, outermost first.
    #[serde(default)]
    pub causes: Vec<String>,
    /// Cleaned backtrace excerpt, capped to a fixed number of lines.
    #[serde(default)]
    pub backtrace: Vec<String>,
}

/// Snapshot of a context taken at the moment a pipeline failed.
///
/// Stored under `internal_only["last_failed_context"]` so callers can inspect
/// the state that produced the failure without holding the live context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Short label identifying what failed (defaults to the current action).
    pub label: String,
    /// Input table at failure time.
    pub input: serde_json::Map<String, Value>,
    /// Params table at failure time.
    pub params: serde_json::Map<String, Value>,
    /// Meta table at failure time.
    pub meta: serde_json::Map<String, Value>,
    /// Resources table at failure time.
    pub resources: serde_json::Map<String, Value>,
    /// Accumulated field errors at failure time.
    pub errors: FieldErrors,
    /// Completion status at failure time.
    pub status: ContextStatus,
    /// When the snapshot was captured.
    pub captured_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_defaults_to_update() {
        assert_eq!(Operation::default(), Operation::Update);
    }

    #[test]
    fn operation_round_trips_through_str() {
        for op in [Operation::Create, Operation::Update] {
            assert_eq!(op.as_str().parse::<Operation>().expect("parse"), op);
        }
        assert!("delete".parse::<Operation>().is_err());
    }

    #[test]
    fn status_reports_completion() {
        assert!(!ContextStatus::Incomplete.is_complete());
        assert!(ContextStatus::Complete.is_complete());
    }

    #[test]
    fn error_info_serializes_with_optional_fields() {
        let info = ErrorInfo {
            kind: "error".into(),
            message: "boom".into(),
            causes: vec![],
            backtrace: vec![],
        };
        let value = serde_json::to_value(&info).expect("serialize");
        let back: ErrorInfo = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, info);
    }
}
