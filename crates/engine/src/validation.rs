//! Validation collaborator contracts and the validation action.
//!
//! The rule language and its evaluation engine live outside this crate; the
//! engine only fixes the contract: a rule engine consumes a payload, caller
//! extra rules, dotted omit paths, and the run operation, and answers with a
//! pass/fail outcome plus field errors. Mappers shape the context input into
//! the payload the rules see.

use anyhow::Result;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use conveyor_types::{FieldErrors, Operation};
use conveyor_util::projection;

use crate::{
    action::Action,
    context::{Context, JsonMap},
};

/// Raised when rule evaluation itself wants to abort a unit of work with
/// field-level errors attached; the capture path merges them into the
/// context.
#[derive(Debug, Clone, Error)]
#[error("validation failed for {} field(s)", errors.len())]
pub struct ValidationFailed {
    /// The field errors to surface.
    pub errors: FieldErrors,
}

/// Result of one rule-engine evaluation.
#[derive(Debug, Clone, Default)]
pub struct RuleOutcome {
    /// True when every rule passed.
    pub passed: bool,
    /// Field errors collected on failure; empty on a pass.
    pub errors: FieldErrors,
}

impl RuleOutcome {
    /// A passing outcome with no errors.
    pub fn pass() -> Self {
        Self {
            passed: true,
            errors: FieldErrors::new(),
        }
    }

    /// A failing outcome carrying the given field errors.
    pub fn fail(errors: FieldErrors) -> Self {
        Self { passed: false, errors }
    }
}

/// Evaluates validation rules against a payload.
pub trait RuleEngine {
    /// Evaluates the payload under the caller's extra rules and the omit
    /// paths already stripped from it; `operation` is advisory for engines
    /// whose rules differ between create and update.
    fn evaluate(&self, payload: &Value, extra_rules: &JsonMap, omit_paths: &[String], operation: Operation) -> Result<RuleOutcome>;
}

/// Shapes arbitrary context input into the payload rules evaluate.
///
/// The contract requires a mapping; the typed return makes anything else
/// unrepresentable for ordinary implementations.
pub trait Mapper {
    /// Produces the validation payload. An `Err` is a runtime data problem
    /// and flows through the usual capture path.
    fn map(&self, input: &JsonMap) -> Result<JsonMap>;
}

/// Adapts a closure producing a loose [`Value`] into a [`Mapper`].
///
/// # Panics
///
/// Panics when the closure returns a non-mapping value. That is a defect in
/// the pipeline definition, not a runtime data problem, so it is never
/// converted into context failure.
pub struct FnMapper<F> {
    func: F,
}

impl<F> FnMapper<F>
where
    F: Fn(&JsonMap) -> Result<Value>,
{
    /// Wraps the closure.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> Mapper for FnMapper<F>
where
    F: Fn(&JsonMap) -> Result<Value>,
{
    fn map(&self, input: &JsonMap) -> Result<JsonMap> {
        match (self.func)(input)? {
            Value::Object(map) => Ok(map),
            other => panic!("mapper must return a mapping, got {other}; fix the pipeline definition"),
        }
    }
}

/// An action that maps the context input to a payload, strips omitted
/// fragments, and records rule failures as field errors.
///
/// Omit paths always apply; the operation only decides whether the
/// identifier paths join them (they are excluded on create, validated on
/// update).
pub struct ValidationAction<M, R> {
    name: String,
    mapper: M,
    rules: R,
    omit_paths: Vec<String>,
    identifier_paths: Vec<String>,
}

impl<M, R> ValidationAction<M, R>
where
    M: Mapper,
    R: RuleEngine,
{
    /// Builds a validation action with no omit or identifier paths.
    pub fn new(name: impl Into<String>, mapper: M, rules: R) -> Self {
        Self {
            name: name.into(),
            mapper,
            rules,
            omit_paths: Vec::new(),
            identifier_paths: Vec::new(),
        }
    }

    /// Sets the dotted paths stripped from every payload.
    pub fn omit_paths(mut self, paths: Vec<String>) -> Self {
        self.omit_paths = paths;
        self
    }

    /// Sets the omit paths from a loose key specification (a single string,
    /// or a list of mixed scalars).
    pub fn omit_rules(mut self, rules: &Value) -> Self {
        self.omit_paths = projection::normalize_key_list(Some(rules)).unwrap_or_default();
        self
    }

    /// Sets the identifier paths excluded from validation on create.
    pub fn identifier_paths(mut self, paths: Vec<String>) -> Self {
        self.identifier_paths = paths;
        self
    }

    fn effective_omit_paths(&self, operation: Operation) -> Vec<String> {
        let mut paths = self.omit_paths.clone();
        if operation == Operation::Create {
            paths.extend(self.identifier_paths.iter().cloned());
        }
        paths
    }
}

impl<M, R> Action for ValidationAction<M, R>
where
    M: Mapper,
    R: RuleEngine,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn perform(&self, context: &mut Context) -> Result<()> {
        let payload = self.mapper.map(context.input())?;
        let operation = context.operation();
        let omit_paths = self.effective_omit_paths(operation);
        let filtered = projection::omit(&Value::Object(payload), &omit_paths);
        debug!(
            action = %context.current_action_name(),
            operation = %operation.as_str(),
            omitted = omit_paths.len(),
            "evaluating validation rules"
        );

        let outcome = self.rules.evaluate(&filtered, context.extra_rules(), &omit_paths, operation)?;
        if !outcome.passed {
            context.with_errors(outcome.errors);
        }
        Ok(())
    }
}
