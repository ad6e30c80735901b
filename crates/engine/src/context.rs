//! Pipeline context: the shared mutable state threaded through a run.
//!
//! One context exists per pipeline invocation. Actions and step runners read
//! and mutate it in place; nothing else flows between steps. Mutators are
//! shallow merges (later writes win on colliding top-level keys), error
//! accumulation dedups per field while preserving first-seen order, and the
//! `status`/`aborted` flags are monotonic: once complete or aborted, a
//! context never reverts.

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use conveyor_types::{ContextSnapshot, ContextStatus, ErrorInfo, FieldErrors, Operation};
use conveyor_util::backtrace::{BacktraceCleaner, TraceOutput};
use conveyor_util::projection;

use crate::validation::ValidationFailed;

/// String-keyed JSON table used for every context section.
pub type JsonMap = Map<String, Value>;

/// Meta key holding the run's business operation.
pub const OPERATION_KEY: &str = "operation";
/// Meta key set by the terminal marker step once every step has run.
pub const ALL_ACTIONS_COMPLETE_KEY: &str = "all_actions_complete";
/// Internal key holding the structured capture of the last raised error.
pub const ERROR_INFO_KEY: &str = "error_info";
/// Internal key holding the snapshot of the last failed context.
pub const LAST_FAILED_CONTEXT_KEY: &str = "last_failed_context";
/// Internal key holding the deduplicated audit trail of successful steps.
pub const SUCCESSFUL_ACTIONS_KEY: &str = "successful_actions";

/// Stored error-info traces are capped to this many cleaned lines.
const ERROR_INFO_TRACE_LINES: usize = 5;

/// Recognized override sections applied when building a context.
///
/// [`Overrides::from_map`] accepts a loose mapping and merges only the
/// recognized keys, silently ignoring everything else.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Merged into `params`.
    pub params: JsonMap,
    /// Seeded into `errors` (aborting the context when non-empty).
    pub errors: FieldErrors,
    /// Merged into `resources`.
    pub resources: JsonMap,
    /// Merged into `extra_rules`.
    pub extra_rules: JsonMap,
    /// Merged into `internal_only`.
    pub internal_only: JsonMap,
    /// Merged into `meta`.
    pub meta: JsonMap,
}

impl Overrides {
    /// Extracts the recognized override sections from a loose mapping.
    pub fn from_map(map: &JsonMap) -> Self {
        let section = |key: &str| -> JsonMap {
            match map.get(key) {
                Some(Value::Object(values)) => values.clone(),
                _ => JsonMap::new(),
            }
        };
        Self {
            params: section("params"),
            errors: map.get("errors").map(field_errors_from_value).unwrap_or_default(),
            resources: section("resources"),
            extra_rules: section("extra_rules"),
            internal_only: section("internal_only"),
            meta: section("meta"),
        }
    }
}

fn field_errors_from_value(value: &Value) -> FieldErrors {
    let mut errors = FieldErrors::new();
    let Value::Object(map) = value else {
        return errors;
    };
    for (field, messages) in map {
        match messages {
            Value::String(message) => errors.entry(field.clone()).or_default().push(message.clone()),
            Value::Array(items) => {
                for item in items {
                    if let Value::String(message) = item {
                        errors.entry(field.clone()).or_default().push(message.clone());
                    }
                }
            }
            _ => {}
        }
    }
    errors.retain(|_, messages| !messages.is_empty());
    errors
}

/// Returns the last `::` segment of a qualified name.
pub fn short_label(qualified: &str) -> &str {
    qualified.rsplit("::").next().unwrap_or(qualified)
}

/// The shared mutable state value for one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct Context {
    input: JsonMap,
    params: JsonMap,
    resources: JsonMap,
    meta: JsonMap,
    extra_rules: JsonMap,
    internal_only: JsonMap,
    errors: FieldErrors,
    status: ContextStatus,
    aborted: bool,
    current_organizer_name: String,
    current_action_name: String,
    invoked_action: Option<String>,
}

impl Context {
    /// Builds a context from an input table and recognized overrides.
    ///
    /// The operation defaults to [`Operation::Update`] unless the override
    /// meta already carries one.
    pub fn build(input: JsonMap, overrides: Overrides) -> Self {
        let mut context = Self::default();
        context.with_inputs(input);
        context.with_params(overrides.params);
        context.with_resources(overrides.resources);
        context.with_extra_rules(overrides.extra_rules);
        context.with_internal_only(overrides.internal_only);
        context.with_meta(overrides.meta);
        context.with_errors(overrides.errors);
        if !context.meta.contains_key(OPERATION_KEY) {
            context.set_operation(Operation::default());
        }
        context
    }

    /// Builds a context from a bare seed mapping with no overrides.
    pub fn from_seed(seed: JsonMap) -> Self {
        Self::build(seed, Overrides::default())
    }

    /// The input table.
    pub fn input(&self) -> &JsonMap {
        &self.input
    }

    /// The params table.
    pub fn params(&self) -> &JsonMap {
        &self.params
    }

    /// The resources table.
    pub fn resources(&self) -> &JsonMap {
        &self.resources
    }

    /// The meta table.
    pub fn meta(&self) -> &JsonMap {
        &self.meta
    }

    /// Extra validation rules supplied by the caller.
    pub fn extra_rules(&self) -> &JsonMap {
        &self.extra_rules
    }

    /// Internal diagnostics table (audit trail, error info, snapshots).
    pub fn internal_only(&self) -> &JsonMap {
        &self.internal_only
    }

    /// Accumulated field errors.
    pub fn errors(&self) -> &FieldErrors {
        &self.errors
    }

    /// Selective view of the input table by dotted keys; misses become null.
    pub fn input_filtered<S: AsRef<str>>(&self, keys: &[S]) -> IndexMap<String, Value> {
        projection::select_or_null(&self.input, keys)
    }

    /// Selective view of the params table.
    pub fn params_filtered<S: AsRef<str>>(&self, keys: &[S]) -> IndexMap<String, Value> {
        projection::select_or_null(&self.params, keys)
    }

    /// Selective view of the resources table.
    pub fn resources_filtered<S: AsRef<str>>(&self, keys: &[S]) -> IndexMap<String, Value> {
        projection::select_or_null(&self.resources, keys)
    }

    /// Selective view of the meta table.
    pub fn meta_filtered<S: AsRef<str>>(&self, keys: &[S]) -> IndexMap<String, Value> {
        projection::select_or_null(&self.meta, keys)
    }

    /// Selective view of the internal diagnostics table.
    pub fn internal_only_filtered<S: AsRef<str>>(&self, keys: &[S]) -> IndexMap<String, Value> {
        projection::select_or_null(&self.internal_only, keys)
    }

    /// Selective view of the error table; each hit is the message list.
    pub fn errors_filtered<S: AsRef<str>>(&self, keys: &[S]) -> IndexMap<String, Value> {
        let mut as_map = JsonMap::new();
        for (field, messages) in &self.errors {
            let items = messages.iter().map(|message| Value::String(message.clone())).collect();
            as_map.insert(field.clone(), Value::Array(items));
        }
        projection::select_or_null(&as_map, keys)
    }

    /// Shallow-merges values into the input table; empty input is a no-op.
    pub fn with_inputs(&mut self, values: JsonMap) -> &mut Self {
        merge_into(&mut self.input, values);
        self
    }

    /// Shallow-merges values into the params table; empty input is a no-op.
    pub fn with_params(&mut self, values: JsonMap) -> &mut Self {
        merge_into(&mut self.params, values);
        self
    }

    /// Shallow-merges values into the resources table; empty input is a no-op.
    pub fn with_resources(&mut self, values: JsonMap) -> &mut Self {
        merge_into(&mut self.resources, values);
        self
    }

    /// Shallow-merges values into the meta table; empty input is a no-op.
    pub fn with_meta(&mut self, values: JsonMap) -> &mut Self {
        merge_into(&mut self.meta, values);
        self
    }

    /// Shallow-merges values into the extra-rules table; empty input is a no-op.
    pub fn with_extra_rules(&mut self, values: JsonMap) -> &mut Self {
        merge_into(&mut self.extra_rules, values);
        self
    }

    /// Shallow-merges values into the internal diagnostics table.
    pub fn with_internal_only(&mut self, values: JsonMap) -> &mut Self {
        merge_into(&mut self.internal_only, values);
        self
    }

    /// Appends field errors, deduplicating per field in first-seen order.
    ///
    /// A non-empty merge always aborts the context; an empty one (including
    /// fields with no messages) touches nothing.
    pub fn with_errors(&mut self, errors: FieldErrors) -> &mut Self {
        let mut merged_any = false;
        for (field, messages) in errors {
            if messages.is_empty() {
                continue;
            }
            let existing = self.errors.entry(field).or_default();
            for message in messages {
                merged_any = true;
                if !existing.contains(&message) {
                    existing.push(message);
                }
            }
        }
        if merged_any && !self.errors.is_empty() {
            self.aborted = true;
        }
        self
    }

    /// Appends a single message to one field's error list.
    pub fn add_error(&mut self, field: &str, message: &str) -> &mut Self {
        let mut errors = FieldErrors::new();
        errors.insert(field.to_string(), vec![message.to_string()]);
        self.with_errors(errors)
    }

    /// Writes a single value at a dotted path inside `resources`, creating
    /// intermediate structure and leaving sibling keys untouched.
    pub fn with_resource(&mut self, key: &str, value: Value) -> &mut Self {
        projection::insert_at_path(&mut self.resources, key, value);
        self
    }

    /// Marks the context terminal. There is no inverse.
    pub fn mark_complete(&mut self) {
        debug!(organizer = %self.current_organizer_name, "context marked complete");
        self.status = ContextStatus::Complete;
    }

    /// True once the context reached its terminal state.
    pub fn complete(&self) -> bool {
        self.status.is_complete()
    }

    /// The completion status.
    pub fn status(&self) -> ContextStatus {
        self.status
    }

    /// Aborts the run without recording an error (manual short-circuit).
    pub fn abort(&mut self) {
        debug!(action = %self.current_action_name, "context aborted");
        self.aborted = true;
    }

    /// True when the context was aborted.
    pub fn aborted(&self) -> bool {
        self.aborted
    }

    /// True while no error was recorded and the context was not aborted.
    pub fn success(&self) -> bool {
        !self.aborted && self.errors.is_empty()
    }

    /// The negation of [`Context::success`].
    pub fn failure(&self) -> bool {
        !self.success()
    }

    /// The business operation for this run, defaulting to update.
    pub fn operation(&self) -> Operation {
        self.meta
            .get(OPERATION_KEY)
            .and_then(Value::as_str)
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }

    /// Stores the business operation in `meta`.
    pub fn set_operation(&mut self, operation: Operation) {
        self.meta
            .insert(OPERATION_KEY.to_string(), Value::String(operation.as_str().to_string()));
    }

    /// Short label of the step runner currently driving this context.
    pub fn current_organizer_name(&self) -> &str {
        &self.current_organizer_name
    }

    /// Short label of the action currently (or last) touching this context.
    pub fn current_action_name(&self) -> &str {
        &self.current_action_name
    }

    /// Qualified name of the last action that touched this context.
    pub fn invoked_action(&self) -> Option<&str> {
        self.invoked_action.as_deref()
    }

    /// Records the driving step runner's diagnostic label.
    pub fn set_current_organizer(&mut self, qualified: &str) {
        self.current_organizer_name = short_label(qualified).to_string();
    }

    /// Records the current action's diagnostic label and back-reference.
    pub fn set_current_action(&mut self, qualified: &str) {
        self.current_action_name = short_label(qualified).to_string();
        self.invoked_action = Some(qualified.to_string());
    }

    /// Records a diagnostic label for a step that is not an action (inline
    /// functions); the action back-reference is left untouched.
    pub fn set_current_step_label(&mut self, label: &str) {
        self.current_action_name = short_label(label).to_string();
    }

    /// Appends a step label to the deduplicated audit trail of successful
    /// steps kept under `internal_only`.
    pub fn record_successful_action(&mut self, label: &str) {
        let trail = self
            .internal_only
            .entry(SUCCESSFUL_ACTIONS_KEY.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = trail
            && !items.iter().any(|item| item == label)
        {
            items.push(Value::String(label.to_string()));
        }
    }

    /// Builds the structured record of a raised error and stores it under
    /// `internal_only["error_info"]`; field-level errors carried by a
    /// [`ValidationFailed`] are merged into the context.
    pub fn record_raised_error(&mut self, error: &anyhow::Error) {
        let kind = if error.downcast_ref::<ValidationFailed>().is_some() {
            "validation_failed"
        } else {
            "error"
        };
        let cleaner = BacktraceCleaner::with_defaults();
        let mut trace = cleaner.clean_str(&error.backtrace().to_string(), TraceOutput::Cleaned);
        trace.truncate(ERROR_INFO_TRACE_LINES);
        let info = ErrorInfo {
            kind: kind.to_string(),
            message: error.to_string(),
            causes: error.chain().skip(1).map(|cause| cause.to_string()).collect(),
            backtrace: trace,
        };
        warn!(kind = %info.kind, message = %info.message, "raised error recorded");
        self.internal_only.insert(
            ERROR_INFO_KEY.to_string(),
            serde_json::to_value(&info).unwrap_or(Value::Null),
        );
        if let Some(validation) = error.downcast_ref::<ValidationFailed>() {
            self.with_errors(validation.errors.clone());
        }
    }

    /// The structured record of the last raised error, if any.
    pub fn error_info(&self) -> Option<ErrorInfo> {
        let value = self.internal_only.get(ERROR_INFO_KEY)?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Captures a point-in-time snapshot of this context's state.
    ///
    /// The label defaults to the current action's short name.
    pub fn snapshot(&self, label: Option<&str>) -> ContextSnapshot {
        ContextSnapshot {
            label: label.unwrap_or(&self.current_action_name).to_string(),
            input: self.input.clone(),
            params: self.params.clone(),
            meta: self.meta.clone(),
            resources: self.resources.clone(),
            errors: self.errors.clone(),
            status: self.status,
            captured_at: Utc::now(),
        }
    }

    /// Snapshots this context under `internal_only["last_failed_context"]`.
    pub fn set_last_failed_context(&mut self, label: Option<&str>) {
        let snapshot = self.snapshot(label);
        self.store_failed_snapshot(snapshot);
    }

    /// Snapshots another context into this one's diagnostics table.
    pub fn set_last_failed_context_from(&mut self, source: &Context, label: Option<&str>) {
        self.store_failed_snapshot(source.snapshot(label));
    }

    fn store_failed_snapshot(&mut self, snapshot: ContextSnapshot) {
        self.internal_only.insert(
            LAST_FAILED_CONTEXT_KEY.to_string(),
            serde_json::to_value(&snapshot).unwrap_or(Value::Null),
        );
    }

    /// The snapshot of the last failed context, if one was recorded.
    pub fn last_failed_context(&self) -> Option<ContextSnapshot> {
        let value = self.internal_only.get(LAST_FAILED_CONTEXT_KEY)?;
        serde_json::from_value(value.clone()).ok()
    }
}

fn merge_into(target: &mut JsonMap, values: JsonMap) {
    if values.is_empty() {
        return;
    }
    for (key, value) in values {
        target.insert(key, value);
    }
}
