//! Ordered step execution against a single context.
//!
//! An organizer declares its pipeline as a list of [`Step`]s and runs them in
//! order, short-circuiting as soon as a step leaves the context failed. Steps
//! are a tagged union built at declaration time, so there is no runtime
//! step-shape classification and no invalid shape to reject.

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    action::Action,
    capture,
    context::{ALL_ACTIONS_COMPLETE_KEY, Context, JsonMap, Overrides, short_label},
};

/// Context-mutating function usable as an inline step.
pub type InlineStepFn = Arc<dyn Fn(&mut Context) -> Result<()>>;

/// Run-scoped hook applied to a context.
pub type ContextHook = Box<dyn Fn(&mut Context)>;

/// Observer invoked with each pre-phase sub-context and the root context.
pub type OrganizerObserver = Box<dyn Fn(&Context, &mut Context)>;

/// One entry of an organizer's pipeline.
#[derive(Clone)]
pub enum Step {
    /// A unit of work with lifecycle hooks.
    Action(Arc<dyn Action>),
    /// A direct context-mutating function with a diagnostic label.
    Inline {
        /// Label recorded in diagnostics and the audit trail.
        label: String,
        /// The function invoked with the context.
        run: InlineStepFn,
    },
}

impl Step {
    /// Wraps an action as a step.
    pub fn action(action: impl Action + 'static) -> Self {
        Self::Action(Arc::new(action))
    }

    /// Wraps a labeled context-mutating function as a step.
    pub fn inline(label: impl Into<String>, run: impl Fn(&mut Context) -> Result<()> + 'static) -> Self {
        Self::Inline {
            label: label.into(),
            run: Arc::new(run),
        }
    }

    /// Short diagnostic label for this step.
    pub fn label(&self) -> String {
        match self {
            Self::Action(action) => short_label(action.name()).to_string(),
            Self::Inline { label, .. } => label.clone(),
        }
    }
}

/// Optional run-scoped configuration for a pipeline invocation.
///
/// Hooks live here instead of on global per-type slots, so independent runs
/// cannot interfere with each other.
#[derive(Default)]
pub struct RunConfig {
    /// Invoked against the context before any step runs.
    pub before_steps: Option<ContextHook>,
    /// Invoked after each orchestrator pre-phase step with `(sub, root)`.
    pub each_organizer: Option<OrganizerObserver>,
    /// Late-bound mutator applied to the root context after the pre-phase.
    pub context_mutator: Option<ContextHook>,
}

/// Appends the terminal marker that records full pipeline completion.
///
/// The marker is an ordinary step, so it only runs when every prior step
/// succeeded.
pub(crate) fn with_terminal_marker(mut steps: Vec<Step>) -> Vec<Step> {
    steps.push(Step::inline(ALL_ACTIONS_COMPLETE_KEY, |context| {
        let mut marker = JsonMap::new();
        marker.insert(ALL_ACTIONS_COMPLETE_KEY.to_string(), Value::Bool(true));
        context.with_meta(marker);
        Ok(())
    }));
    steps
}

/// An ordered executor of steps against one context.
pub trait Organizer {
    /// Qualified name used for diagnostic labels.
    fn name(&self) -> &str;

    /// The pipeline definition; empty by default.
    fn steps(&self) -> Vec<Step> {
        Vec::new()
    }

    /// Builds a context and runs the pipeline with default configuration.
    fn call(&self, input: JsonMap, overrides: Overrides) -> Context {
        self.call_with(input, overrides, RunConfig::default())
    }

    /// Builds a context and runs the pipeline.
    ///
    /// Execution of the steps (plus the terminal marker) is wrapped in a
    /// non-rethrowing error capture; the context is marked complete only when
    /// it ends successfully.
    fn call_with(&self, input: JsonMap, overrides: Overrides, config: RunConfig) -> Context {
        let mut context = Context::build(input, overrides);
        context.set_current_organizer(self.name());
        debug!(organizer = %context.current_organizer_name(), "organizer run started");

        if let Some(hook) = &config.before_steps {
            hook(&mut context);
        }

        let steps = with_terminal_marker(self.steps());
        let _ = capture::capture(&mut context, false, |context| self.reduce(context, &steps));

        if context.success() {
            context.mark_complete();
        }
        debug!(
            organizer = %context.current_organizer_name(),
            success = context.success(),
            "organizer run finished"
        );
        context
    }

    /// Runs steps in order against the context, stopping at the first step
    /// that leaves it failed.
    ///
    /// After a failing step the context snapshot is recorded and the
    /// remaining steps never run; after a successful step its label joins the
    /// deduplicated audit trail.
    fn reduce(&self, context: &mut Context, steps: &[Step]) -> Result<()> {
        for step in steps {
            let label = step.label();
            debug!(step = %label, "step started");
            match step {
                Step::Action(action) => action.execute(context)?,
                Step::Inline { label, run } => {
                    context.set_current_step_label(label);
                    run(context)?;
                }
            }

            if context.failure() {
                warn!(step = %label, "step left context failed; short-circuiting");
                context.set_last_failed_context(None);
                return Ok(());
            }
            context.record_successful_action(&label);
        }
        Ok(())
    }

    /// Runs [`Organizer::reduce`] only when the context is currently
    /// successful; otherwise a no-op.
    fn reduce_if_success(&self, context: &mut Context, steps: &[Step]) -> Result<()> {
        if context.failure() {
            return Ok(());
        }
        self.reduce(context, steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SUCCESSFUL_ACTIONS_KEY;
    use serde_json::json;

    struct TwoStepPipeline;

    impl Organizer for TwoStepPipeline {
        fn name(&self) -> &str {
            "conveyor_engine::organizer::tests::TwoStepPipeline"
        }

        fn steps(&self) -> Vec<Step> {
            vec![
                Step::inline("sets_error", |context| {
                    context.add_error("name", "is blank");
                    Ok(())
                }),
                Step::inline("sets_meta", |context| {
                    let mut meta = JsonMap::new();
                    meta.insert("reached".to_string(), json!(true));
                    context.with_meta(meta);
                    Ok(())
                }),
            ]
        }
    }

    struct HappyPipeline;

    impl Organizer for HappyPipeline {
        fn name(&self) -> &str {
            "conveyor_engine::organizer::tests::HappyPipeline"
        }

        fn steps(&self) -> Vec<Step> {
            vec![
                Step::inline("first", |context| {
                    context.with_resource("order", json!({"id": 7}));
                    Ok(())
                }),
                Step::inline("second", |_context| Ok(())),
            ]
        }
    }

    #[test]
    fn failing_step_short_circuits_the_rest() {
        let context = TwoStepPipeline.call(JsonMap::new(), Overrides::default());

        assert!(!context.success());
        assert_eq!(context.errors().get("name"), Some(&vec!["is blank".to_string()]));
        assert!(!context.meta().contains_key("reached"));
        assert!(!context.meta().contains_key(ALL_ACTIONS_COMPLETE_KEY));
        assert!(!context.complete());
        let snapshot = context.last_failed_context().expect("failure snapshot recorded");
        assert_eq!(snapshot.label, "sets_error");
    }

    #[test]
    fn successful_run_completes_and_records_the_audit_trail() {
        let context = HappyPipeline.call(JsonMap::new(), Overrides::default());

        assert!(context.success());
        assert!(context.complete());
        assert_eq!(context.meta().get(ALL_ACTIONS_COMPLETE_KEY), Some(&json!(true)));
        assert_eq!(
            context.internal_only().get(SUCCESSFUL_ACTIONS_KEY),
            Some(&json!(["first", "second", ALL_ACTIONS_COMPLETE_KEY]))
        );
    }

    #[test]
    fn raising_step_is_captured_not_propagated() {
        struct RaisingPipeline;
        impl Organizer for RaisingPipeline {
            fn name(&self) -> &str {
                "conveyor_engine::organizer::tests::RaisingPipeline"
            }
            fn steps(&self) -> Vec<Step> {
                vec![Step::inline("explodes", |_context| anyhow::bail!("boom"))]
            }
        }

        let context = RaisingPipeline.call(JsonMap::new(), Overrides::default());
        assert!(context.failure());
        assert!(context.errors().contains_key(capture::BASE_ERROR_KEY));
        assert_eq!(context.error_info().expect("error info").message, "boom");
    }

    #[test]
    fn before_steps_hook_runs_first() {
        let config = RunConfig {
            before_steps: Some(Box::new(|context: &mut Context| {
                let mut params = JsonMap::new();
                params.insert("primed".to_string(), json!(true));
                context.with_params(params);
            })),
            ..RunConfig::default()
        };
        let context = HappyPipeline.call_with(JsonMap::new(), Overrides::default(), config);
        assert_eq!(context.params().get("primed"), Some(&json!(true)));
        assert!(context.complete());
    }

    #[test]
    fn reduce_if_success_skips_failed_contexts() {
        let pipeline = HappyPipeline;
        let mut context = Context::default();
        context.abort();
        pipeline
            .reduce_if_success(&mut context, &pipeline.steps())
            .expect("reduce_if_success");
        assert!(!context.resources().contains_key("order"));
    }

    #[test]
    fn empty_organizer_completes_immediately() {
        struct EmptyPipeline;
        impl Organizer for EmptyPipeline {
            fn name(&self) -> &str {
                "conveyor_engine::organizer::tests::EmptyPipeline"
            }
        }

        let context = EmptyPipeline.call(JsonMap::new(), Overrides::default());
        assert!(context.complete());
        assert_eq!(context.meta().get(ALL_ACTIONS_COMPLETE_KEY), Some(&json!(true)));
    }
}
