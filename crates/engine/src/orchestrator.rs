//! Two-phase pipeline runner.
//!
//! An orchestrator layers a pre-phase of organizer steps on top of the main
//! step pipeline. Each pre-phase step produces its own owned sub-context
//! (from a delegated function, a nested organizer run, or an action executed
//! against a fresh seed); its results are merged into the root context by
//! value, never aliased.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::{
    action::Action,
    capture,
    context::{Context, JsonMap, Overrides, short_label},
    organizer::{Organizer, RunConfig, with_terminal_marker},
};

/// Function producing a sub-context from the orchestrator's input.
pub type DelegateFn = Arc<dyn Fn(&JsonMap) -> Result<Context>>;

/// One entry of an orchestrator's pre-phase pipeline.
#[derive(Clone)]
pub enum OrganizerStep {
    /// A context-producing function invoked with the orchestrator's input.
    Delegate {
        /// Label recorded in diagnostics.
        label: String,
        /// The producing function.
        run: DelegateFn,
    },
    /// A nested organizer delegated to with the orchestrator's input.
    Runner(Arc<dyn Organizer>),
    /// A unit of work run against a fresh sub-context seeded from the input.
    Action(Arc<dyn Action>),
}

impl OrganizerStep {
    /// Wraps a labeled context-producing function.
    pub fn delegate(label: impl Into<String>, run: impl Fn(&JsonMap) -> Result<Context> + 'static) -> Self {
        Self::Delegate {
            label: label.into(),
            run: Arc::new(run),
        }
    }

    /// Wraps a nested organizer.
    pub fn runner(runner: impl Organizer + 'static) -> Self {
        Self::Runner(Arc::new(runner))
    }

    /// Wraps an action to run against a fresh seeded sub-context.
    pub fn action(action: impl Action + 'static) -> Self {
        Self::Action(Arc::new(action))
    }

    /// Short diagnostic label for this pre-phase step.
    pub fn label(&self) -> String {
        match self {
            Self::Delegate { label, .. } => label.clone(),
            Self::Runner(runner) => short_label(runner.name()).to_string(),
            Self::Action(action) => short_label(action.name()).to_string(),
        }
    }
}

/// A two-phase step runner: a pre-phase of organizer steps, then the main
/// pipeline inherited from [`Organizer`].
pub trait Orchestrator: Organizer {
    /// The pre-phase pipeline definition; empty by default.
    fn organizer_steps(&self) -> Vec<OrganizerStep> {
        Vec::new()
    }

    /// Runs both phases with default configuration.
    fn orchestrate(&self, input: JsonMap, overrides: Overrides) -> Context {
        self.orchestrate_with(input, overrides, RunConfig::default())
    }

    /// Runs the pre-phase, applies the run-scoped context mutator, then runs
    /// the main pipeline; the whole sequence sits inside a non-rethrowing
    /// error capture and the root context completes only on final success.
    fn orchestrate_with(&self, input: JsonMap, overrides: Overrides, config: RunConfig) -> Context {
        let mut root = Context::build(input.clone(), overrides);
        root.set_current_organizer(self.name());
        debug!(orchestrator = %root.current_organizer_name(), "orchestration started");

        if let Some(hook) = &config.before_steps {
            hook(&mut root);
        }

        let pre_steps = self.organizer_steps();
        let main_steps = with_terminal_marker(self.steps());

        let _ = capture::capture(&mut root, false, |root| {
            for step in &pre_steps {
                let label = step.label();
                debug!(organizer_step = %label, "pre-phase step started");
                let sub = match step {
                    OrganizerStep::Delegate { run, .. } => run(&input)?,
                    OrganizerStep::Runner(runner) => runner.call(input.clone(), Overrides::default()),
                    OrganizerStep::Action(action) => action.execute_seed(input.clone())?,
                };
                merge_sub_context(root, &sub, &label);
                if let Some(observer) = &config.each_organizer {
                    observer(&sub, root);
                }
            }

            if let Some(mutator) = &config.context_mutator {
                mutator(root);
            }

            self.reduce(root, &main_steps)
        });

        if root.success() {
            root.mark_complete();
        }
        debug!(
            orchestrator = %root.current_organizer_name(),
            success = root.success(),
            "orchestration finished"
        );
        root
    }
}

/// Copies a sub-context's results into the root by value.
///
/// Params and resources shallow-merge; errors merge through the usual
/// dedup-and-abort path, and a failed sub-context is snapshotted into the
/// root's diagnostics. The sub-context itself is never retained.
fn merge_sub_context(root: &mut Context, sub: &Context, label: &str) {
    root.with_params(sub.params().clone());
    root.with_resources(sub.resources().clone());
    if sub.failure() {
        root.set_last_failed_context_from(sub, Some(label));
    }
    root.with_errors(sub.errors().clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::organizer::Step;
    use serde_json::{Value, json};

    struct LookupRates;

    impl Organizer for LookupRates {
        fn name(&self) -> &str {
            "conveyor_engine::orchestrator::tests::LookupRates"
        }

        fn steps(&self) -> Vec<Step> {
            vec![Step::inline("fetch_rates", |context| {
                context.with_resource("rates.usd", json!("1.0"));
                Ok(())
            })]
        }
    }

    struct CheckoutFlow;

    impl Organizer for CheckoutFlow {
        fn name(&self) -> &str {
            "conveyor_engine::orchestrator::tests::CheckoutFlow"
        }

        fn steps(&self) -> Vec<Step> {
            vec![Step::inline("place_order", |context| {
                let currency = context
                    .resources()
                    .get("rates")
                    .and_then(|rates| rates.get("usd"))
                    .cloned()
                    .unwrap_or(Value::Null);
                context.with_resource("order.currency_rate", currency);
                Ok(())
            })]
        }
    }

    impl Orchestrator for CheckoutFlow {
        fn organizer_steps(&self) -> Vec<OrganizerStep> {
            vec![
                OrganizerStep::delegate("seed_customer", |input| {
                    let mut sub = Context::from_seed(input.clone());
                    sub.with_resource("customer.id", json!(99));
                    Ok(sub)
                }),
                OrganizerStep::runner(LookupRates),
            ]
        }
    }

    #[test]
    fn pre_phase_results_are_merged_into_the_root() {
        let Value::Object(input) = json!({"cart": [1, 2]}) else {
            panic!("fixture is an object")
        };
        let context = CheckoutFlow.orchestrate(input, Overrides::default());

        assert!(context.success());
        assert!(context.complete());
        assert_eq!(
            context.resources().get("customer"),
            Some(&json!({"id": 99})),
            "delegate sub-context resources should be copied into the root"
        );
        assert_eq!(
            context.resources().get("order"),
            Some(&json!({"currency_rate": "1.0"})),
            "main phase should see pre-phase resources"
        );
    }

    #[test]
    fn observer_sees_each_sub_context_and_the_root() {
        use std::{cell::RefCell, rc::Rc};

        let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let config = RunConfig {
            each_organizer: Some(Box::new(move |sub: &Context, _root: &mut Context| {
                sink.borrow_mut().push(sub.current_organizer_name().to_string());
            })),
            ..RunConfig::default()
        };

        let context = CheckoutFlow.orchestrate_with(JsonMap::new(), Overrides::default(), config);
        assert!(context.success());
        assert_eq!(*seen.borrow(), vec!["".to_string(), "LookupRates".to_string()]);
    }

    #[test]
    fn context_mutator_runs_between_the_phases() {
        let config = RunConfig {
            context_mutator: Some(Box::new(|root: &mut Context| {
                let mut params = JsonMap::new();
                params.insert("mutated".to_string(), json!(true));
                root.with_params(params);
            })),
            ..RunConfig::default()
        };

        let context = CheckoutFlow.orchestrate_with(JsonMap::new(), Overrides::default(), config);
        assert_eq!(context.params().get("mutated"), Some(&json!(true)));
    }

    #[test]
    fn failed_delegate_aborts_the_root_with_its_errors() {
        struct FailingFlow;
        impl Organizer for FailingFlow {
            fn name(&self) -> &str {
                "conveyor_engine::orchestrator::tests::FailingFlow"
            }
        }
        impl Orchestrator for FailingFlow {
            fn organizer_steps(&self) -> Vec<OrganizerStep> {
                vec![OrganizerStep::delegate("reject", |input| {
                    let mut sub = Context::from_seed(input.clone());
                    sub.add_error("account", "is locked");
                    Ok(sub)
                })]
            }
        }

        let context = FailingFlow.orchestrate(JsonMap::new(), Overrides::default());
        assert!(context.failure());
        assert_eq!(context.errors().get("account"), Some(&vec!["is locked".to_string()]));
        let snapshot = context.last_failed_context().expect("sub-context snapshot recorded");
        assert_eq!(snapshot.label, "reject");
    }

    #[test]
    fn raising_delegate_is_captured_on_the_root() {
        struct RaisingFlow;
        impl Organizer for RaisingFlow {
            fn name(&self) -> &str {
                "conveyor_engine::orchestrator::tests::RaisingFlow"
            }
        }
        impl Orchestrator for RaisingFlow {
            fn organizer_steps(&self) -> Vec<OrganizerStep> {
                vec![OrganizerStep::delegate("explode", |_input| anyhow::bail!("pre-phase boom"))]
            }
        }

        let context = RaisingFlow.orchestrate(JsonMap::new(), Overrides::default());
        assert!(context.failure());
        assert_eq!(context.error_info().expect("error info").message, "pre-phase boom");
        assert!(context.errors().contains_key(capture::BASE_ERROR_KEY));
    }

    #[test]
    fn sub_contexts_are_copied_not_aliased() {
        let Value::Object(input) = json!({}) else { panic!("fixture") };
        let mut sub = Context::from_seed(input);
        sub.with_resource("shared.value", json!(1));

        let mut root = Context::default();
        merge_sub_context(&mut root, &sub, "sub");
        sub.with_resource("shared.value", json!(2));

        assert_eq!(root.resources().get("shared"), Some(&json!({"value": 1})));
    }
}
