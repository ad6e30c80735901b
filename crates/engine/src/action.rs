//! Single unit of work with lifecycle hooks.
//!
//! `perform` does the work; the surrounding hooks observe. Hooks are default
//! trait methods, so per-action-type registration is a compile-time impl and
//! cannot leak between runs.

use anyhow::Result;
use tracing::{debug, warn};

use crate::context::{Context, JsonMap};

/// A unit of work executed against one pipeline context.
///
/// The provided [`Action::execute`] drives the lifecycle: `before_execute`,
/// `perform`, `after_execute` (unconditionally), then `after_success` or
/// `after_failure` depending on the outcome. An error raised by `perform`
/// still reaches the caller unchanged; hooks observe, they never suppress.
pub trait Action {
    /// Qualified name used for diagnostic labels.
    fn name(&self) -> &str;

    /// The concrete unit of work. May record field errors, mutate params or
    /// resources, or raise.
    fn perform(&self, context: &mut Context) -> Result<()>;

    /// Runs before `perform`.
    fn before_execute(&self, _context: &mut Context) {}

    /// Runs after `perform`, even when `perform` raised.
    fn after_execute(&self, _context: &mut Context) {}

    /// Runs when `perform` returned and the context is still successful.
    fn after_success(&self, _context: &mut Context) {}

    /// Runs when `perform` raised or left the context failed.
    fn after_failure(&self, _context: &mut Context) {}

    /// Drives the full lifecycle against an existing context.
    ///
    /// A context that already reached its terminal state is returned
    /// untouched: no hooks run, `perform` is skipped.
    fn execute(&self, context: &mut Context) -> Result<()> {
        if context.complete() {
            debug!(action = %self.name(), "context already complete; skipping");
            return Ok(());
        }

        context.set_current_action(self.name());
        debug!(action = %context.current_action_name(), "action execution started");

        self.before_execute(context);
        let performed = self.perform(context);
        self.after_execute(context);

        match performed {
            Err(error) => {
                warn!(action = %context.current_action_name(), error = %error, "action raised");
                self.after_failure(context);
                Err(error)
            }
            Ok(()) => {
                if context.success() {
                    debug!(action = %context.current_action_name(), "action execution succeeded");
                    self.after_success(context);
                } else {
                    debug!(action = %context.current_action_name(), "action left context failed");
                    self.after_failure(context);
                }
                Ok(())
            }
        }
    }

    /// Builds a fresh context from a seed mapping and executes against it.
    fn execute_seed(&self, seed: JsonMap) -> Result<Context> {
        let mut context = Context::from_seed(seed);
        self.execute(&mut context)?;
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::cell::RefCell;

    struct RecordingAction {
        calls: RefCell<Vec<&'static str>>,
        fail_with_error: bool,
        raise: bool,
    }

    impl RecordingAction {
        fn new() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                fail_with_error: false,
                raise: false,
            }
        }
    }

    impl Action for RecordingAction {
        fn name(&self) -> &str {
            "conveyor_engine::action::tests::RecordingAction"
        }

        fn perform(&self, context: &mut Context) -> Result<()> {
            self.calls.borrow_mut().push("perform");
            if self.fail_with_error {
                context.add_error("base", "not allowed");
            }
            if self.raise {
                anyhow::bail!("exploded");
            }
            Ok(())
        }

        fn before_execute(&self, _context: &mut Context) {
            self.calls.borrow_mut().push("before");
        }

        fn after_execute(&self, _context: &mut Context) {
            self.calls.borrow_mut().push("after");
        }

        fn after_success(&self, _context: &mut Context) {
            self.calls.borrow_mut().push("success");
        }

        fn after_failure(&self, _context: &mut Context) {
            self.calls.borrow_mut().push("failure");
        }
    }

    #[test]
    fn successful_run_calls_hooks_in_order() {
        let action = RecordingAction::new();
        let mut context = Context::default();
        action.execute(&mut context).expect("execute");
        assert_eq!(*action.calls.borrow(), vec!["before", "perform", "after", "success"]);
    }

    #[test]
    fn context_failure_routes_to_after_failure() {
        let action = RecordingAction {
            fail_with_error: true,
            ..RecordingAction::new()
        };
        let mut context = Context::default();
        action.execute(&mut context).expect("no raise");
        assert_eq!(*action.calls.borrow(), vec!["before", "perform", "after", "failure"]);
        assert!(context.failure());
    }

    #[test]
    fn raised_error_reaches_the_caller_after_hooks() {
        let action = RecordingAction {
            raise: true,
            ..RecordingAction::new()
        };
        let mut context = Context::default();
        let error = action.execute(&mut context).expect_err("perform raised");
        assert_eq!(error.to_string(), "exploded");
        assert_eq!(*action.calls.borrow(), vec!["before", "perform", "after", "failure"]);
    }

    #[test]
    fn complete_context_short_circuits_with_zero_hooks() {
        let action = RecordingAction::new();
        let mut context = Context::default();
        context.mark_complete();
        action.execute(&mut context).expect("execute");
        assert!(action.calls.borrow().is_empty());
        assert_eq!(context.current_action_name(), "");
    }

    #[test]
    fn execute_seed_builds_a_context_from_the_mapping() {
        let action = RecordingAction::new();
        let Value::Object(seed) = json!({"order_id": 42}) else {
            panic!("fixture is an object")
        };
        let context = action.execute_seed(seed).expect("execute seed");
        assert_eq!(context.input().get("order_id"), Some(&json!(42)));
        assert_eq!(context.current_action_name(), "RecordingAction");
    }
}
