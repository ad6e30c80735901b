//! Converts unexpected raised errors into structured context failure.
//!
//! Business errors travel through the context and never reach this module;
//! anything that arrives here escaped a unit of work. The capture records a
//! structured error-info entry, adds a fixed user-facing message under the
//! `base` field, snapshots the failed context, and aborts. By default the
//! error is swallowed after recording; `rethrow` hands it back to the caller
//! as well.

use anyhow::Result;
use tracing::warn;

use crate::context::Context;

/// Field key carrying the generic failure message.
pub const BASE_ERROR_KEY: &str = "base";

/// Fixed user-facing message recorded for any captured error.
pub const GENERIC_FAILURE_MESSAGE: &str = "We're sorry, but something went wrong. Please try again.";

/// Runs a unit of work, converting any raised error into context failure.
///
/// Returns `Err` only when `rethrow` is set and the work raised; otherwise
/// the error is fully absorbed into the context.
pub fn capture(context: &mut Context, rethrow: bool, work: impl FnOnce(&mut Context) -> Result<()>) -> Result<()> {
    match work(context) {
        Ok(()) => Ok(()),
        Err(error) => {
            record_failure(context, &error);
            if rethrow { Err(error) } else { Ok(()) }
        }
    }
}

/// Records an already-raised error against the context.
///
/// The symmetric entry point for callers that hold the error value rather
/// than the work that produced it.
pub fn record_failure(context: &mut Context, error: &anyhow::Error) {
    warn!(
        organizer = %context.current_organizer_name(),
        action = %context.current_action_name(),
        error = %error,
        "captured unexpected failure"
    );
    context.record_raised_error(error);
    context.add_error(BASE_ERROR_KEY, GENERIC_FAILURE_MESSAGE);
    context.set_last_failed_context(None);
    context.abort();
}
