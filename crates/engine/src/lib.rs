//! # Conveyor Engine
//!
//! The Conveyor Engine runs business pipelines: ordered units of work that
//! share one mutable context per invocation. It provides the context data
//! model, the action lifecycle, sequential step runners with short-circuit
//! semantics, a two-phase orchestrator, and the error-capture layer that
//! turns unexpected failures into structured context state.
//!
//! ## Key Features
//!
//! - **Shared context**: one mutable state value threaded through a run, with
//!   shallow-merge mutators, deduplicated field errors, and selective
//!   dotted-path views
//! - **Action lifecycle**: before/after/success/failure hooks around a single
//!   `perform`, with hooks as compile-time trait impls
//! - **Short-circuiting step runners**: an organizer stops at the first step
//!   that leaves the context failed and records a failure snapshot
//! - **Two-phase orchestration**: a pre-phase of delegated sub-pipelines
//!   whose owned results merge into the root context by value
//! - **Error capture**: raised errors become structured diagnostics plus a
//!   generic user-facing message, swallowed or rethrown on request
//!
//! ## Usage
//!
//! ```rust
//! use conveyor_engine::{JsonMap, Organizer, Overrides, Step};
//! use serde_json::json;
//!
//! struct Signup;
//!
//! impl Organizer for Signup {
//!     fn name(&self) -> &str {
//!         "demo::Signup"
//!     }
//!
//!     fn steps(&self) -> Vec<Step> {
//!         vec![Step::inline("greet", |context| {
//!             let name = context.input().get("name").cloned().unwrap_or(json!("stranger"));
//!             context.with_resource("greeting", json!(format!("hello, {}", name.as_str().unwrap_or("stranger"))));
//!             Ok(())
//!         })]
//!     }
//! }
//!
//! let mut input = JsonMap::new();
//! input.insert("name".to_string(), json!("ada"));
//! let context = Signup.call(input, Overrides::default());
//! assert!(context.complete());
//! assert_eq!(context.resources()["greeting"], json!("hello, ada"));
//! ```
//!
//! ## Architecture
//!
//! - **`context`**: the shared mutable state value and its merge semantics
//! - **`action`**: the unit-of-work trait and lifecycle
//! - **`organizer`**: sequential step execution with short-circuit
//! - **`orchestrator`**: the two-phase runner layered on organizers
//! - **`capture`**: raised-error conversion into context failure
//! - **`validation`**: collaborator contracts for mappers and rule engines

pub mod action;
pub mod capture;
pub mod context;
pub mod organizer;
pub mod orchestrator;
pub mod validation;

// Re-export commonly used shared types for convenience
pub use conveyor_types::{ContextSnapshot, ContextStatus, ErrorInfo, FieldErrors, Operation};

pub use action::Action;
pub use capture::{BASE_ERROR_KEY, GENERIC_FAILURE_MESSAGE, capture as capture_errors, record_failure};
pub use context::{
    ALL_ACTIONS_COMPLETE_KEY, Context, ERROR_INFO_KEY, JsonMap, LAST_FAILED_CONTEXT_KEY, OPERATION_KEY, Overrides,
    SUCCESSFUL_ACTIONS_KEY, short_label,
};
pub use organizer::{ContextHook, InlineStepFn, Organizer, OrganizerObserver, RunConfig, Step};
pub use orchestrator::{DelegateFn, OrganizerStep, Orchestrator};
pub use validation::{FnMapper, Mapper, RuleEngine, RuleOutcome, ValidationAction, ValidationFailed};
