//! # Conveyor Utilities
//!
//! Leaf utilities shared across the Conveyor workspace. The projection module
//! converts between nested and dotted-path representations of JSON data and
//! powers the context's selective views; the backtrace module filters and
//! silences diagnostic trace lines before they are stored.

pub mod backtrace;
pub mod projection;

pub use backtrace::{BacktraceCleaner, TraceOutput};
pub use projection::{
    FlattenOptions, ListPathsOptions, ProjectionError, flatten, insert_at_path, list_paths, normalize_key_list, omit, pick,
    pick_strict, select_or_null, unflatten,
};
