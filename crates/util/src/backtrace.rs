//! # Backtrace Cleaning
//!
//! Filters and silences diagnostic trace lines before they are stored in a
//! pipeline context. Callers configure an ordered list of line filters
//! (rewriting each line) and silencer predicates (dropping lines), and choose
//! between keeping the surviving lines or, for debugging a silencer setup,
//! keeping only the lines the silencers removed.

use once_cell::sync::Lazy;
use regex::Regex;

/// Rewrites a single trace line; applied in registration order.
pub type LineFilter = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Decides whether a trace line should be silenced.
pub type Silencer = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Which side of the silencer partition to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceOutput {
    /// Keep only the lines no silencer matched.
    #[default]
    Cleaned,
    /// Keep only the silenced lines (for inspecting silencer coverage).
    SilencedOnly,
}

static NOISE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"/rustc/[0-9a-f]+/",
        r"library/(std|core|alloc)/src/",
        r"\.cargo/registry/src/",
        r"^\s*\d+:\s+(std|core|alloc)::",
        r"backtrace::backtrace",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("noise pattern compiles"))
    .collect()
});

static FRAME_LOCATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s+at\s+").expect("frame location pattern compiles"));

/// Ordered filter/silencer pipeline over backtrace lines.
pub struct BacktraceCleaner {
    filters: Vec<LineFilter>,
    silencers: Vec<Silencer>,
}

impl BacktraceCleaner {
    /// A cleaner with no filters and no silencers; every line passes through.
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            silencers: Vec::new(),
        }
    }

    /// A cleaner preconfigured for Rust backtraces: trims frame indentation
    /// and silences runtime, standard-library, and registry frames.
    pub fn with_defaults() -> Self {
        let mut cleaner = Self::new();
        cleaner.add_filter(|line| line.trim_end().to_string());
        cleaner.add_silencer(|line| line.trim().is_empty());
        cleaner.add_silencer(|line| NOISE_PATTERNS.iter().any(|pattern| pattern.is_match(line)));
        cleaner
    }

    /// Appends a line filter; filters run in registration order.
    pub fn add_filter(&mut self, filter: impl Fn(&str) -> String + Send + Sync + 'static) {
        self.filters.push(Box::new(filter));
    }

    /// Appends a silencer predicate; a line is silenced if any predicate matches.
    pub fn add_silencer(&mut self, silencer: impl Fn(&str) -> bool + Send + Sync + 'static) {
        self.silencers.push(Box::new(silencer));
    }

    fn apply_filters(&self, line: &str) -> String {
        let mut filtered = line.to_string();
        for filter in &self.filters {
            filtered = filter(&filtered);
        }
        filtered
    }

    fn is_silenced(&self, line: &str) -> bool {
        self.silencers.iter().any(|silencer| silencer(line))
    }

    /// Cleans an iterator of raw lines.
    pub fn clean_lines<'a>(&self, lines: impl IntoIterator<Item = &'a str>, output: TraceOutput) -> Vec<String> {
        lines
            .into_iter()
            .map(|line| self.apply_filters(line))
            .filter(|line| match output {
                TraceOutput::Cleaned => !self.is_silenced(line),
                TraceOutput::SilencedOnly => self.is_silenced(line),
            })
            .collect()
    }

    /// Cleans a raw multi-line trace string.
    pub fn clean_str(&self, raw: &str, output: TraceOutput) -> Vec<String> {
        self.clean_lines(raw.lines(), output)
    }

    /// Cleans a raised error: the error message, its cause chain, and any
    /// captured backtrace frames, in that order.
    pub fn clean_error(&self, error: &anyhow::Error, output: TraceOutput) -> Vec<String> {
        let mut raw_lines: Vec<String> = error.chain().map(|cause| cause.to_string()).collect();
        let backtrace = error.backtrace().to_string();
        raw_lines.extend(backtrace.lines().map(|line| line.to_string()));
        self.clean_lines(raw_lines.iter().map(String::as_str), output)
    }
}

impl Default for BacktraceCleaner {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Collapses a frame-location line (`   at src/lib.rs:10:5`) to its path.
pub fn strip_frame_location(line: &str) -> String {
    FRAME_LOCATION.replace(line, "at ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_lines() -> Vec<&'static str> {
        vec![
            "conveyor_engine::action::execute",
            "             at /rustc/0123456789abcdef/library/std/src/panicking.rs:553:40",
            "my_app::actions::charge_card",
            "   at src/actions/charge.rs:42:9",
        ]
    }

    #[test]
    fn default_cleaner_drops_runtime_frames() {
        let cleaner = BacktraceCleaner::with_defaults();
        let cleaned = cleaner.clean_lines(sample_lines(), TraceOutput::Cleaned);
        assert_eq!(
            cleaned,
            vec![
                "conveyor_engine::action::execute".to_string(),
                "my_app::actions::charge_card".to_string(),
                "   at src/actions/charge.rs:42:9".to_string(),
            ]
        );
    }

    #[test]
    fn silenced_only_returns_the_complement() {
        let cleaner = BacktraceCleaner::with_defaults();
        let lines = sample_lines();
        let cleaned = cleaner.clean_lines(lines.clone(), TraceOutput::Cleaned);
        let silenced = cleaner.clean_lines(lines.clone(), TraceOutput::SilencedOnly);
        assert_eq!(cleaned.len() + silenced.len(), lines.len());
        assert!(silenced.iter().all(|line| line.contains("/rustc/")));
    }

    #[test]
    fn filters_run_in_registration_order() {
        let mut cleaner = BacktraceCleaner::new();
        cleaner.add_filter(|line| line.replace("one", "two"));
        cleaner.add_filter(|line| line.replace("two", "three"));
        let cleaned = cleaner.clean_lines(["one"], TraceOutput::Cleaned);
        assert_eq!(cleaned, vec!["three".to_string()]);
    }

    #[test]
    fn silencers_apply_after_filters() {
        let mut cleaner = BacktraceCleaner::new();
        cleaner.add_filter(|line| strip_frame_location(line));
        cleaner.add_silencer(|line| line.starts_with("at "));
        let cleaned = cleaner.clean_str("keep me\n   at src/lib.rs:1:1", TraceOutput::Cleaned);
        assert_eq!(cleaned, vec!["keep me".to_string()]);
    }

    #[test]
    fn clean_error_includes_the_cause_chain() {
        let cleaner = BacktraceCleaner::new();
        let error = anyhow::anyhow!("inner problem").context("outer problem");
        let lines = cleaner.clean_error(&error, TraceOutput::Cleaned);
        assert!(lines.iter().any(|line| line.contains("outer problem")));
        assert!(lines.iter().any(|line| line.contains("inner problem")));
    }
}
