//! # Dotted-Path Projection
//!
//! Converts nested JSON structures to and from single-level dotted-key maps
//! and selects or omits fragments addressed by dotted paths. Paths join map
//! keys with a separator (default `.`) and address list elements either with
//! the separator (`items.0.name`) or bracket notation (`items[0].name`).
//!
//! Rebuilt output is deep-sorted: `serde_json::Map` orders keys
//! alphabetically, so every object produced by [`pick`], [`omit`], and
//! [`unflatten`] has sorted keys at every nesting level while lists keep
//! their element order.

use indexmap::{IndexMap, IndexSet};
use serde_json::{Map, Value};
use thiserror::Error;

/// Wildcard marker substituted for numeric index segments by
/// [`list_paths`] when index collapsing is enabled.
pub const INDEX_WILDCARD: &str = "*";

/// Errors raised by strict projection entry points.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    /// A top-level key containing the separator collided with path syntax at
    /// a call site that declared the collision unreachable.
    #[error("literal key '{key}' collides with dotted-path syntax")]
    LiteralKeyConflict {
        /// The offending top-level key.
        key: String,
    },
}

/// Options controlling how [`flatten`] renders paths.
#[derive(Debug, Clone)]
pub struct FlattenOptions {
    /// Separator joining successive key segments.
    pub separator: String,
    /// Render list indices as `[0]` instead of `sep + index`.
    pub use_brackets: bool,
}

impl Default for FlattenOptions {
    fn default() -> Self {
        Self {
            separator: ".".to_string(),
            use_brackets: false,
        }
    }
}

/// Options controlling how [`list_paths`] renders and collapses paths.
#[derive(Debug, Clone, Default)]
pub struct ListPathsOptions {
    /// Path rendering options shared with [`flatten`].
    pub flatten: FlattenOptions,
    /// Replace numeric index segments with [`INDEX_WILDCARD`] and drop
    /// duplicate paths, preserving first-seen order.
    pub collapse_indices: bool,
}

/// One parsed step of a dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn segment_key(segment: &Segment) -> String {
    match segment {
        Segment::Key(key) => key.clone(),
        Segment::Index(index) => index.to_string(),
    }
}

/// Splits a dotted path into key and index segments.
///
/// Bracket groups may follow a key within a single separated piece
/// (`items[0][1]`), and a purely numeric piece is treated as an index.
fn parse_path(path: &str, separator: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    for piece in path.split(separator) {
        if piece.is_empty() {
            continue;
        }
        let (head, brackets) = match piece.find('[') {
            Some(position) => (&piece[..position], &piece[position..]),
            None => (piece, ""),
        };
        if !head.is_empty() {
            match head.parse::<usize>() {
                Ok(index) => segments.push(Segment::Index(index)),
                Err(_) => segments.push(Segment::Key(head.to_string())),
            }
        }
        let mut remaining = brackets;
        while let Some(stripped) = remaining.strip_prefix('[') {
            let Some(close) = stripped.find(']') else {
                break;
            };
            let inner = &stripped[..close];
            match inner.parse::<usize>() {
                Ok(index) => segments.push(Segment::Index(index)),
                Err(_) => segments.push(Segment::Key(inner.to_string())),
            }
            remaining = &stripped[close + 1..];
        }
    }
    segments
}

/// Resolves a parsed path against a nested value, descending key by key.
///
/// An index segment addresses a list element, or a map entry whose key is the
/// decimal rendering of the index.
fn resolve<'a>(value: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let mut current = value;
    for segment in segments {
        current = match (current, segment) {
            (Value::Object(map), Segment::Key(key)) => map.get(key)?,
            (Value::Object(map), Segment::Index(index)) => map.get(&index.to_string())?,
            (Value::Array(items), Segment::Index(index)) => items.get(*index)?,
            _ => return None,
        };
    }
    Some(current)
}

fn collect_leaves(value: &Value, prefix: &str, options: &FlattenOptions, collapse_indices: bool, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}{}{key}", options.separator)
                };
                collect_leaves(child, &path, options, collapse_indices, out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (index, child) in items.iter().enumerate() {
                let segment = if collapse_indices {
                    INDEX_WILDCARD.to_string()
                } else {
                    index.to_string()
                };
                let path = if options.use_brackets {
                    format!("{prefix}[{segment}]")
                } else if prefix.is_empty() {
                    segment
                } else {
                    format!("{prefix}{}{segment}", options.separator)
                };
                collect_leaves(child, &path, options, collapse_indices, out);
            }
        }
        leaf => {
            // Empty containers flatten as leaves so round-trips preserve them.
            if !prefix.is_empty() {
                out.push((prefix.to_string(), leaf.clone()));
            }
        }
    }
}

/// Flattens a nested structure into a map of full dotted paths to leaf values.
///
/// ```rust
/// use conveyor_util::projection::{FlattenOptions, flatten};
/// use serde_json::json;
///
/// let flat = flatten(&json!({"a": {"b": {"c": 1}}}), &FlattenOptions::default());
/// assert_eq!(flat.get("a.b.c"), Some(&json!(1)));
/// ```
pub fn flatten(value: &Value, options: &FlattenOptions) -> IndexMap<String, Value> {
    let mut leaves = Vec::new();
    collect_leaves(value, "", options, false, &mut leaves);
    leaves.into_iter().collect()
}

/// Lists every leaf path of a nested structure in traversal order.
///
/// With `collapse_indices` set, numeric index segments are replaced by the
/// wildcard marker and duplicate paths are dropped, first occurrence winning.
pub fn list_paths(value: &Value, options: &ListPathsOptions) -> Vec<String> {
    let mut leaves = Vec::new();
    collect_leaves(value, "", &options.flatten, options.collapse_indices, &mut leaves);
    let paths: IndexSet<String> = leaves.into_iter().map(|(path, _)| path).collect();
    paths.into_iter().collect()
}

/// Intermediate tree used to rebuild nested structures from flat paths.
enum Node {
    Leaf(Value),
    Branch(IndexMap<String, Node>),
}

fn tree_insert(root: &mut IndexMap<String, Node>, segments: &[Segment], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    let key = segment_key(first);
    if rest.is_empty() {
        root.insert(key, Node::Leaf(value));
        return;
    }
    let child = root.entry(key).or_insert_with(|| Node::Branch(IndexMap::new()));
    // A later, deeper write wins over an earlier leaf at the same location.
    if let Node::Leaf(_) = child {
        *child = Node::Branch(IndexMap::new());
    }
    match child {
        Node::Branch(children) => tree_insert(children, rest, value),
        Node::Leaf(_) => {}
    }
}

fn materialize(node: Node) -> Value {
    match node {
        Node::Leaf(value) => value,
        Node::Branch(children) => {
            let all_numeric = !children.is_empty() && children.keys().all(|key| key.parse::<usize>().is_ok());
            if all_numeric {
                let mut pairs: Vec<(usize, Node)> = children
                    .into_iter()
                    .filter_map(|(key, child)| key.parse::<usize>().ok().map(|index| (index, child)))
                    .collect();
                pairs.sort_by_key(|(index, _)| *index);
                let length = pairs.last().map(|(index, _)| index + 1).unwrap_or(0);
                let mut items = vec![Value::Null; length];
                for (index, child) in pairs {
                    items[index] = materialize(child);
                }
                Value::Array(items)
            } else {
                let mut map = Map::new();
                for (key, child) in children {
                    map.insert(key, materialize(child));
                }
                Value::Object(map)
            }
        }
    }
}

/// Rebuilds a nested structure from a flat dotted-key map.
///
/// The inverse of [`flatten`]: branches whose segments are all numeric become
/// lists (gaps padded with null), everything else becomes a map with sorted
/// keys.
pub fn unflatten(flat: &IndexMap<String, Value>, separator: &str) -> Value {
    let mut root = IndexMap::new();
    for (path, value) in flat {
        let segments = parse_path(path, separator);
        tree_insert(&mut root, &segments, value.clone());
    }
    materialize(Node::Branch(root))
}

fn pick_into<S: AsRef<str>>(value: &Value, paths: &[S], strict: bool) -> Result<Value, ProjectionError> {
    let mut root = IndexMap::new();
    for path in paths {
        let path = path.as_ref();
        if path.is_empty() {
            continue;
        }
        let segments = parse_path(path, ".");
        if let Some(found) = resolve(value, &segments) {
            tree_insert(&mut root, &segments, found.clone());
            continue;
        }
        // Hierarchical resolution failed; a literal top-level key spelled
        // exactly like the path means a key containing the separator collided
        // with path syntax. Reinterpret it as a dotted write instead of
        // dropping it.
        if let Value::Object(map) = value
            && let Some(literal) = map.get(path)
        {
            if strict {
                return Err(ProjectionError::LiteralKeyConflict { key: path.to_string() });
            }
            tree_insert(&mut root, &segments, literal.clone());
        }
    }
    Ok(materialize(Node::Branch(root)))
}

/// Copies the requested dotted paths out of a nested structure.
///
/// Unresolvable paths are skipped without error. Output maps are sorted at
/// every level; lists keep element order, with unpicked positions as null.
pub fn pick<S: AsRef<str>>(value: &Value, paths: &[S]) -> Value {
    match pick_into(value, paths, false) {
        Ok(picked) => picked,
        Err(_) => Value::Object(Map::new()),
    }
}

/// [`pick`] for call sites where a literal separator-bearing key is a logic
/// error rather than data to be rescued.
pub fn pick_strict<S: AsRef<str>>(value: &Value, paths: &[S]) -> Result<Value, ProjectionError> {
    pick_into(value, paths, true)
}

/// Boundary-safe prefix test: `a` matches `a`, `a.b`, and `a[0]` but not `ab`.
fn path_matches(needle: &str, flat_key: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    if flat_key == needle {
        return true;
    }
    flat_key
        .strip_prefix(needle)
        .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('['))
}

/// Removes the requested dotted paths (and their descendants) from a nested
/// structure, returning the deep-sorted remainder.
///
/// ```rust
/// use conveyor_util::projection::omit;
/// use serde_json::json;
///
/// let remainder = omit(&json!({"a": 1, "b": {"c": 3, "d": [1, 2, 3]}}), &["b.c"]);
/// assert_eq!(remainder, json!({"a": 1, "b": {"d": [1, 2, 3]}}));
/// ```
pub fn omit<S: AsRef<str>>(value: &Value, paths: &[S]) -> Value {
    let flat = flatten(value, &FlattenOptions::default());
    let retained: IndexMap<String, Value> = flat
        .into_iter()
        .filter(|(key, _)| !paths.iter().any(|needle| path_matches(needle.as_ref(), key)))
        .collect();
    unflatten(&retained, ".")
}

fn stringify_scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(true) => "1".to_string(),
        Value::Bool(false) => "0".to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.clone(),
        container => container.to_string(),
    }
}

/// Normalizes a loose key specification into a list of path strings.
///
/// `None`/null stay absent, a single string becomes a one-element list, and
/// list elements are stringified: numbers as decimal text, booleans as
/// `"1"`/`"0"`, null as the empty string, containers as JSON text.
pub fn normalize_key_list(input: Option<&Value>) -> Option<Vec<String>> {
    match input? {
        Value::Null => None,
        Value::String(text) => Some(vec![text.clone()]),
        Value::Array(items) => Some(items.iter().map(stringify_scalar).collect()),
        scalar => Some(vec![stringify_scalar(scalar)]),
    }
}

fn resolve_in_map<'a>(source: &'a Map<String, Value>, segments: &[Segment]) -> Option<&'a Value> {
    let (first, rest) = segments.split_first()?;
    let entry = match first {
        Segment::Key(key) => source.get(key)?,
        Segment::Index(index) => source.get(&index.to_string())?,
    };
    resolve(entry, rest)
}

/// Resolves every requested key (dotted or flat) against a map, keeping the
/// key order of the request and filling misses with null.
pub fn select_or_null<S: AsRef<str>>(source: &Map<String, Value>, keys: &[S]) -> IndexMap<String, Value> {
    let mut selected = IndexMap::new();
    for key in keys {
        let key = key.as_ref();
        let segments = parse_path(key, ".");
        let resolved = resolve_in_map(source, &segments).cloned().unwrap_or(Value::Null);
        selected.insert(key.to_string(), resolved);
    }
    selected
}

fn slot_mut<'a>(current: &'a mut Value, segment: &Segment) -> &'a mut Value {
    match segment {
        Segment::Key(key) => {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            let map = current.as_object_mut().expect("slot coerced to object");
            map.entry(key.clone()).or_insert(Value::Null)
        }
        Segment::Index(index) => {
            if !current.is_array() {
                *current = Value::Array(Vec::new());
            }
            let items = current.as_array_mut().expect("slot coerced to array");
            if items.len() <= *index {
                items.resize(*index + 1, Value::Null);
            }
            &mut items[*index]
        }
    }
}

fn write_slot(current: &mut Value, segment: &Segment, value: Value) {
    match segment {
        Segment::Key(key) => {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            let map = current.as_object_mut().expect("slot coerced to object");
            map.insert(key.clone(), value);
        }
        Segment::Index(index) => {
            if !current.is_array() {
                *current = Value::Array(Vec::new());
            }
            let items = current.as_array_mut().expect("slot coerced to array");
            if items.len() <= *index {
                items.resize(*index + 1, Value::Null);
            }
            items[*index] = value;
        }
    }
}

/// Writes a single value at a dotted path inside a map, creating intermediate
/// structure as needed and leaving sibling entries untouched.
pub fn insert_at_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    let segments = parse_path(path, ".");
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        target.insert(segment_key(first), value);
        return;
    }
    let Some((last, middle)) = rest.split_last() else {
        return;
    };
    let mut current = target.entry(segment_key(first)).or_insert(Value::Null);
    for segment in middle {
        current = slot_mut(current, segment);
    }
    write_slot(current, last, value);
}
