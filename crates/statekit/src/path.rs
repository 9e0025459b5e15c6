//! Path parsing and nested state-tree addressing.
//!
//! A path identifies a location in the JSON state tree. Two flavors exist:
//!
//! | Flavor | Example | Segments |
//! |--------|---------|----------|
//! | Parseable | `"a.b[2].c"` | `["a", "b", "2", "c"]` |
//! | Raw | `"weird.key[" ` | `["weird.key["]` (verbatim) |
//!
//! A raw key is always treated as one segment and never split; it is the
//! escape hatch for top-level keys containing path metacharacters. Parsing
//! falls back to raw when the bracket syntax is malformed, so callers never
//! see a parse error for a plain store key.
//!
//! [`StatePath`] is the explicit builder that replaces dynamic property
//! interception for "subscribe to whatever this projection reads" use
//! cases: callers state the path they mean instead of having it inferred.

use std::fmt;

use serde_json::Value;

/// The reserved subscription key receiving every structural change.
pub const GLOBAL_PATH: &str = "*";

/// A parsed location in the state tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatePath {
    segments: Vec<String>,
}

impl StatePath {
    /// The root path (`""`), denoting the whole tree.
    pub fn root() -> Self {
        Self { segments: Vec::new() }
    }

    /// Parse a dotted/bracketed path string into segments.
    ///
    /// Malformed bracket syntax (unbalanced `[`, empty index) degrades the
    /// whole string to a single raw segment rather than failing.
    pub fn parse(path: &str) -> Self {
        if path.is_empty() {
            return Self::root();
        }
        match split_segments(path) {
            Some(segments) => Self { segments },
            None => Self::raw(path),
        }
    }

    /// Treat `key` verbatim as a single top-level segment.
    pub fn raw(key: &str) -> Self {
        Self {
            segments: vec![key.to_string()],
        }
    }

    /// Append an object key segment.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.segments.push(key.into());
        self
    }

    /// Append an array index segment.
    pub fn index(mut self, index: usize) -> Self {
        self.segments.push(index.to_string());
        self
    }

    /// The individual path segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The top-level key this path is rooted under, if any.
    pub fn top_level(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Whether this is the root (whole-tree) path.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Whether `self` and `other` lie on the same branch, meaning one is an
    /// ancestor of (or equal to) the other. Subscribers are notified for
    /// related paths, never for siblings.
    pub fn is_related(&self, other: &StatePath) -> bool {
        let shorter = self.segments.len().min(other.segments.len());
        self.segments[..shorter] == other.segments[..shorter]
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl From<&str> for StatePath {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

impl From<String> for StatePath {
    fn from(path: String) -> Self {
        Self::parse(&path)
    }
}

/// Split `"a.b[2].c"` into `["a", "b", "2", "c"]`.
///
/// Returns `None` when the bracket syntax is malformed; the caller then
/// treats the whole string as a raw key.
fn split_segments(path: &str) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return None;
        }
        let mut rest = part;
        // Leading name before any bracket, e.g. "b" in "b[2]".
        if let Some(open) = rest.find('[') {
            if open > 0 {
                segments.push(rest[..open].to_string());
            }
            rest = &rest[open..];
        } else {
            segments.push(rest.to_string());
            continue;
        }
        // One or more "[n]" groups.
        while !rest.is_empty() {
            if !rest.starts_with('[') {
                return None;
            }
            let close = rest.find(']')?;
            let index = &rest[1..close];
            if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            segments.push(index.to_string());
            rest = &rest[close + 1..];
        }
    }
    Some(segments)
}

/// Read the value at `path` inside `root`, if present.
pub fn value_at<'a>(root: &'a Value, path: &StatePath) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.segments() {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write `value` at `path` inside `root`, creating intermediate containers
/// as needed. Whether an intermediate is an object or an array is inferred
/// from the shape of the next segment (numeric → array).
pub fn set_value_at(root: &mut Value, path: &StatePath, value: Value) {
    let segments = path.segments();
    if segments.is_empty() {
        *root = value;
        return;
    }
    let mut current = root;
    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        let next_is_index = segments
            .get(i + 1)
            .is_some_and(|s| s.parse::<usize>().is_ok());
        match segment.parse::<usize>() {
            Ok(index) => {
                if !current.is_array() {
                    *current = Value::Array(Vec::new());
                }
                let items = current.as_array_mut().expect("coerced to array above");
                while items.len() <= index {
                    items.push(Value::Null);
                }
                if last {
                    items[index] = value;
                    return;
                }
                if !items[index].is_object() && !items[index].is_array() {
                    items[index] = empty_container(next_is_index);
                }
                current = &mut items[index];
            }
            Err(_) => {
                if !current.is_object() {
                    *current = Value::Object(serde_json::Map::new());
                }
                let map = current.as_object_mut().expect("coerced to object above");
                if last {
                    map.insert(segment.clone(), value);
                    return;
                }
                let entry = map
                    .entry(segment.clone())
                    .or_insert_with(|| empty_container(next_is_index));
                if !entry.is_object() && !entry.is_array() {
                    *entry = empty_container(next_is_index);
                }
                current = entry;
            }
        }
    }
}

/// Remove the value at `path` inside `root`. Returns whether anything was
/// removed. Removing an array element shifts later elements down.
pub fn remove_value_at(root: &mut Value, path: &StatePath) -> bool {
    let Some((last, parents)) = path.segments().split_last() else {
        return false;
    };
    let mut current = root;
    for segment in parents {
        current = match current {
            Value::Object(map) => match map.get_mut(segment) {
                Some(next) => next,
                None => return false,
            },
            Value::Array(items) => {
                match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                    Some(next) => next,
                    None => return false,
                }
            }
            _ => return false,
        };
    }
    match current {
        Value::Object(map) => map.remove(last.as_str()).is_some(),
        Value::Array(items) => match last.parse::<usize>() {
            Ok(index) if index < items.len() => {
                items.remove(index);
                true
            }
            _ => false,
        },
        _ => false,
    }
}

fn empty_container(as_array: bool) -> Value {
    if as_array {
        Value::Array(Vec::new())
    } else {
        Value::Object(serde_json::Map::new())
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_dotted_and_bracketed() {
        let path = StatePath::parse("a.b[2].c");
        assert_eq!(path.segments(), ["a", "b", "2", "c"]);
        assert_eq!(path.top_level(), Some("a"));
    }

    #[test]
    fn parse_plain_key() {
        let path = StatePath::parse("count");
        assert_eq!(path.segments(), ["count"]);
    }

    #[test]
    fn parse_leading_bracket() {
        let path = StatePath::parse("items[0]");
        assert_eq!(path.segments(), ["items", "0"]);
    }

    #[test]
    fn malformed_brackets_fall_back_to_raw() {
        let path = StatePath::parse("weird[key");
        assert_eq!(path.segments(), ["weird[key"]);

        let path = StatePath::parse("a[]");
        assert_eq!(path.segments(), ["a[]"]);
    }

    #[test]
    fn raw_key_is_never_split() {
        let path = StatePath::raw("a.b[2].c");
        assert_eq!(path.segments(), ["a.b[2].c"]);
    }

    #[test]
    fn empty_path_is_root() {
        let path = StatePath::parse("");
        assert!(path.is_root());
        assert_eq!(path.top_level(), None);
    }

    #[test]
    fn builder_constructs_segments() {
        let path = StatePath::root().key("a").key("b").index(2).key("c");
        assert_eq!(path.segments(), ["a", "b", "2", "c"]);
        assert_eq!(path.to_string(), "a.b.2.c");
    }

    #[test]
    fn relatedness_is_branch_membership() {
        let a = StatePath::parse("a.b");
        assert!(a.is_related(&StatePath::parse("a")));
        assert!(a.is_related(&StatePath::parse("a.b.c")));
        assert!(a.is_related(&StatePath::parse("a.b")));
        assert!(!a.is_related(&StatePath::parse("a.c")));
        assert!(!a.is_related(&StatePath::parse("x")));
    }

    #[test]
    fn value_at_walks_objects_and_arrays() {
        let tree = json!({"a": {"b": [10, {"c": "hit"}]}});
        let value = value_at(&tree, &StatePath::parse("a.b[1].c"));
        assert_eq!(value, Some(&json!("hit")));

        assert_eq!(value_at(&tree, &StatePath::parse("a.missing")), None);
        assert_eq!(value_at(&tree, &StatePath::parse("a.b[9]")), None);
    }

    #[test]
    fn value_at_root_returns_whole_tree() {
        let tree = json!({"a": 1});
        assert_eq!(value_at(&tree, &StatePath::root()), Some(&tree));
    }

    #[test]
    fn set_value_at_creates_intermediates() {
        let mut tree = json!({});
        set_value_at(&mut tree, &StatePath::parse("a.b[1].c"), json!(5));
        assert_eq!(tree, json!({"a": {"b": [null, {"c": 5}]}}));
    }

    #[test]
    fn set_value_at_infers_container_shape() {
        let mut tree = json!({});
        set_value_at(&mut tree, &StatePath::parse("xs[0]"), json!("first"));
        assert_eq!(tree, json!({"xs": ["first"]}));

        set_value_at(&mut tree, &StatePath::parse("obj.inner"), json!(true));
        assert_eq!(tree["obj"], json!({"inner": true}));
    }

    #[test]
    fn set_value_at_overwrites_scalars_on_the_way() {
        let mut tree = json!({"a": 7});
        set_value_at(&mut tree, &StatePath::parse("a.b"), json!(1));
        assert_eq!(tree, json!({"a": {"b": 1}}));
    }

    #[test]
    fn set_value_at_root_replaces_tree() {
        let mut tree = json!({"old": true});
        set_value_at(&mut tree, &StatePath::root(), json!({"new": 1}));
        assert_eq!(tree, json!({"new": 1}));
    }

    #[test]
    fn remove_value_at_objects_and_arrays() {
        let mut tree = json!({"a": {"b": {"c": 1, "d": 2}}, "xs": [1, 2, 3]});

        assert!(remove_value_at(&mut tree, &StatePath::parse("a.b.c")));
        assert_eq!(tree["a"], json!({"b": {"d": 2}}));

        assert!(remove_value_at(&mut tree, &StatePath::parse("xs[1]")));
        assert_eq!(tree["xs"], json!([1, 3]));

        assert!(!remove_value_at(&mut tree, &StatePath::parse("a.b.missing")));
        assert!(!remove_value_at(&mut tree, &StatePath::parse("xs[9]")));
        assert!(!remove_value_at(&mut tree, &StatePath::root()));
    }
}
