use std::fmt;

use serde_json::Value;

use crate::{FieldPath, Row};

mod target_path;
pub use target_path::refine_target_path;

mod element_match;
pub use element_match::filter_element_match;

/// One step into a json value: an object key or an array index.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathLevel {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(k) => f.write_str(k),
            Self::Index(i) => write!(f, "{i}"),
        }
    }
}

/// A fully-indexed path to one value in a record, e.g. `C.1.D`.
pub type DetailedPath = Vec<PathLevel>;

/// Render a detailed path in dotted form.
pub fn display_path(path: &[PathLevel]) -> String {
    path.iter()
        .map(PathLevel::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// Collect every value found at `path` in `row`, flattening any arrays along the way.
pub fn consolidate_query_matches(row: &Row, path: &FieldPath) -> Vec<Value> {
    let mut out = Vec::new();
    if let Some((first, rest)) = path.levels().split_first() {
        if let Some(value) = row.get(first) {
            consolidate(value, rest, &mut out);
        }
    }
    out
}

fn consolidate(value: &Value, levels: &[String], out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                consolidate(item, levels, out);
            }
        }
        _ if levels.is_empty() => out.push(value.clone()),
        Value::Object(map) => {
            if let Some(v) = map.get(&levels[0]) {
                consolidate(v, &levels[1..], out);
            }
        }
        _ => {}
    }
}
