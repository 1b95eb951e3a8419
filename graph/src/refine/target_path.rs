use serde_json::Value;

use super::{display_path, DetailedPath, PathLevel};
use crate::{FieldPath, Row};

/// Find every leaf under `path` in `record` whose value is one of `only`.
///
/// Arrays met along the way are searched element by element (including arrays
/// of arrays), so each result is a fully-indexed path to one matching scalar.
/// A missing key or a type mismatch simply yields no match.
pub fn refine_target_path(record: &Row, path: &FieldPath, only: &[Value]) -> Vec<DetailedPath> {
    let mut out = Vec::new();
    let Some((first, rest)) = path.levels().split_first() else {
        return out;
    };
    match record.get(first) {
        Some(value) => {
            let mut current = vec![PathLevel::Key(first.clone())];
            walk(value, rest, only, &mut current, &mut out);
        }
        None => log::trace!("no match for {path}: field not present"),
    }
    out
}

fn walk(
    value: &Value,
    remaining: &[String],
    only: &[Value],
    current: &mut DetailedPath,
    out: &mut Vec<DetailedPath>,
) {
    match value {
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                current.push(PathLevel::Index(i));
                walk(item, remaining, only, current, out);
                current.pop();
            }
        }
        Value::Object(map) => {
            let Some((key, rest)) = remaining.split_first() else {
                log::trace!("no match at {}: expected a scalar, found an object", display_path(current));
                return;
            };
            match map.get(key) {
                Some(v) => {
                    current.push(PathLevel::Key(key.clone()));
                    walk(v, rest, only, current, out);
                    current.pop();
                }
                None => log::trace!("no match at {}: missing key {key}", display_path(current)),
            }
        }
        scalar => {
            if !remaining.is_empty() {
                log::trace!(
                    "no match at {}: cannot look up {} in a scalar",
                    display_path(current),
                    remaining.join(".")
                );
            } else if only.contains(scalar) {
                out.push(current.clone());
            }
        }
    }
}
