use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use super::{display_path, refine_target_path, DetailedPath, PathLevel};
use crate::{FieldPath, Row};

/// Trim the arrays in `record` down to the elements that matched `query_paths`.
///
/// Every array enclosing a matching leaf keeps only the indices that lead to a
/// match; indices matched through different query paths are unioned. A query
/// path with no matches at all empties its outermost array, but keeps the key.
/// Arrays are pruned deepest first. With `delete_elements` unset, unmatched
/// elements are replaced with `null` instead of removed, so indices stay stable.
///
/// Fields that are not arrays, or that no query path reaches, are left as they are.
pub fn filter_element_match(
    record: &Row,
    query_paths: &BTreeMap<FieldPath, Vec<Value>>,
    delete_elements: bool,
) -> Row {
    let mut keep: BTreeMap<DetailedPath, BTreeSet<usize>> = BTreeMap::new();

    for (path, only) in query_paths {
        let matches = refine_target_path(record, path, only);
        if matches.is_empty() {
            if let Some(array_path) = outermost_array(record, path) {
                keep.entry(array_path).or_default();
            }
            continue;
        }
        for detailed in matches {
            for (i, level) in detailed.iter().enumerate() {
                if let PathLevel::Index(idx) = level {
                    keep.entry(detailed[..i].to_vec()).or_default().insert(*idx);
                }
            }
        }
    }

    let mut out = record.clone();
    let mut arrays: Vec<_> = keep.into_iter().collect();
    // deepest first, so inner arrays are pruned before the arrays that contain them:
    arrays.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

    for (array_path, indices) in arrays {
        match lookup_array_mut(&mut out, &array_path) {
            Some(items) => prune(items, &indices, delete_elements),
            None => log::trace!("skipping {}: not an array", display_path(&array_path)),
        }
    }
    out
}

fn prune(items: &mut Vec<Value>, keep: &BTreeSet<usize>, delete_elements: bool) {
    for i in (0..items.len()).rev() {
        if keep.contains(&i) {
            continue;
        }
        if delete_elements {
            items.remove(i);
        } else {
            items[i] = Value::Null;
        }
    }
}

/// Path to the first array met while following `path` through objects.
fn outermost_array(record: &Row, path: &FieldPath) -> Option<DetailedPath> {
    let (first, rest) = path.levels().split_first()?;
    let mut value = record.get(first)?;
    let mut current = vec![PathLevel::Key(first.clone())];
    let mut rest = rest.iter();
    loop {
        match value {
            Value::Array(_) => return Some(current),
            Value::Object(map) => {
                let key = rest.next()?;
                value = map.get(key)?;
                current.push(PathLevel::Key(key.clone()));
            }
            _ => return None,
        }
    }
}

fn lookup_array_mut<'a>(record: &'a mut Row, path: &[PathLevel]) -> Option<&'a mut Vec<Value>> {
    let (first, rest) = path.split_first()?;
    let PathLevel::Key(key) = first else {
        return None;
    };
    let mut value = record.get_mut(key)?;
    for level in rest {
        value = match (level, value) {
            (PathLevel::Key(k), Value::Object(map)) => map.get_mut(k)?,
            (PathLevel::Index(i), Value::Array(items)) => items.get_mut(*i)?,
            _ => return None,
        };
    }
    value.as_array_mut()
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        match v {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn query(entries: &[(&str, Vec<Value>)]) -> BTreeMap<FieldPath, Vec<Value>> {
        entries
            .iter()
            .map(|(p, v)| (FieldPath::parse(p).unwrap(), v.clone()))
            .collect()
    }

    #[test]
    fn test_keeps_matching_elements_only() {
        let record = row(json!({
            "A": [1, 2, 3],
            "B": 2,
            "C": [{"D": 3, "E": 4}, {"D": 5, "E": 6}, {"D": 5, "E": 7}]
        }));
        let q = query(&[("A", vec![json!(2)]), ("C.D", vec![json!(5)])]);
        let filtered = filter_element_match(&record, &q, true);
        assert_eq!(
            Value::Object(filtered),
            json!({"A": [2], "B": 2, "C": [{"D": 5, "E": 6}, {"D": 5, "E": 7}]})
        );
    }

    #[test]
    fn test_no_match_empties_array() {
        let record = row(json!({"A": [1, 2]}));
        let q = query(&[("A", vec![json!(99)])]);
        assert_eq!(Value::Object(filter_element_match(&record, &q, true)), json!({"A": []}));
    }

    #[test]
    fn test_nested_arrays_prune_inner_first() {
        let record = row(json!({"A": [[1, 2], [3], [2, 5]]}));
        let q = query(&[("A", vec![json!(2)])]);
        assert_eq!(
            Value::Object(filter_element_match(&record, &q, true)),
            json!({"A": [[2], [2]]})
        );
    }

    #[test]
    fn test_union_across_query_paths() {
        let record = row(json!({"C": [{"D": 1, "E": 9}, {"D": 2, "E": 8}, {"D": 3, "E": 7}]}));
        let q = query(&[("C.D", vec![json!(1)]), ("C.E", vec![json!(7)])]);
        assert_eq!(
            Value::Object(filter_element_match(&record, &q, true)),
            json!({"C": [{"D": 1, "E": 9}, {"D": 3, "E": 7}]})
        );
    }

    #[test]
    fn test_placeholders_keep_indices() {
        let record = row(json!({"A": [1, 2, 3], "B": "x"}));
        let q = query(&[("A", vec![json!(2)])]);
        assert_eq!(
            Value::Object(filter_element_match(&record, &q, false)),
            json!({"A": [null, 2, null], "B": "x"})
        );
    }

    #[test]
    fn test_non_array_fields_untouched() {
        let record = row(json!({"B": 2, "D": {"E": 1}}));
        let q = query(&[("B", vec![json!(3)]), ("D.E", vec![json!(1)])]);
        assert_eq!(Value::Object(filter_element_match(&record, &q, true)), json!({"B": 2, "D": {"E": 1}}));
    }
}
