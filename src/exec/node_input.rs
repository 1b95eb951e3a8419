use std::collections::BTreeMap;

use serde_json::Value;

/// Values collected from upstream tasks, keyed by local dotted field path.
///
/// `values` can be combined freely when querying. Each entry in `grouped`
/// came from a single upstream row, and its fields have to be matched together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInput {
    pub values: BTreeMap<String, Vec<Value>>,
    pub grouped: Vec<BTreeMap<String, Vec<Value>>>,
}

impl NodeInput {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.grouped.is_empty()
    }

    /// Append `values` to the independent values for `path`, skipping duplicates.
    pub fn extend(&mut self, path: &str, values: impl IntoIterator<Item = Value>) {
        let entry = self.values.entry(path.to_owned()).or_default();
        for v in values {
            if !entry.contains(&v) {
                entry.push(v);
            }
        }
    }

    /// Expand each group into the rows it stands for. Lists within one group are
    /// multiplied out, but values from different groups are never combined.
    pub fn grouped_rows(&self) -> Vec<BTreeMap<String, Value>> {
        let mut out = Vec::new();
        for group in &self.grouped {
            let mut rows = vec![BTreeMap::new()];
            for (path, values) in group {
                let mut next = Vec::with_capacity(rows.len() * values.len());
                for row in &rows {
                    for v in values {
                        let mut row = row.clone();
                        row.insert(path.clone(), v.clone());
                        next.push(row);
                    }
                }
                rows = next;
            }
            out.extend(rows.into_iter().filter(|r| !r.is_empty()));
        }
        out
    }

    /// Every value for `path`, independent or grouped.
    pub fn all_values(&self, path: &str) -> Vec<Value> {
        let mut out: Vec<Value> = self.values.get(path).cloned().unwrap_or_default();
        for group in &self.grouped {
            if let Some(values) = group.get(path) {
                for v in values {
                    if !out.contains(v) {
                        out.push(v.clone());
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_grouped_rows_keep_pairs() {
        let mut input = NodeInput::default();
        for (country, zip) in [("US", "94105"), ("CA", "90001")] {
            let mut group = BTreeMap::new();
            group.insert("country".to_owned(), vec![json!(country)]);
            group.insert("zip".to_owned(), vec![json!(zip)]);
            input.grouped.push(group);
        }
        let rows = input.grouped_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["country"], json!("US"));
        assert_eq!(rows[0]["zip"], json!("94105"));
        assert_eq!(rows[1]["country"], json!("CA"));
        assert_eq!(rows[1]["zip"], json!("90001"));
    }

    #[test]
    fn test_extend_dedups() {
        let mut input = NodeInput::default();
        input.extend("id", [json!(1), json!(2)]);
        input.extend("id", [json!(2), json!(3)]);
        assert_eq!(input.values["id"], vec![json!(1), json!(2), json!(3)]);
        assert_eq!(input.all_values("id").len(), 3);
        assert!(!input.is_empty());
    }
}
