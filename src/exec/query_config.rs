use std::collections::BTreeMap;

use serde_json::Value;

use graph::{CollectionAddress, FieldPath};

use crate::policy::Policy;

use super::{ExecutionNode, QueryConfig};

/// Renders a select over one collection, matching rows on any query path.
pub struct FilterQueryConfig {
    address: CollectionAddress,
    select: Vec<String>,
    query_paths: Vec<FieldPath>,
}

impl FilterQueryConfig {
    pub fn new(node: &ExecutionNode) -> Self {
        Self {
            address: node.address.clone(),
            select: node.collection.fields.iter().map(|f| f.name.clone()).collect(),
            query_paths: node.query_field_paths().into_iter().collect(),
        }
    }

    fn render(&self, clauses: &[String]) -> Option<String> {
        if clauses.is_empty() {
            return None;
        }
        let select = if self.select.is_empty() {
            "*".to_owned()
        } else {
            self.select.join(", ")
        };
        Some(format!(
            "SELECT {select} FROM {}.{} WHERE {}",
            self.address.dataset,
            self.address.collection,
            clauses.join(" OR ")
        ))
    }
}

impl QueryConfig for FilterQueryConfig {
    fn generate_query(
        &self,
        values: &BTreeMap<String, Vec<Value>>,
        _policy: &Policy,
    ) -> Option<String> {
        let clauses: Vec<String> = self
            .query_paths
            .iter()
            .filter_map(|path| {
                let key = path.string_path();
                match values.get(&key).map(Vec::as_slice) {
                    None | Some([]) => None,
                    Some([one]) => Some(format!("{key} = {}", literal(one))),
                    Some(many) => {
                        let list: Vec<String> = many.iter().map(literal).collect();
                        Some(format!("{key} IN ({})", list.join(", ")))
                    }
                }
            })
            .collect();
        self.render(&clauses)
    }

    fn dry_run_query(&self) -> Option<String> {
        let clauses: Vec<String> = self
            .query_paths
            .iter()
            .map(|path| {
                let key = path.string_path();
                format!("{key} = :{}", key.replace('.', "_"))
            })
            .collect();
        self.render(&clauses)
    }
}

fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => other.to_string(),
    }
}
