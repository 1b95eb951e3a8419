use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{Collection, CollectionAddress, Error};

/// A named group of collections served by one connector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    /// Key of the connector that serves this dataset. Defaults to the dataset name.
    #[serde(default)]
    pub connector_key: String,
    /// Datasets whose collections must all complete before any of ours start.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
    pub collections: Vec<Collection>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, collections: Vec<Collection>) -> Self {
        let name = name.into();
        Self {
            connector_key: name.clone(),
            name,
            after: Vec::new(),
            collections,
        }
    }

    pub fn connector(mut self, key: impl Into<String>) -> Self {
        self.connector_key = key.into();
        self
    }

    /// Require every collection in `dataset` to complete before ours start.
    pub fn after(mut self, dataset: impl Into<String>) -> Self {
        self.after.push(dataset.into());
        self
    }

    /// Read a dataset definition from a json file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| Error::DatasetFile(path.display().to_string()))?;
        Self::from_json(&text).with_context(|| format!("parsing dataset file {}", path.display()))
    }

    /// Parse a dataset definition from json text.
    pub fn from_json(text: &str) -> Result<Self> {
        let mut dataset: Dataset = serde_json::from_str(text)?;
        if dataset.connector_key.is_empty() {
            dataset.connector_key = dataset.name.clone();
        }
        Ok(dataset)
    }

    /// Address of each collection in this dataset, in declaration order.
    pub fn addresses(&self) -> impl Iterator<Item = CollectionAddress> + '_ {
        self.collections
            .iter()
            .map(|c| CollectionAddress::new(self.name.as_str(), c.name.as_str()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_connector_key_defaults_to_name() -> anyhow::Result<()> {
        let ds = Dataset::from_json(
            r#"{"name": "postgres", "collections": [{"name": "customer", "fields": [{"name": "id"}]}]}"#,
        )?;
        assert_eq!(ds.connector_key, "postgres");
        let addrs: Vec<_> = ds.addresses().collect();
        assert_eq!(addrs, vec![CollectionAddress::new("postgres", "customer")]);
        Ok(())
    }

    #[test]
    fn test_load_missing_file() {
        let e = Dataset::load(Path::new("/nonexistent/dataset.json")).unwrap_err();
        assert!(e.to_string().contains("Unable to read dataset file"));
    }
}
