use graph::{AggregatedErrors, DatasetGraph, Errors};

use crate::exec::ConnectorRegistry;

use super::Error;

/// Ok if every dataset's connector is registered. Otherwise names every
/// missing connector at once.
pub fn check_connectors(
    graph: &DatasetGraph,
    connectors: &ConnectorRegistry,
) -> Result<(), AggregatedErrors> {
    let mut errors = Errors::default();
    for (dataset, key) in graph.dataset_connectors() {
        if connectors.contains(key) {
            log::trace!("dataset {dataset} uses connector {key}");
        } else {
            errors.add(Error::MissingConnector(key.clone(), dataset.clone()));
        }
    }
    errors.into_result("checking connectors")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::exec::MemoryConnector;
    use graph::{Collection, DataType, Dataset, Field};
    use std::sync::Arc;

    #[test]
    fn test_missing_connectors_are_named() -> anyhow::Result<()> {
        let datasets = vec![
            Dataset::new(
                "postgres",
                vec![Collection::new(
                    "customer",
                    vec![Field::new("email", DataType::String).identity("email")],
                )],
            ),
            Dataset::new(
                "mongo",
                vec![Collection::new(
                    "profile",
                    vec![Field::new("email", DataType::String).identity("email")],
                )],
            )
            .connector("mongo_prod"),
        ];
        let graph = DatasetGraph::new(datasets)?;

        let mut connectors = ConnectorRegistry::default();
        connectors.register(Arc::new(MemoryConnector::new("postgres")));
        let err = check_connectors(&graph, &connectors).unwrap_err();
        assert_eq!(err.messages.len(), 1);
        assert!(err.messages[0].contains("mongo_prod"));

        connectors.register(Arc::new(MemoryConnector::new("mongo_prod")));
        assert!(check_connectors(&graph, &connectors).is_ok());
        Ok(())
    }
}
