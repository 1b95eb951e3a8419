/// Turn a traversal into persisted task rows for each stage of a request.
mod task_builder;
pub use task_builder::TaskBuilder;

/// Check that every connector a graph uses is registered.
mod connector_checker;
pub use connector_checker::check_connectors;

/// Order erasures, including `erase_after` dependencies.
mod erasure_order;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Connector \"{0}\" is not configured (used by dataset {1})")]
    MissingConnector(String, String),
    #[error("erase_after dependencies form a cycle between {0}")]
    ErasureCycle(String),
}
