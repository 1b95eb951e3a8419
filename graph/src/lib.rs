//! Declarative description of the data a request has to visit.
//!
//! A [`Dataset`] groups the [`Collection`]s served by one connector.
//! Fields on a collection may be marked as identities (they seed a traversal)
//! or may reference fields on other collections; each reference becomes an
//! [`Edge`] in the [`DatasetGraph`] built over every enabled dataset.
//!
//! The [`refine`] mod contains the post-retrieval filter that trims array
//! elements out of records that matched a query for only some of their elements.

mod address;
pub use address::{CollectionAddress, FieldAddress, FieldPath};

mod data_type;
pub use data_type::DataType;

mod field;
pub use field::{EdgeDirection, Field, FieldReference};

mod collection;
pub use collection::Collection;

mod dataset;
pub use dataset::Dataset;

mod edge;
pub use edge::{Edge, EdgeKind};

mod dataset_graph;
pub use dataset_graph::{DatasetGraph, GraphNode};

mod error;
pub use error::{AggregatedErrors, Errors};

/// Filtering of retrieved records down to their matching array elements.
pub mod refine;

/// A single record, as returned by a connector.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// dataset and collection name of the synthetic vertex that holds the seed identity.
pub const ROOT_NAME: &str = "__ROOT__";
/// dataset and collection name of the synthetic vertex that closes a request's task graph.
pub const TERMINATOR_NAME: &str = "__TERMINATE__";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid collection address \"{0}\" (expected 'dataset:collection')")]
    InvalidCollectionAddress(String),
    #[error("Invalid field address \"{0}\" (expected 'dataset:collection:field.path')")]
    InvalidFieldAddress(String),
    #[error("Invalid field path \"{0}\"")]
    InvalidFieldPath(String),
    #[error("Field {field} references {target} more than once")]
    DuplicateReference { field: String, target: String },
    #[error("Collection {0} is defined more than once")]
    DuplicateCollection(String),
    #[error("Field {referenced_by} references collection {missing}, which does not exist")]
    MissingCollection {
        referenced_by: String,
        missing: String,
    },
    #[error("Field {referenced_by} references field {missing}, which does not exist")]
    MissingField {
        referenced_by: String,
        missing: String,
    },
    #[error("Collection {collection} must run after {missing}, which does not exist")]
    MissingDependency { collection: String, missing: String },
    #[error("Name \"{0}\" is reserved")]
    ReservedName(String),
    #[error("Unable to read dataset file {0}")]
    DatasetFile(String),
}
