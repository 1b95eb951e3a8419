use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, ROOT_NAME, TERMINATOR_NAME};

const ADDRESS_DELIM: char = ':';
const PATH_DELIM: char = '.';

/// Identifies one collection: `dataset:collection`.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionAddress {
    pub dataset: String,
    pub collection: String,
}

impl CollectionAddress {
    pub fn new(dataset: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            collection: collection.into(),
        }
    }

    /// Address of the synthetic vertex holding the seed identity.
    pub fn root() -> Self {
        Self::new(ROOT_NAME, ROOT_NAME)
    }

    /// Address of the synthetic vertex that completes once every leaf has completed.
    pub fn terminator() -> Self {
        Self::new(TERMINATOR_NAME, TERMINATOR_NAME)
    }

    pub fn is_root(&self) -> bool {
        self.dataset == ROOT_NAME && self.collection == ROOT_NAME
    }

    pub fn is_terminator(&self) -> bool {
        self.dataset == TERMINATOR_NAME && self.collection == TERMINATOR_NAME
    }

    /// Address of the field at `path` in this collection.
    pub fn field(&self, path: FieldPath) -> FieldAddress {
        FieldAddress {
            collection: self.clone(),
            path,
        }
    }
}

impl fmt::Display for CollectionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{ADDRESS_DELIM}{}", self.dataset, self.collection)
    }
}

impl FromStr for CollectionAddress {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(ADDRESS_DELIM) {
            Some((dataset, collection))
                if !dataset.is_empty()
                    && !collection.is_empty()
                    && !collection.contains(ADDRESS_DELIM) =>
            {
                Ok(Self::new(dataset, collection))
            }
            _ => Err(Error::InvalidCollectionAddress(s.to_owned())),
        }
    }
}

impl TryFrom<String> for CollectionAddress {
    type Error = Error;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CollectionAddress> for String {
    fn from(addr: CollectionAddress) -> String {
        addr.to_string()
    }
}

/// Dotted path into a possibly-nested record, e.g. `address.city`.
#[derive(Debug, Clone, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    levels: Vec<String>,
}

impl FieldPath {
    pub fn new<I, S>(levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            levels: levels.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a dotted path. Empty levels are rejected.
    pub fn parse(s: &str) -> Result<Self, Error> {
        if s.is_empty() || s.split(PATH_DELIM).any(str::is_empty) {
            return Err(Error::InvalidFieldPath(s.to_owned()));
        }
        Ok(Self::new(s.split(PATH_DELIM)))
    }

    #[inline]
    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    /// Dotted string form of this path.
    pub fn string_path(&self) -> String {
        self.levels.join(".")
    }

    /// A new path with `level` appended.
    pub fn child(&self, level: &str) -> Self {
        let mut levels = self.levels.clone();
        levels.push(level.to_owned());
        Self { levels }
    }

    /// The first level of this path, if any.
    pub fn first(&self) -> Option<&str> {
        self.levels.first().map(String::as_str)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.string_path())
    }
}

impl TryFrom<String> for FieldPath {
    type Error = Error;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> String {
        path.string_path()
    }
}

/// Identifies one field: `dataset:collection:field.path`.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldAddress {
    pub collection: CollectionAddress,
    pub path: FieldPath,
}

impl FieldAddress {
    pub fn new(dataset: &str, collection: &str, path: FieldPath) -> Self {
        CollectionAddress::new(dataset, collection).field(path)
    }

    #[inline]
    pub fn collection_address(&self) -> &CollectionAddress {
        &self.collection
    }
}

impl fmt::Display for FieldAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{ADDRESS_DELIM}{}", self.collection, self.path)
    }
}

impl FromStr for FieldAddress {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ADDRESS_DELIM);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(dataset), Some(collection), Some(path))
                if !dataset.is_empty() && !collection.is_empty() =>
            {
                let path =
                    FieldPath::parse(path).map_err(|_| Error::InvalidFieldAddress(s.to_owned()))?;
                Ok(Self::new(dataset, collection, path))
            }
            _ => Err(Error::InvalidFieldAddress(s.to_owned())),
        }
    }
}

impl TryFrom<String> for FieldAddress {
    type Error = Error;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<FieldAddress> for String {
    fn from(addr: FieldAddress) -> String {
        addr.to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_addresses() -> anyhow::Result<()> {
        let addr: CollectionAddress = "postgres:customer".parse()?;
        assert_eq!(addr, CollectionAddress::new("postgres", "customer"));
        assert_eq!(addr.to_string(), "postgres:customer");

        let field: FieldAddress = "postgres:customer:address.city".parse()?;
        assert_eq!(field.collection, addr);
        assert_eq!(field.path.levels(), ["address", "city"]);
        assert_eq!(field.to_string(), "postgres:customer:address.city");
        Ok(())
    }

    #[test]
    fn test_reject_bad_addresses() {
        assert!("postgres".parse::<CollectionAddress>().is_err());
        assert!("postgres:".parse::<CollectionAddress>().is_err());
        assert!("a:b:c".parse::<CollectionAddress>().is_err());
        assert!("a:b".parse::<FieldAddress>().is_err());
        assert!("a:b:x..y".parse::<FieldAddress>().is_err());
    }

    #[test]
    fn test_serde_as_strings() -> anyhow::Result<()> {
        let field = FieldAddress::new("mongo", "orders", FieldPath::new(["items", "sku"]));
        let json = serde_json::to_string(&field)?;
        assert_eq!(json, "\"mongo:orders:items.sku\"");
        let back: FieldAddress = serde_json::from_str(&json)?;
        assert_eq!(back, field);
        Ok(())
    }

    #[test]
    fn test_root_sorts_and_identifies() {
        let root = CollectionAddress::root();
        assert!(root.is_root());
        assert!(!root.is_terminator());
        assert!(CollectionAddress::terminator().is_terminator());
    }
}
