use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{CollectionAddress, Error, Field, FieldPath, FieldReference};

/// One logical table, document type or API resource within a dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    pub fields: Vec<Field>,
    /// Collections that must complete before this one starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<CollectionAddress>,
    /// Collections whose erasure must complete before this one is erased.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub erase_after: Vec<CollectionAddress>,
    /// Field paths whose incoming values must stay correlated row by row.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub grouped_inputs: BTreeSet<String>,
    /// If set, this collection is never queried or masked.
    #[serde(default)]
    pub skip_processing: bool,
}

impl Collection {
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            name: name.into(),
            fields,
            ..Default::default()
        }
    }

    /// Require `addr` to complete before this collection runs.
    pub fn after(mut self, addr: CollectionAddress) -> Self {
        self.after.push(addr);
        self
    }

    /// Require `addr` to be erased before this collection is erased.
    pub fn erase_after(mut self, addr: CollectionAddress) -> Self {
        self.erase_after.push(addr);
        self
    }

    /// Mark `paths` as a correlated input group.
    pub fn grouped(mut self, paths: &[&str]) -> Self {
        self.grouped_inputs = paths.iter().map(|p| (*p).to_owned()).collect();
        self
    }

    /// Look up a (possibly nested) field. Returns `None` if any level is missing.
    pub fn field(&self, path: &FieldPath) -> Option<&Field> {
        let (first, rest) = path.levels().split_first()?;
        let mut field = self.fields.iter().find(|f| &f.name == first)?;
        for level in rest {
            field = field.sub_field(level)?;
        }
        Some(field)
    }

    /// Every field in this collection, including nested ones, depth-first.
    pub fn field_paths(&self) -> Vec<(FieldPath, &Field)> {
        let mut out = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            collect_paths(field, FieldPath::default(), &mut out);
        }
        out
    }

    /// Field paths that are seeded by an identity, mapped to the identity name.
    pub fn identities(&self) -> BTreeMap<FieldPath, String> {
        self.field_paths()
            .into_iter()
            .filter_map(|(path, f)| f.identity.clone().map(|id| (path, id)))
            .collect()
    }

    /// Field paths that reference other fields, mapped to those references.
    pub fn references(&self) -> BTreeMap<FieldPath, Vec<FieldReference>> {
        self.field_paths()
            .into_iter()
            .filter(|(_, f)| !f.references.is_empty())
            .map(|(path, f)| (path, f.references.clone()))
            .collect()
    }

    pub fn primary_key_paths(&self) -> Vec<FieldPath> {
        self.field_paths()
            .into_iter()
            .filter(|(_, f)| f.primary_key)
            .map(|(path, _)| path)
            .collect()
    }

    /// Leaf field paths whose data categories fall under `targets`.
    pub fn paths_for_categories(&self, targets: &[String]) -> Vec<FieldPath> {
        self.field_paths()
            .into_iter()
            .filter(|(_, f)| f.fields.is_empty() && f.matches_categories(targets))
            .map(|(path, _)| path)
            .collect()
    }

    /// True if the field at `path` is part of the correlated input group.
    pub fn is_grouped(&self, path: &FieldPath) -> bool {
        self.grouped_inputs.contains(&path.string_path())
    }

    /// Check that no field references the same target twice.
    pub fn validate(&self, addr: &CollectionAddress) -> Result<(), Error> {
        for (path, refs) in self.references() {
            let mut seen = BTreeSet::new();
            for r in refs {
                if !seen.insert(r.field.clone()) {
                    return Err(Error::DuplicateReference {
                        field: addr.field(path).to_string(),
                        target: r.field.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn collect_paths<'a>(field: &'a Field, prefix: FieldPath, out: &mut Vec<(FieldPath, &'a Field)>) {
    let path = prefix.child(&field.name);
    for sub in &field.fields {
        collect_paths(sub, path.clone(), out);
    }
    out.push((path, field));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{DataType, EdgeDirection, FieldAddress};

    fn customer() -> Collection {
        Collection::new(
            "customer",
            vec![
                Field::new("id", DataType::Integer).primary_key(),
                Field::new("email", DataType::String)
                    .identity("email")
                    .categories(&["user.contact.email"]),
                Field::new("address", DataType::Object).with_fields(vec![
                    Field::new("city", DataType::String).categories(&["user.contact.address"]),
                    Field::new("zip", DataType::String).reference(
                        "db:zips:code".parse().unwrap(),
                        Some(EdgeDirection::To),
                    ),
                ]),
            ],
        )
    }

    #[test]
    fn test_nested_lookup() {
        let c = customer();
        let city = c.field(&FieldPath::new(["address", "city"]));
        assert_eq!(city.map(|f| f.name.as_str()), Some("city"));
        assert!(c.field(&FieldPath::new(["address", "country"])).is_none());
        assert!(c.field(&FieldPath::new(["email", "x"])).is_none());
    }

    #[test]
    fn test_derived_maps() {
        let c = customer();
        let ids = c.identities();
        assert_eq!(ids.get(&FieldPath::new(["email"])).map(String::as_str), Some("email"));
        let refs = c.references();
        let zip_refs = &refs[&FieldPath::new(["address", "zip"])];
        assert_eq!(zip_refs[0].field.to_string(), "db:zips:code");
        assert_eq!(c.primary_key_paths(), vec![FieldPath::new(["id"])]);
        let contact = c.paths_for_categories(&["user.contact".to_owned()]);
        assert_eq!(
            contact,
            vec![FieldPath::new(["email"]), FieldPath::new(["address", "city"])]
        );
    }

    #[test]
    fn test_duplicate_reference_rejected() {
        let target: FieldAddress = "db:orders:customer_id".parse().unwrap();
        let c = Collection::new(
            "customer",
            vec![Field::new("id", DataType::Integer)
                .reference(target.clone(), Some(EdgeDirection::To))
                .reference(target, Some(EdgeDirection::From))],
        );
        let addr = CollectionAddress::new("db", "customer");
        assert!(matches!(
            c.validate(&addr),
            Err(Error::DuplicateReference { .. })
        ));
    }
}
