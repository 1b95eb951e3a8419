use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{DataType, FieldAddress};

/// Which side of a reference has to be resolved first.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeDirection {
    /// data flows from the referenced field into this one.
    From,
    /// data flows from this field into the referenced one.
    To,
}

/// A reference from one field to a field on another collection.
/// A reference without a direction can be resolved from either side.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldReference {
    pub field: FieldAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<EdgeDirection>,
}

/// One field of a collection, possibly containing nested fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(default)]
    pub data_type: DataType,
    /// Name of the identity that seeds traversal through this field (e.g. "email").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<FieldReference>,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub is_array: bool,
    /// If set, retrieved arrays under this field are never trimmed to matching elements.
    #[serde(default)]
    pub return_all_elements: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_categories: Vec<String>,
    /// Sub-fields of an object field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Field>,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            ..Default::default()
        }
    }

    /// Coerce `value` to this field's type.
    #[inline]
    pub fn cast(&self, value: &Value) -> Option<Value> {
        self.data_type.cast(value)
    }

    /// Mark this field as seeded by the identity `name`.
    pub fn identity(mut self, name: impl Into<String>) -> Self {
        self.identity = Some(name.into());
        self
    }

    /// Add a reference to `field`.
    pub fn reference(mut self, field: FieldAddress, direction: Option<EdgeDirection>) -> Self {
        self.references.push(FieldReference { field, direction });
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn array(mut self) -> Self {
        self.is_array = true;
        self
    }

    pub fn return_all_elements(mut self) -> Self {
        self.return_all_elements = true;
        self
    }

    pub fn categories(mut self, categories: &[&str]) -> Self {
        self.data_categories = categories.iter().map(|c| (*c).to_owned()).collect();
        self
    }

    /// Turn this field into an object field containing `fields`.
    pub fn with_fields(mut self, fields: Vec<Field>) -> Self {
        self.data_type = DataType::Object;
        self.fields = fields;
        self
    }

    /// Find the direct sub-field called `name`.
    pub fn sub_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// True if any of this field's categories falls under one of `targets`
    /// (categories are dotted, so "user.contact" covers "user.contact.email").
    pub fn matches_categories(&self, targets: &[String]) -> bool {
        self.data_categories.iter().any(|category| {
            targets.iter().any(|target| {
                category == target
                    || (category.starts_with(target.as_str())
                        && category[target.len()..].starts_with('.'))
            })
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_category_hierarchy() {
        let field = Field::new("email", DataType::String).categories(&["user.contact.email"]);
        assert!(field.matches_categories(&["user.contact".to_owned()]));
        assert!(field.matches_categories(&["user.contact.email".to_owned()]));
        assert!(!field.matches_categories(&["user.cont".to_owned()]));
        assert!(!field.matches_categories(&["system".to_owned()]));
    }

    #[test]
    fn test_deserialize_minimal_field() -> anyhow::Result<()> {
        let field: Field = serde_json::from_str(
            r#"{"name": "id", "references": [{"field": "db:orders:customer_id", "direction": "to"}]}"#,
        )?;
        assert_eq!(field.data_type, DataType::Unknown);
        assert_eq!(field.references[0].direction, Some(EdgeDirection::To));
        Ok(())
    }
}
