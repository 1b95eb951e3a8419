use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use graph::{Collection, FieldPath};

use crate::task::ActionType;

const DEFAULT_REWRITE: &str = "MASKED";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unknown masking strategy \"{0}\"")]
    UnknownStrategy(String),
    #[error("Erasure rule \"{0}\" has no masking strategy")]
    NoMaskingStrategy(String),
    #[error("Policy \"{0}\" has no rules")]
    NoRules(String),
}

/// Masking settings for an erasure rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskingSpec {
    pub strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub action_type: ActionType,
    /// data categories this rule targets; subcategories are included.
    #[serde(default)]
    pub data_categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masking: Option<MaskingSpec>,
}

/// Which actions a request performs, and on which data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub key: String,
    pub rules: Vec<Rule>,
}

impl Policy {
    /// Read a policy from a json file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading policy file {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("parsing policy file {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let policy: Policy = serde_json::from_str(text)?;
        policy.validate()?;
        Ok(policy)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.rules.is_empty() {
            return Err(Error::NoRules(self.key.clone()));
        }
        for rule in self.rules_for(ActionType::Erasure) {
            let spec = rule
                .masking
                .as_ref()
                .ok_or_else(|| Error::NoMaskingStrategy(rule.name.clone()))?;
            strategy_for(spec)?;
        }
        Ok(())
    }

    pub fn rules_for(&self, action: ActionType) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(move |r| r.action_type == action)
    }

    pub fn has_rule(&self, action: ActionType) -> bool {
        self.rules_for(action).next().is_some()
    }

    /// Stages this policy runs, in order. Erasure always needs an access stage first.
    pub fn stages(&self) -> Vec<ActionType> {
        ActionType::ORDER
            .into_iter()
            .filter(|action| match action {
                ActionType::Access => {
                    self.has_rule(ActionType::Access) || self.has_rule(ActionType::Erasure)
                }
                other => self.has_rule(*other),
            })
            .collect()
    }

    /// Every data category targeted by rules for `action`.
    pub fn categories(&self, action: ActionType) -> Vec<String> {
        self.rules_for(action)
            .flat_map(|r| r.data_categories.iter().cloned())
            .collect()
    }

    /// Fields of `collection` affected by `action`, in dotted form.
    pub fn fields_affected(&self, collection: &Collection, action: ActionType) -> Vec<String> {
        let categories = self.categories(action);
        collection
            .paths_for_categories(&categories)
            .iter()
            .map(FieldPath::string_path)
            .collect()
    }

    /// For each erasure rule, the paths in `collection` it targets and how to mask them.
    pub fn erasure_targets(
        &self,
        collection: &Collection,
    ) -> Result<Vec<(FieldPath, Box<dyn MaskingStrategy>)>, Error> {
        let mut out = Vec::new();
        for rule in self.rules_for(ActionType::Erasure) {
            let spec = rule
                .masking
                .as_ref()
                .ok_or_else(|| Error::NoMaskingStrategy(rule.name.clone()))?;
            for path in collection.paths_for_categories(&rule.data_categories) {
                out.push((path, strategy_for(spec)?));
            }
        }
        Ok(out)
    }
}

/// Replaces one value with a masked one.
pub trait MaskingStrategy: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, value: &Value) -> Value;
}

/// Replaces any value with null.
pub struct NullRewrite;

impl MaskingStrategy for NullRewrite {
    fn name(&self) -> &str {
        "null_rewrite"
    }

    fn apply(&self, _value: &Value) -> Value {
        Value::Null
    }
}

/// Replaces any non-null value with a fixed string.
pub struct StringRewrite {
    pub rewrite_value: String,
}

impl MaskingStrategy for StringRewrite {
    fn name(&self) -> &str {
        "string_rewrite"
    }

    fn apply(&self, value: &Value) -> Value {
        if value.is_null() {
            Value::Null
        } else {
            Value::String(self.rewrite_value.clone())
        }
    }
}

/// Build the masking strategy described by `spec`.
pub fn strategy_for(spec: &MaskingSpec) -> Result<Box<dyn MaskingStrategy>, Error> {
    match spec.strategy.as_str() {
        "null_rewrite" => Ok(Box::new(NullRewrite)),
        "string_rewrite" => Ok(Box::new(StringRewrite {
            rewrite_value: spec
                .rewrite_value
                .clone()
                .unwrap_or_else(|| DEFAULT_REWRITE.to_owned()),
        })),
        other => Err(Error::UnknownStrategy(other.to_owned())),
    }
}
