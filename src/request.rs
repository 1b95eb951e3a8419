use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use graph::CollectionAddress;

use crate::task::ActionType;

/// Identity values keyed by identity name (e.g. "email").
pub type Identity = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    InProcessing,
    Paused,
    AwaitingProcessing,
    Complete,
    Error,
    Canceled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProcessing => "in_processing",
            Self::Paused => "paused",
            Self::AwaitingProcessing => "awaiting_processing",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The stage and collection a failed request should be resumed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDetails {
    pub step: ActionType,
    pub collection: CollectionAddress,
}

/// Status of propagating one consent preference to one connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentPropagation {
    Pending,
    Complete,
    Skipped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentPreference {
    pub data_use: String,
    pub opt_in: bool,
    /// connector key mapped to propagation status.
    #[serde(default)]
    pub affected_systems: BTreeMap<String, ConsentPropagation>,
}

/// One data-subject request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyRequest {
    pub id: Uuid,
    pub status: RequestStatus,
    pub policy_key: String,
    pub identity: Identity,
    #[serde(default)]
    pub consent_preferences: Vec<ConsentPreference>,
    #[serde(default)]
    pub failed_checkpoint: Option<CheckpointDetails>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PrivacyRequest {
    pub fn new(policy_key: impl Into<String>, identity: Identity) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: RequestStatus::Pending,
            policy_key: policy_key.into(),
            identity,
            consent_preferences: Vec::new(),
            failed_checkpoint: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn with_consent(mut self, prefs: Vec<ConsentPreference>) -> Self {
        self.consent_preferences = prefs;
        self
    }

    /// Names of the identities that actually carry a value.
    pub fn seed_identities(&self) -> Vec<String> {
        self.identity
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn set_status(&mut self, status: RequestStatus) {
        log::debug!("Request {} status: {} -> {status}", self.id, self.status);
        self.status = status;
        self.updated_at = Utc::now();
        if matches!(
            status,
            RequestStatus::Complete | RequestStatus::Error | RequestStatus::Canceled
        ) {
            self.finished_at = Some(self.updated_at);
        } else {
            self.finished_at = None;
        }
    }

    /// Register `connector_key` as a target of every consent preference.
    pub fn add_consent_target(&mut self, connector_key: &str) {
        for pref in &mut self.consent_preferences {
            pref.affected_systems
                .entry(connector_key.to_owned())
                .or_insert(ConsentPropagation::Pending);
        }
    }

    /// Record the result of propagating consent to `connector_key`.
    pub fn set_consent_status(&mut self, connector_key: &str, status: ConsentPropagation) {
        for pref in &mut self.consent_preferences {
            pref.affected_systems.insert(connector_key.to_owned(), status);
        }
    }

    /// Mark every still-pending propagation to `connector_key` as failed.
    pub fn fail_pending_consent(&mut self, connector_key: &str) {
        for pref in &mut self.consent_preferences {
            if let Some(status) = pref.affected_systems.get_mut(connector_key) {
                if *status == ConsentPropagation::Pending {
                    *status = ConsentPropagation::Error;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn request() -> PrivacyRequest {
        let mut identity = Identity::new();
        identity.insert("email".to_owned(), json!("jane@example.com"));
        identity.insert("phone_number".to_owned(), Value::Null);
        PrivacyRequest::new("default", identity).with_consent(vec![ConsentPreference {
            data_use: "marketing".to_owned(),
            opt_in: false,
            affected_systems: BTreeMap::new(),
        }])
    }

    #[test]
    fn test_null_identities_are_not_seeds() {
        let r = request();
        assert_eq!(r.seed_identities(), vec!["email".to_owned()]);
    }

    #[test]
    fn test_fail_pending_consent_only() {
        let mut r = request();
        r.add_consent_target("mailer");
        r.add_consent_target("crm");
        r.set_consent_status("crm", ConsentPropagation::Complete);
        r.fail_pending_consent("mailer");
        r.fail_pending_consent("crm");
        let systems = &r.consent_preferences[0].affected_systems;
        assert_eq!(systems["mailer"], ConsentPropagation::Error);
        assert_eq!(systems["crm"], ConsentPropagation::Complete);
    }

    #[test]
    fn test_finished_at() {
        let mut r = request();
        r.set_status(RequestStatus::Error);
        assert!(r.finished_at.is_some());
        r.set_status(RequestStatus::InProcessing);
        assert!(r.finished_at.is_none());
    }
}
