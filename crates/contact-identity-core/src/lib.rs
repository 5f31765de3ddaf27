use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;

pub mod matcher;
pub mod memory;
pub mod resolver;
pub mod store;

pub use matcher::{match_primary_ids, primary_ids_of};
pub use memory::{MemoryContactStore, MemoryContactTx};
pub use resolver::{
    identify, project_cluster, resolve, select_survivor, IdentifyPolicy, Resolution,
    ResolutionOutcome,
};
pub use store::{ContactStore, ContactTx, StoreError};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IdentityError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(StoreError),
    #[error("inconsistent cluster: {0}")]
    Inconsistent(String),
}

impl IdentityError {
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(err) if err.is_retryable())
    }
}

impl From<StoreError> for IdentityError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Corrupt(message) => Self::Inconsistent(message),
            other => Self::Storage(other),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ContactId(pub i64);

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a record inside its cluster.
///
/// A secondary always carries the id of its cluster primary; a primary never
/// carries a link.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "link_precedence", rename_all = "snake_case")]
pub enum LinkPrecedence {
    Primary,
    Secondary { linked_id: ContactId },
}

impl LinkPrecedence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary { .. } => "secondary",
        }
    }

    #[must_use]
    pub fn linked_id(self) -> Option<ContactId> {
        match self {
            Self::Primary => None,
            Self::Secondary { linked_id } => Some(linked_id),
        }
    }

    /// Rebuild a precedence from its stored column pair.
    ///
    /// Returns `None` when the pair is not one of the two legal shapes.
    #[must_use]
    pub fn from_columns(value: &str, linked_id: Option<ContactId>) -> Option<Self> {
        match (value, linked_id) {
            ("primary", None) => Some(Self::Primary),
            ("secondary", Some(linked_id)) => Some(Self::Secondary { linked_id }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContactRecord {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    #[serde(flatten)]
    pub precedence: LinkPrecedence,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl ContactRecord {
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.precedence == LinkPrecedence::Primary
    }

    /// Id of the primary this record resolves to.
    #[must_use]
    pub fn cluster_id(&self) -> ContactId {
        self.precedence.linked_id().unwrap_or(self.id)
    }

    /// Ordering key for seniority: oldest `created_at` first, lowest id on ties.
    #[must_use]
    pub fn seniority(&self) -> (OffsetDateTime, ContactId) {
        (self.created_at, self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub precedence: LinkPrecedence,
}

impl NewContact {
    #[must_use]
    pub fn primary(observation: &Observation) -> Self {
        Self {
            email: observation.email.clone(),
            phone_number: observation.phone_number.clone(),
            precedence: LinkPrecedence::Primary,
        }
    }

    #[must_use]
    pub fn secondary(observation: &Observation, linked_id: ContactId) -> Self {
        Self {
            email: observation.email.clone(),
            phone_number: observation.phone_number.clone(),
            precedence: LinkPrecedence::Secondary { linked_id },
        }
    }
}

/// Raw `identify` input as received at the request boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "deserialize_phone_number")]
    pub phone_number: Option<String>,
}

impl IdentifyRequest {
    #[must_use]
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Self {
        Self { email: email.map(str::to_string), phone_number: phone_number.map(str::to_string) }
    }

    /// Normalize the request into an observation with at least one attribute.
    ///
    /// # Errors
    /// Returns [`IdentityError::Validation`] when neither email nor phone number
    /// carries a non-blank value.
    pub fn validate(&self) -> Result<Observation, IdentityError> {
        let email = normalize_attribute(self.email.as_deref());
        let phone_number = normalize_attribute(self.phone_number.as_deref());

        if email.is_none() && phone_number.is_none() {
            return Err(IdentityError::Validation(
                "email or phoneNumber MUST be provided".to_string(),
            ));
        }

        Ok(Observation { email, phone_number })
    }
}

fn normalize_attribute(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|trimmed| !trimmed.is_empty()).map(str::to_string)
}

fn deserialize_phone_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PhoneValue {
        Text(String),
        Number(u64),
        Other(serde::de::IgnoredAny),
    }

    match Option::<PhoneValue>::deserialize(deserializer)? {
        None => Ok(None),
        Some(PhoneValue::Text(text)) => Ok(Some(text)),
        Some(PhoneValue::Number(number)) => Ok(Some(number.to_string())),
        Some(PhoneValue::Other(_)) => Err(serde::de::Error::custom(
            "phoneNumber must be a string or a non-negative integer",
        )),
    }
}

/// A validated observation: at least one of the two attributes is present.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Observation {
    email: Option<String>,
    phone_number: Option<String>,
}

impl Observation {
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterView {
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdentifyResponse {
    pub contact: ClusterView,
}

impl From<ClusterView> for IdentifyResponse {
    fn from(contact: ClusterView) -> Self {
        Self { contact }
    }
}
