use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::patch::PatchOperation;

/// Fields a patch is never allowed to change on a stored aggregate.
pub const IMMUTABLE_FIELDS: &[&str] = &["id", "ownerId", "createdAt", "version"];

/// Keys serialized by the typed part of [`Project`]. Domain fields may not
/// reuse them in any letter case.
pub const RESERVED_FIELDS: &[&str] = &[
    "id",
    "name",
    "description",
    "ownerId",
    "version",
    "createdAt",
    "updatedAt",
];

/// The reserved key `key` collides with, ignoring case.
pub fn reserved_field(key: &str) -> Option<&'static str> {
    RESERVED_FIELDS
        .iter()
        .copied()
        .find(|field| field.eq_ignore_ascii_case(key))
}

/// An aggregate the document store can persist.
pub trait VersionedAggregate: Serialize + DeserializeOwned + Send + Sync {
    fn aggregate_id(&self) -> &str;
    fn owner_id(&self) -> &str;
    fn version(&self) -> u32;
    fn set_version(&mut self, version: u32);
    fn touch(&mut self, at: DateTime<Utc>);
    /// The plaintext listing entry written next to each snapshot.
    fn metadata(&self) -> AggregateMetadata;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub owner_id: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Domain data owned by downstream consumers; stored without interpretation.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Project {
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            owner_id: owner_id.into(),
            version: 1,
            created_at: now,
            updated_at: now,
            fields: Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl VersionedAggregate for Project {
    fn aggregate_id(&self) -> &str {
        &self.id
    }

    fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn metadata(&self) -> AggregateMetadata {
        AggregateMetadata {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            owner_id: self.owner_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateMetadata {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub owner_id: String,
}

/// One committed change set. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchEvent {
    pub change_set_id: Uuid,
    pub aggregate_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub base_version: u32,
    pub result_version: u32,
    pub operations: Vec<PatchOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Set on events produced by undoing an earlier change set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverts: Option<Uuid>,
}

impl PatchEvent {
    pub fn new(
        aggregate_id: impl Into<String>,
        user_id: impl Into<String>,
        base_version: u32,
        operations: Vec<PatchOperation>,
    ) -> Self {
        Self {
            change_set_id: Uuid::new_v4(),
            aggregate_id: aggregate_id.into(),
            user_id: user_id.into(),
            timestamp: Utc::now(),
            base_version,
            result_version: base_version.saturating_add(1),
            operations,
            description: None,
            reverts: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}
