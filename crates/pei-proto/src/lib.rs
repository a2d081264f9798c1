use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Entity types replicated between the client and the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Student,
    Plan,
    Goal,
    Barrier,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Student,
        EntityType::Plan,
        EntityType::Goal,
        EntityType::Barrier,
    ];

    /// Table (and REST collection) name for this entity type.
    pub fn table(self) -> &'static str {
        match self {
            EntityType::Student => "students",
            EntityType::Plan => "peis",
            EntityType::Goal => "pei_goals",
            EntityType::Barrier => "pei_barriers",
        }
    }

    pub fn from_table(value: &str) -> Option<Self> {
        match value {
            "students" => Some(EntityType::Student),
            "peis" => Some(EntityType::Plan),
            "pei_goals" => Some(EntityType::Goal),
            "pei_barriers" => Some(EntityType::Barrier),
            _ => None,
        }
    }

    /// Composite documents are merged section by section instead of last-writer-wins.
    pub fn is_composite(self) -> bool {
        matches!(self, EntityType::Plan)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Current remote version of a single entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub payload: Value,
    /// Milliseconds since the Unix epoch.
    pub updated_at: i64,
}

/// Acknowledgement returned by an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertAck {
    pub updated_at: i64,
}

/// One entry of a `changes_since` page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub id: String,
    #[serde(default)]
    pub payload: Value,
    pub updated_at: i64,
    /// Set when the backend reports the entity as deleted.
    #[serde(default)]
    pub deleted: bool,
}
