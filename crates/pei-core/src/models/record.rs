use pei_proto::EntityType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A replicated entity plus its sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    pub entity_type: EntityType,
    pub id: String,
    /// Domain payload, always a JSON object
    pub payload: Value,
    /// False as soon as the record diverges from the last confirmed remote state
    pub is_synced: bool,
    /// Milliseconds since the Unix epoch of the last local write
    pub last_modified: i64,
    /// Tombstone awaiting remote deletion
    #[serde(default)]
    pub deleted: bool,
    /// Set when the record is the output of an automatic merge
    #[serde(default)]
    pub sync_conflict: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_note: Option<String>,
    /// Last `updated_at` acknowledged by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_updated_at: Option<i64>,
}

impl ReplicaRecord {
    /// A record freshly observed from the backend.
    pub fn from_remote(
        entity_type: EntityType,
        id: impl Into<String>,
        payload: Value,
        observed_at: i64,
        remote_updated_at: i64,
    ) -> Self {
        let (sync_conflict, conflict_note) = conflict_marker(&payload);
        Self {
            entity_type,
            id: id.into(),
            payload,
            is_synced: true,
            last_modified: observed_at,
            deleted: false,
            sync_conflict,
            conflict_note,
            remote_updated_at: Some(remote_updated_at),
        }
    }

    /// Deserialize the payload into one of the typed domain models.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Payload keys written by the resolver on automatic merges.
pub const SYNC_CONFLICT_KEY: &str = "sync_conflict";
pub const SYNC_CONFLICT_NOTE_KEY: &str = "sync_conflict_note";

/// Read the merge marker the resolver stamps into payloads.
pub fn conflict_marker(payload: &Value) -> (bool, Option<String>) {
    let flagged = payload
        .get(SYNC_CONFLICT_KEY)
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let note = payload
        .get(SYNC_CONFLICT_NOTE_KEY)
        .and_then(Value::as_str)
        .map(str::to_string);
    (flagged, if flagged { note } else { None })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_remote_is_synced() {
        let record = ReplicaRecord::from_remote(
            EntityType::Student,
            "s1",
            json!({"id": "s1", "name": "Ana"}),
            1_000,
            900,
        );
        assert!(record.is_synced);
        assert!(!record.sync_conflict);
        assert_eq!(record.remote_updated_at, Some(900));
    }

    #[test]
    fn test_from_remote_keeps_merge_marker() {
        let record = ReplicaRecord::from_remote(
            EntityType::Plan,
            "p1",
            json!({"id": "p1", "sync_conflict": true, "sync_conflict_note": "review"}),
            1_000,
            900,
        );
        assert!(record.sync_conflict);
        assert_eq!(record.conflict_note.as_deref(), Some("review"));
    }
}
