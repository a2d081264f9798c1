//! Conflict resolution between a pending local change and a newer remote version.
//!
//! Simple entities use last-writer-wins on timestamps. Education plans are
//! merged section by section so that neither side's work is silently lost;
//! the merged result is flagged for review.

use crate::models::{PlanDocument, Section, SYNC_CONFLICT_KEY, SYNC_CONFLICT_NOTE_KEY};
use pei_proto::{EntityType, RemoteRecord};
use serde::Serialize;
use serde_json::Value;

pub const CONFLICT_NOTE: &str =
    "Local and remote edits were merged automatically; review the plan sections.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Strategy {
    LocalWins,
    RemoteWins,
    Merged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictDescriptor {
    pub local_version: Value,
    pub remote_version: Value,
    pub resolved_version: Value,
    pub strategy: Strategy,
}

/// Decide the payload that both sides should converge on.
pub fn resolve(
    entity_type: EntityType,
    local: &Value,
    local_modified: i64,
    remote: &RemoteRecord,
) -> ConflictDescriptor {
    if entity_type.is_composite() {
        if let Some(merged) = merge_plan(local, &remote.payload) {
            return ConflictDescriptor {
                local_version: local.clone(),
                remote_version: remote.payload.clone(),
                resolved_version: merged,
                strategy: Strategy::Merged,
            };
        }
    }
    last_writer_wins(local, local_modified, remote)
}

fn last_writer_wins(local: &Value, local_modified: i64, remote: &RemoteRecord) -> ConflictDescriptor {
    // Ties go to the backend.
    let (strategy, resolved) = if local_modified > remote.updated_at {
        (Strategy::LocalWins, local.clone())
    } else {
        (Strategy::RemoteWins, remote.payload.clone())
    };
    ConflictDescriptor {
        local_version: local.clone(),
        remote_version: remote.payload.clone(),
        resolved_version: resolved,
        strategy,
    }
}

/// Lay a local plan snapshot over an already merged version, keeping every
/// key the merge carried.
pub(crate) fn rebase_plan(local: &Value, merged: &Value) -> Value {
    merge_plan(local, merged).unwrap_or_else(|| local.clone())
}

/// Start from the remote plan, overlay local section keys and add local-only
/// top-level fields. A section that is not an object on the local side
/// replaces the remote one. None when either payload is not an object.
fn merge_plan(local: &Value, remote: &Value) -> Option<Value> {
    let local = PlanDocument::from_payload(local)?;
    let mut merged = PlanDocument::from_payload(remote)?;

    for (target, ours) in merged.sections_mut().into_iter().zip(local.sections()) {
        *target = merge_section(target.take(), ours.as_ref());
    }
    for (index, key) in PlanDocument::SECTIONS.into_iter().enumerate() {
        if let Some(opaque) = local.extra.get(key) {
            *merged.sections_mut()[index] = None;
            merged.extra.insert(key.to_string(), opaque.clone());
        } else if merged.sections()[index].is_some() {
            merged.extra.remove(key);
        }
    }
    for (key, value) in &local.extra {
        if !merged.extra.contains_key(key) {
            merged.extra.insert(key.clone(), value.clone());
        }
    }
    merged
        .extra
        .insert(SYNC_CONFLICT_KEY.to_string(), Value::Bool(true));
    merged.extra.insert(
        SYNC_CONFLICT_NOTE_KEY.to_string(),
        Value::String(CONFLICT_NOTE.to_string()),
    );
    Some(merged.into_payload())
}

fn merge_section(theirs: Option<Section>, ours: Option<&Section>) -> Option<Section> {
    match (theirs, ours) {
        (None, None) => None,
        (Some(theirs), None) => Some(theirs),
        (theirs, Some(ours)) => {
            let mut section = theirs.unwrap_or_default();
            for (key, value) in ours {
                section.insert(key.clone(), value.clone());
            }
            Some(section)
        }
    }
}
