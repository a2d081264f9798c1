//! Typed payloads of the replicated education entities.
//!
//! Unknown fields are kept in a flattened `extra` map so that a client running
//! an older schema never strips columns added on the backend.

use pei_proto::EntityType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ties a payload type to the table it is replicated in.
pub trait Syncable: Serialize + serde::de::DeserializeOwned {
    const ENTITY: EntityType;

    fn id(&self) -> &str;
}

/// A free-form JSON object section of a plan.
pub type Section = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mother_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub father_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_guidance_notes: Option<String>,
    pub school_id: String,
    pub tenant_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Draft,
    Pending,
    Returned,
    Approved,
    Obsolete,
}

/// Individualized education plan (PEI).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EducationPlan {
    pub id: String,
    pub student_id: String,
    pub school_id: String,
    pub tenant_id: String,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_teacher_id: Option<String>,
    #[serde(default = "default_version_number")]
    pub version_number: u32,
    #[serde(default = "default_true")]
    pub is_active_version: bool,
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis_data: Option<Section>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planning_data: Option<Section>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_data: Option<Section>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_approved_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_approved_by: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalCategory {
    Academic,
    Functional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanGoal {
    pub id: String,
    pub pei_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barrier_id: Option<String>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<GoalCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_date: Option<String>,
    pub progress_level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanBarrier {
    pub id: String,
    pub pei_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barrier_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_version_number() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl Syncable for Student {
    const ENTITY: EntityType = EntityType::Student;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Syncable for EducationPlan {
    const ENTITY: EntityType = EntityType::Plan;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Syncable for PlanGoal {
    const ENTITY: EntityType = EntityType::Goal;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Syncable for PlanBarrier {
    const ENTITY: EntityType = EntityType::Barrier;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Merge view over a plan payload: the three mergeable sections plus
/// everything else as an opaque extension map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis_data: Option<Section>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planning_data: Option<Section>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_data: Option<Section>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PlanDocument {
    pub const SECTIONS: [&'static str; 3] = ["diagnosis_data", "planning_data", "evaluation_data"];

    /// Parse a payload; None when it is not an object. A section holding
    /// something other than an object is kept verbatim in `extra`.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let mut object = payload.as_object()?.clone();
        let mut opaque = Map::new();
        for key in Self::SECTIONS {
            match object.remove(key) {
                // Null sections behave like absent ones.
                None | Some(Value::Null) => {}
                Some(section @ Value::Object(_)) => {
                    object.insert(key.to_string(), section);
                }
                Some(other) => {
                    opaque.insert(key.to_string(), other);
                }
            }
        }
        let mut doc: Self = serde_json::from_value(Value::Object(object)).ok()?;
        doc.extra.extend(opaque);
        Some(doc)
    }

    pub fn into_payload(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn sections_mut(&mut self) -> [&mut Option<Section>; 3] {
        [
            &mut self.diagnosis_data,
            &mut self.planning_data,
            &mut self.evaluation_data,
        ]
    }

    pub fn sections(&self) -> [&Option<Section>; 3] {
        [&self.diagnosis_data, &self.planning_data, &self.evaluation_data]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_student_keeps_unknown_columns() {
        let payload = json!({
            "id": "s1",
            "name": "Ana",
            "school_id": "sc1",
            "tenant_id": "t1",
            "class_name": "3B"
        });
        let student: Student = serde_json::from_value(payload.clone()).unwrap();
        assert_eq!(student.extra["class_name"], "3B");
        assert_eq!(serde_json::to_value(&student).unwrap(), payload);
    }

    #[test]
    fn test_plan_defaults() {
        let plan: EducationPlan = serde_json::from_value(json!({
            "id": "p1",
            "student_id": "s1",
            "school_id": "sc1",
            "tenant_id": "t1",
            "created_by": "u1",
            "status": "draft"
        }))
        .unwrap();
        assert_eq!(plan.version_number, 1);
        assert!(plan.is_active_version);
        assert_eq!(plan.status, PlanStatus::Draft);
        assert!(plan.diagnosis_data.is_none());
    }

    #[test]
    fn test_plan_document_splits_sections() {
        let doc = PlanDocument::from_payload(&json!({
            "id": "p1",
            "status": "pending",
            "diagnosis_data": {"a": 1},
            "planning_data": null
        }))
        .unwrap();
        assert_eq!(doc.diagnosis_data.unwrap()["a"], 1);
        assert!(doc.planning_data.is_none());
        assert_eq!(doc.extra["status"], "pending");
    }

    #[test]
    fn test_plan_document_keeps_scalar_section_opaque() {
        let doc = PlanDocument::from_payload(&json!({"id": "p1", "diagnosis_data": "free text"}))
            .unwrap();
        assert!(doc.diagnosis_data.is_none());
        assert_eq!(doc.extra["diagnosis_data"], "free text");
        assert_eq!(doc.into_payload()["diagnosis_data"], "free text");
        assert!(PlanDocument::from_payload(&json!([1, 2])).is_none());
    }

    #[test]
    fn test_goal_category_serialization() {
        let goal: PlanGoal = serde_json::from_value(json!({
            "id": "g1",
            "pei_id": "p1",
            "description": "Read short texts",
            "category": "academic",
            "progress_level": "not_started"
        }))
        .unwrap();
        assert_eq!(goal.category, Some(GoalCategory::Academic));
        assert_eq!(<PlanGoal as Syncable>::ENTITY, EntityType::Goal);
    }
}
