pub mod education;
pub mod record;

pub use education::{
    EducationPlan, GoalCategory, PlanBarrier, PlanDocument, PlanGoal, PlanStatus, Section,
    Student, Syncable,
};
pub use record::{conflict_marker, ReplicaRecord, SYNC_CONFLICT_KEY, SYNC_CONFLICT_NOTE_KEY};
