//! Offline-first replication of PEI education records.
//!
//! Local writes land in a SQLite replica and a durable mutation queue; the
//! reconciliation engine pushes them to the backend when connectivity returns
//! and pulls remote changes back into the replica.

pub mod clock;
pub mod config;
pub mod error;
pub mod manager;
pub mod models;
pub mod storage;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, SyncSettings};
pub use error::{RemoteError, Result, SyncError};
pub use manager::SyncManager;
pub use models::{EducationPlan, PlanBarrier, PlanGoal, ReplicaRecord, Student, Syncable};
pub use pei_proto::EntityType;
pub use storage::{LocalDb, Operation, QueueEntry};
pub use sync::{
    ConnectivityMonitor, CycleReport, InMemoryRemote, RemoteStore, SyncOutcome, SyncStatus,
};
