pub mod connectivity;
pub mod engine;
pub mod locks;
pub mod memory_remote;
pub mod remote;
pub mod resolver;
pub mod scheduler;
pub mod tracker;

pub use connectivity::{ConnectivityMonitor, Reconnects};
pub use engine::{CycleReport, ReconciliationEngine};
pub use locks::EntityLocks;
pub use memory_remote::{InMemoryRemote, RemoteCalls};
pub use remote::RemoteStore;
pub use resolver::{resolve, ConflictDescriptor, Strategy, CONFLICT_NOTE};
pub use scheduler::{SyncOutcome, SyncScheduler, SyncStatus};
pub use tracker::ChangeTracker;
