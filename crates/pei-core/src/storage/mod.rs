pub mod db;
pub mod queue;
pub mod replica;
pub mod settings;

pub use db::LocalDb;
pub use queue::{Operation, QueueEntry, SyncQueue};
pub use replica::ReplicaStore;
pub use settings::SettingsStore;
