use pei_proto::EntityType;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

type EntityKey = (EntityType, String);

/// Keyed mutex serializing read-modify-write cycles on a single entity.
///
/// Guards are synchronous and must never be held across an `.await`.
#[derive(Default)]
pub struct EntityLocks {
    slots: Mutex<HashMap<EntityKey, Arc<Mutex<()>>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock of `(entity_type, id)`.
    pub fn with_entity<R>(&self, entity_type: EntityType, id: &str, f: impl FnOnce() -> R) -> R {
        let key = (entity_type, id.to_string());
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(key.clone()).or_default().clone()
        };
        let result = {
            let _guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        drop(slot);

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.get(&key).is_some_and(|s| Arc::strong_count(s) == 1) {
            slots.remove(&key);
        }
        result
    }

    /// Number of entities currently locked or waited on
    pub fn active(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
