use crate::error::RemoteError;
use async_trait::async_trait;
use pei_proto::{EntityType, RemoteChange, RemoteRecord, UpsertAck};
use serde_json::Value;
use std::sync::Arc;

/// The backend the replica is reconciled against.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Current remote version of a record, None when absent.
    async fn fetch(
        &self,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<RemoteRecord>, RemoteError>;

    /// Idempotent write of a full payload, keyed by its `id` field.
    async fn upsert(&self, entity_type: EntityType, payload: &Value)
        -> Result<UpsertAck, RemoteError>;

    /// Remove a record. `RemoteError::NotFound` when it is already gone.
    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<(), RemoteError>;

    /// Changes with `updated_at > cursor`, oldest first.
    async fn changes_since(
        &self,
        entity_type: EntityType,
        cursor: i64,
    ) -> Result<Vec<RemoteChange>, RemoteError>;
}

#[async_trait]
impl<T: RemoteStore + ?Sized> RemoteStore for Arc<T> {
    async fn fetch(
        &self,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<RemoteRecord>, RemoteError> {
        (**self).fetch(entity_type, id).await
    }

    async fn upsert(
        &self,
        entity_type: EntityType,
        payload: &Value,
    ) -> Result<UpsertAck, RemoteError> {
        (**self).upsert(entity_type, payload).await
    }

    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<(), RemoteError> {
        (**self).delete(entity_type, id).await
    }

    async fn changes_since(
        &self,
        entity_type: EntityType,
        cursor: i64,
    ) -> Result<Vec<RemoteChange>, RemoteError> {
        (**self).changes_since(entity_type, cursor).await
    }
}
