//! Seams to the remote resource service and the local persistent store.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::resources_model::{OutboxEntry, QueryParams, Resource};
use crate::errors::Result;
use crate::queries::QueryModification;
use crate::search::SearchRequest;

/// Remote resource API. Implementations return raw JSON objects; repositories turn
/// them into [`Resource`]s.
#[async_trait]
pub trait RemoteResourceApi: Send + Sync {
    async fn list(&self, resource_type: &str, params: &QueryParams) -> Result<Vec<Value>>;

    /// `Ok(None)` when the server answers 404.
    async fn get(&self, resource_type: &str, id: &str) -> Result<Option<Value>>;

    /// Create carrying the client temp id for correlation.
    async fn create(
        &self,
        resource_type: &str,
        data: &Map<String, Value>,
        temp_id: &str,
    ) -> Result<Value>;

    async fn update(&self, resource_type: &str, id: &str, data: &Map<String, Value>)
        -> Result<Value>;

    /// `Ok(false)` when there was nothing to delete.
    async fn delete(&self, resource_type: &str, id: &str) -> Result<bool>;

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Value>>;
}

/// Durable per-device store: one table per resource type, the outbox, meta key/values
/// and the query modification history.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn ensure_resource_table(&self, resource_type: &str) -> Result<()>;

    async fn put_resource(&self, resource: &Resource) -> Result<()>;
    /// All rows in one transaction. Returns the number written.
    async fn put_resources(&self, resources: &[Resource]) -> Result<usize>;
    /// Looks a row up by server id or temp id.
    async fn get_resource(&self, resource_type: &str, key: &str) -> Result<Option<Resource>>;
    async fn list_resources(&self, resource_type: &str) -> Result<Vec<Resource>>;
    async fn delete_resource(&self, resource_type: &str, key: &str) -> Result<bool>;
    async fn clear_resources(&self, resource_type: &str) -> Result<usize>;

    async fn put_outbox_entry(&self, entry: &OutboxEntry) -> Result<()>;
    async fn delete_outbox_entry(&self, temp_id: &str) -> Result<bool>;
    async fn list_outbox_entries(&self, resource_type: Option<&str>) -> Result<Vec<OutboxEntry>>;

    /// Upserts the outbox entry and the optimistic row atomically.
    async fn record_optimistic_write(&self, resource: &Resource, entry: &OutboxEntry)
        -> Result<()>;
    /// Drops the temp row and outbox entry and upserts the confirmed row atomically.
    async fn confirm_created(&self, temp_id: &str, resource: &Resource) -> Result<()>;

    async fn get_meta(&self, key: &str) -> Result<Option<String>>;
    async fn set_meta(&self, key: &str, value: &str) -> Result<()>;
    async fn delete_meta(&self, key: &str) -> Result<()>;

    async fn put_query_modification(&self, modification: &QueryModification) -> Result<()>;
    async fn list_query_modifications(
        &self,
        session_id: Option<&str>,
    ) -> Result<Vec<QueryModification>>;
}
