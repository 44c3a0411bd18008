//! [`LocalStore`] backed by a SQLite file in the device's data directory.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use diesel::r2d2::{self, Pool};
use diesel::sqlite::SqliteConnection;
use log::info;

use clinicsync_core::errors::Result;
use clinicsync_core::queries::QueryModification;
use clinicsync_core::resources::{LocalStore, OutboxEntry, Resource};

use crate::db::{create_pool, init, run_migrations, spawn_writer, WriteHandle};
use crate::meta::MetaRepository;
use crate::queries::QueryModificationRepository;
use crate::resources::ResourceTableRepository;

pub struct SqliteLocalStore {
    db_path: String,
    resources: ResourceTableRepository,
    meta: MetaRepository,
    query_modifications: QueryModificationRepository,
}

impl SqliteLocalStore {
    /// Creates `data_dir` if needed, applies pending migrations and starts the writer.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let db_path = init(data_dir)?;
        run_migrations(&db_path)?;
        let pool = create_pool(&db_path)?;
        let writer = spawn_writer(pool.as_ref().clone());
        info!("[LocalStore] Opened {}", db_path);
        Ok(Self::from_parts(db_path, pool, writer))
    }

    pub fn from_parts(
        db_path: String,
        pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
        writer: WriteHandle,
    ) -> Self {
        Self {
            db_path,
            resources: ResourceTableRepository::new(pool.clone(), writer.clone()),
            meta: MetaRepository::new(pool.clone(), writer.clone()),
            query_modifications: QueryModificationRepository::new(pool, writer),
        }
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn ensure_resource_table(&self, resource_type: &str) -> Result<()> {
        self.resources.ensure_table(resource_type).await.map(|_| ())
    }

    async fn put_resource(&self, resource: &Resource) -> Result<()> {
        self.resources.upsert(resource).await
    }

    async fn put_resources(&self, resources: &[Resource]) -> Result<usize> {
        self.resources.upsert_many(resources).await
    }

    async fn get_resource(&self, resource_type: &str, key: &str) -> Result<Option<Resource>> {
        self.resources.get(resource_type, key).await
    }

    async fn list_resources(&self, resource_type: &str) -> Result<Vec<Resource>> {
        self.resources.list(resource_type).await
    }

    async fn delete_resource(&self, resource_type: &str, key: &str) -> Result<bool> {
        self.resources.delete(resource_type, key).await
    }

    async fn clear_resources(&self, resource_type: &str) -> Result<usize> {
        self.resources.clear(resource_type).await
    }

    async fn put_outbox_entry(&self, entry: &OutboxEntry) -> Result<()> {
        self.resources.put_outbox(entry).await
    }

    async fn delete_outbox_entry(&self, temp_id: &str) -> Result<bool> {
        self.resources.delete_outbox(temp_id).await
    }

    async fn list_outbox_entries(&self, resource_type: Option<&str>) -> Result<Vec<OutboxEntry>> {
        self.resources.list_outbox(resource_type)
    }

    async fn record_optimistic_write(
        &self,
        resource: &Resource,
        entry: &OutboxEntry,
    ) -> Result<()> {
        self.resources.record_optimistic_write(resource, entry).await
    }

    async fn confirm_created(&self, temp_id: &str, resource: &Resource) -> Result<()> {
        self.resources.confirm_created(temp_id, resource).await
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.meta.get(key)
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.meta.set(key, value).await
    }

    async fn delete_meta(&self, key: &str) -> Result<()> {
        self.meta.delete(key).await
    }

    async fn put_query_modification(&self, modification: &QueryModification) -> Result<()> {
        self.query_modifications.upsert(modification).await
    }

    async fn list_query_modifications(
        &self,
        session_id: Option<&str>,
    ) -> Result<Vec<QueryModification>> {
        self.query_modifications.list(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use clinicsync_core::queries::{ModificationStatus, QueryModificationOp};
    use clinicsync_core::resources::payload_fingerprint;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    fn setup_store() -> (SqliteLocalStore, TempDir) {
        let dir = tempdir().expect("tempdir");
        let store = SqliteLocalStore::open(dir.path()).expect("open store");
        (store, dir)
    }

    fn data(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().expect("object")
    }

    #[tokio::test]
    async fn resources_round_trip_by_id_and_temp_id() {
        let (store, _dir) = setup_store();
        let optimistic = Resource::optimistic("patients", "tmp_1", data(json!({ "name": "Ana" })));
        store.put_resource(&optimistic).await.unwrap();

        let found = store.get_resource("patients", "tmp_1").await.unwrap().unwrap();
        assert!(found.is_optimistic);
        assert_eq!(found.data.get("name"), Some(&json!("Ana")));

        let mut confirmed = Resource::confirmed("patients", "p-1", data(json!({ "name": "Ana" })));
        confirmed.temp_id = Some("tmp_1".to_string());
        store.put_resource(&confirmed).await.unwrap();

        let rows = store.list_resources("patients").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id.as_deref(), Some("p-1"));
        assert!(!rows[0].is_optimistic);
        assert!(store.get_resource("patients", "tmp_1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn bulk_put_delete_and_clear() {
        let (store, _dir) = setup_store();
        let rows: Vec<Resource> = (0..3)
            .map(|i| Resource::confirmed("sales", &format!("s{}", i), data(json!({ "total": i }))))
            .collect();
        assert_eq!(store.put_resources(&rows).await.unwrap(), 3);

        assert!(store.delete_resource("sales", "s1").await.unwrap());
        assert!(!store.delete_resource("sales", "s1").await.unwrap());
        assert_eq!(store.list_resources("sales").await.unwrap().len(), 2);

        assert_eq!(store.clear_resources("sales").await.unwrap(), 2);
        assert!(store.list_resources("sales").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resource_types_are_isolated_tables() {
        let (store, _dir) = setup_store();
        store
            .put_resource(&Resource::confirmed("patients", "x", data(json!({}))))
            .await
            .unwrap();
        assert!(store.get_resource("treatments", "x").await.unwrap().is_none());
        assert!(store.list_resources("bad-type").await.is_err());
    }

    #[tokio::test]
    async fn optimistic_write_and_confirmation_are_atomic_pairs() {
        let (store, _dir) = setup_store();
        let payload = data(json!({ "name": "Bo" }));
        let resource = Resource::optimistic("patients", "tmp_9", payload.clone());
        let entry = OutboxEntry::new("patients", "tmp_9", payload_fingerprint(&payload));

        store.record_optimistic_write(&resource, &entry).await.unwrap();
        let outbox = store.list_outbox_entries(Some("patients")).await.unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].temp_id, "tmp_9");
        assert_eq!(outbox[0].payload_fingerprint, entry.payload_fingerprint);
        assert!(store.list_outbox_entries(Some("sales")).await.unwrap().is_empty());

        let confirmed = Resource::confirmed("patients", "p-9", payload);
        store.confirm_created("tmp_9", &confirmed).await.unwrap();

        assert!(store.list_outbox_entries(None).await.unwrap().is_empty());
        let rows = store.list_resources("patients").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key(), Some("p-9"));
        assert!(!store.delete_outbox_entry("tmp_9").await.unwrap());
    }

    #[tokio::test]
    async fn meta_values_upsert_and_delete() {
        let (store, _dir) = setup_store();
        assert_eq!(store.get_meta("auth").await.unwrap(), None);
        store.set_meta("auth", r#"{"token":"a"}"#).await.unwrap();
        store.set_meta("auth", r#"{"token":"b"}"#).await.unwrap();
        assert_eq!(
            store.get_meta("auth").await.unwrap().as_deref(),
            Some(r#"{"token":"b"}"#)
        );
        store.delete_meta("auth").await.unwrap();
        assert_eq!(store.get_meta("auth").await.unwrap(), None);
    }

    #[tokio::test]
    async fn query_modifications_persist_status_changes() {
        let (store, _dir) = setup_store();
        let mut modification = QueryModification {
            id: "qm-1".to_string(),
            session_id: "sess-1".to_string(),
            repository_type: "appointments".to_string(),
            modifications: vec![QueryModificationOp::SetLimit { limit: 10 }],
            status: ModificationStatus::Active,
            timestamp: Utc::now(),
        };
        store.put_query_modification(&modification).await.unwrap();
        modification.status = ModificationStatus::Reverted;
        store.put_query_modification(&modification).await.unwrap();

        let listed = store.list_query_modifications(Some("sess-1")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, ModificationStatus::Reverted);
        assert_eq!(listed[0].modifications, modification.modifications);
        assert!(store
            .list_query_modifications(Some("other"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        {
            let store = SqliteLocalStore::open(dir.path()).unwrap();
            store
                .put_resource(&Resource::confirmed("patients", "p-1", data(json!({ "a": 1 }))))
                .await
                .unwrap();
        }
        let reopened = SqliteLocalStore::open(dir.path()).unwrap();
        let rows = reopened.list_resources("patients").await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
