//! Scripted fakes shared by the core unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Notify};

use crate::errors::{Error, RemoteError, Result};
use crate::queries::QueryModification;
use crate::resources::{extract_id, LocalStore, OutboxEntry, QueryParams, RemoteResourceApi, Resource};
use crate::search::SearchRequest;
use crate::store::MemoryLocalStore;

#[derive(Default)]
pub(crate) struct FakeRemote {
    records: Mutex<HashMap<String, Vec<Map<String, Value>>>>,
    failing: AtomicBool,
    next_id: AtomicU64,
    pub calls: AtomicUsize,
    pub search_calls: AtomicUsize,
    create_gate: Mutex<Option<Arc<Notify>>>,
    created_tx: Mutex<Option<mpsc::UnboundedSender<(String, Value)>>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn seed(&self, resource_type: &str, record: Value) {
        if let Value::Object(map) = record {
            self.records
                .lock()
                .unwrap()
                .entry(resource_type.to_string())
                .or_default()
                .push(map);
        }
    }

    /// Every create reports `(temp_id, stored record)` and then waits on the gate.
    pub fn hold_creates(&self) -> (Arc<Notify>, mpsc::UnboundedReceiver<(String, Value)>) {
        let gate = Arc::new(Notify::new());
        let (tx, rx) = mpsc::unbounded_channel();
        *self.create_gate.lock().unwrap() = Some(gate.clone());
        *self.created_tx.lock().unwrap() = Some(tx);
        (gate, rx)
    }

    fn check(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::network("connection refused").into());
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteResourceApi for FakeRemote {
    async fn list(&self, resource_type: &str, params: &QueryParams) -> Result<Vec<Value>> {
        self.check()?;
        let records = self.records.lock().unwrap();
        Ok(records
            .get(resource_type)
            .map(|rows| {
                rows.iter()
                    .filter(|row| {
                        params
                            .filters
                            .iter()
                            .all(|(field, value)| row.get(field) == Some(value))
                    })
                    .cloned()
                    .map(Value::Object)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(&self, resource_type: &str, id: &str) -> Result<Option<Value>> {
        self.check()?;
        let records = self.records.lock().unwrap();
        Ok(records.get(resource_type).and_then(|rows| {
            rows.iter()
                .find(|row| extract_id(row).as_deref() == Some(id))
                .cloned()
                .map(Value::Object)
        }))
    }

    async fn create(
        &self,
        resource_type: &str,
        data: &Map<String, Value>,
        temp_id: &str,
    ) -> Result<Value> {
        self.check()?;
        let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let mut record = data.clone();
        record.insert("id".to_string(), Value::String(id));
        self.records
            .lock()
            .unwrap()
            .entry(resource_type.to_string())
            .or_default()
            .push(record.clone());

        let tx = self.created_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send((temp_id.to_string(), Value::Object(record.clone())));
        }
        let gate = self.create_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(Value::Object(record))
    }

    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        data: &Map<String, Value>,
    ) -> Result<Value> {
        self.check()?;
        let mut records = self.records.lock().unwrap();
        let row = records
            .get_mut(resource_type)
            .and_then(|rows| rows.iter_mut().find(|row| extract_id(row).as_deref() == Some(id)))
            .ok_or_else(|| RemoteError::status(404, "not found"))?;
        for (field, value) in data {
            row.insert(field.clone(), value.clone());
        }
        Ok(Value::Object(row.clone()))
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<bool> {
        self.check()?;
        let mut records = self.records.lock().unwrap();
        let Some(rows) = records.get_mut(resource_type) else {
            return Ok(false);
        };
        let before = rows.len();
        rows.retain(|row| extract_id(row).as_deref() != Some(id));
        Ok(rows.len() != before)
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Value>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let term = request.term.to_lowercase();
        let records = self.records.lock().unwrap();
        Ok(records
            .get(&request.resource_type)
            .map(|rows| {
                rows.iter()
                    .filter(|row| {
                        row.get(&request.field)
                            .and_then(Value::as_str)
                            .is_some_and(|v| v.to_lowercase().contains(&term))
                    })
                    .cloned()
                    .map(Value::Object)
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Memory store whose meta and query-history writes fail while `failing` is set.
#[derive(Default)]
pub(crate) struct FlakyLocalStore {
    inner: MemoryLocalStore,
    failing: AtomicBool,
}

impl FlakyLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::database("disk I/O error"));
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStore for FlakyLocalStore {
    async fn ensure_resource_table(&self, resource_type: &str) -> Result<()> {
        self.inner.ensure_resource_table(resource_type).await
    }

    async fn put_resource(&self, resource: &Resource) -> Result<()> {
        self.inner.put_resource(resource).await
    }

    async fn put_resources(&self, resources: &[Resource]) -> Result<usize> {
        self.inner.put_resources(resources).await
    }

    async fn get_resource(&self, resource_type: &str, key: &str) -> Result<Option<Resource>> {
        self.inner.get_resource(resource_type, key).await
    }

    async fn list_resources(&self, resource_type: &str) -> Result<Vec<Resource>> {
        self.inner.list_resources(resource_type).await
    }

    async fn delete_resource(&self, resource_type: &str, key: &str) -> Result<bool> {
        self.inner.delete_resource(resource_type, key).await
    }

    async fn clear_resources(&self, resource_type: &str) -> Result<usize> {
        self.inner.clear_resources(resource_type).await
    }

    async fn put_outbox_entry(&self, entry: &OutboxEntry) -> Result<()> {
        self.inner.put_outbox_entry(entry).await
    }

    async fn delete_outbox_entry(&self, temp_id: &str) -> Result<bool> {
        self.inner.delete_outbox_entry(temp_id).await
    }

    async fn list_outbox_entries(&self, resource_type: Option<&str>) -> Result<Vec<OutboxEntry>> {
        self.inner.list_outbox_entries(resource_type).await
    }

    async fn record_optimistic_write(&self, resource: &Resource, entry: &OutboxEntry) -> Result<()> {
        self.inner.record_optimistic_write(resource, entry).await
    }

    async fn confirm_created(&self, temp_id: &str, resource: &Resource) -> Result<()> {
        self.inner.confirm_created(temp_id, resource).await
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.inner.get_meta(key).await
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.inner.set_meta(key, value).await
    }

    async fn delete_meta(&self, key: &str) -> Result<()> {
        self.check()?;
        self.inner.delete_meta(key).await
    }

    async fn put_query_modification(&self, modification: &QueryModification) -> Result<()> {
        self.check()?;
        self.inner.put_query_modification(modification).await
    }

    async fn list_query_modifications(
        &self,
        session_id: Option<&str>,
    ) -> Result<Vec<QueryModification>> {
        self.inner.list_query_modifications(session_id).await
    }
}
