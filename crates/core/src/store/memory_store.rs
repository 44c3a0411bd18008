//! Process-local [`LocalStore`] used by tests and embedders without a data directory.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::errors::Result;
use crate::queries::QueryModification;
use crate::resources::{LocalStore, OutboxEntry, Resource};

#[derive(Default)]
struct Tables {
    resources: HashMap<String, Vec<Resource>>,
    outbox: Vec<OutboxEntry>,
    meta: BTreeMap<String, String>,
    query_modifications: Vec<QueryModification>,
}

impl Tables {
    fn upsert(&mut self, resource: &Resource) {
        let rows = self
            .resources
            .entry(resource.resource_type.clone())
            .or_default();
        let position = rows.iter().position(|row| {
            (resource.id.is_some() && row.id == resource.id)
                || (resource.temp_id.is_some() && row.temp_id == resource.temp_id)
        });
        match position {
            Some(index) => rows[index] = resource.clone(),
            None => rows.push(resource.clone()),
        }
    }

    fn delete(&mut self, resource_type: &str, key: &str) -> bool {
        let Some(rows) = self.resources.get_mut(resource_type) else {
            return false;
        };
        let before = rows.len();
        rows.retain(|row| !row.matches_key(key));
        rows.len() != before
    }

    fn upsert_outbox(&mut self, entry: &OutboxEntry) {
        match self.outbox.iter_mut().find(|e| e.temp_id == entry.temp_id) {
            Some(existing) => *existing = entry.clone(),
            None => self.outbox.push(entry.clone()),
        }
    }
}

#[derive(Default)]
pub struct MemoryLocalStore {
    tables: Mutex<Tables>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn ensure_resource_table(&self, resource_type: &str) -> Result<()> {
        self.tables()
            .resources
            .entry(resource_type.to_string())
            .or_default();
        Ok(())
    }

    async fn put_resource(&self, resource: &Resource) -> Result<()> {
        self.tables().upsert(resource);
        Ok(())
    }

    async fn put_resources(&self, resources: &[Resource]) -> Result<usize> {
        let mut tables = self.tables();
        for resource in resources {
            tables.upsert(resource);
        }
        Ok(resources.len())
    }

    async fn get_resource(&self, resource_type: &str, key: &str) -> Result<Option<Resource>> {
        Ok(self
            .tables()
            .resources
            .get(resource_type)
            .and_then(|rows| rows.iter().find(|row| row.matches_key(key)).cloned()))
    }

    async fn list_resources(&self, resource_type: &str) -> Result<Vec<Resource>> {
        Ok(self
            .tables()
            .resources
            .get(resource_type)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_resource(&self, resource_type: &str, key: &str) -> Result<bool> {
        Ok(self.tables().delete(resource_type, key))
    }

    async fn clear_resources(&self, resource_type: &str) -> Result<usize> {
        Ok(self
            .tables()
            .resources
            .get_mut(resource_type)
            .map(|rows| std::mem::take(rows).len())
            .unwrap_or(0))
    }

    async fn put_outbox_entry(&self, entry: &OutboxEntry) -> Result<()> {
        self.tables().upsert_outbox(entry);
        Ok(())
    }

    async fn delete_outbox_entry(&self, temp_id: &str) -> Result<bool> {
        let mut tables = self.tables();
        let before = tables.outbox.len();
        tables.outbox.retain(|e| e.temp_id != temp_id);
        Ok(tables.outbox.len() != before)
    }

    async fn list_outbox_entries(&self, resource_type: Option<&str>) -> Result<Vec<OutboxEntry>> {
        Ok(self
            .tables()
            .outbox
            .iter()
            .filter(|e| resource_type.map_or(true, |t| e.resource_type == t))
            .cloned()
            .collect())
    }

    async fn record_optimistic_write(&self, resource: &Resource, entry: &OutboxEntry) -> Result<()> {
        let mut tables = self.tables();
        tables.upsert_outbox(entry);
        tables.upsert(resource);
        Ok(())
    }

    async fn confirm_created(&self, temp_id: &str, resource: &Resource) -> Result<()> {
        let mut tables = self.tables();
        tables.outbox.retain(|e| e.temp_id != temp_id);
        tables.delete(&resource.resource_type, temp_id);
        tables.upsert(resource);
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self.tables().meta.get(key).cloned())
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.tables().meta.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_meta(&self, key: &str) -> Result<()> {
        self.tables().meta.remove(key);
        Ok(())
    }

    async fn put_query_modification(&self, modification: &QueryModification) -> Result<()> {
        let mut tables = self.tables();
        match tables
            .query_modifications
            .iter_mut()
            .find(|m| m.id == modification.id)
        {
            Some(existing) => *existing = modification.clone(),
            None => tables.query_modifications.push(modification.clone()),
        }
        Ok(())
    }

    async fn list_query_modifications(
        &self,
        session_id: Option<&str>,
    ) -> Result<Vec<QueryModification>> {
        Ok(self
            .tables()
            .query_modifications
            .iter()
            .filter(|m| session_id.map_or(true, |s| m.session_id == s))
            .cloned()
            .collect())
    }
}
