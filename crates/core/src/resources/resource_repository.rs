//! Per-type repository: remote-first reads with local fallback, optimistic creates
//! tracked in the outbox.

use std::sync::Arc;

use log::{debug, error, warn};
use serde_json::{Map, Value};

use super::fingerprint::payload_fingerprint;
use super::resource_store::ResourceStore;
use super::resources_model::{
    extract_id, generate_temp_id, OutboxEntry, QueryParams, Resource, ResourceType,
};
use super::resources_traits::{LocalStore, RemoteResourceApi};
use crate::errors::{Error, Result};

enum MergeOutcome {
    Merged(OutboxEntry),
    AlreadyConfirmed(Resource),
    RolledBack,
}

pub struct ResourceRepository {
    resource_type: ResourceType,
    remote: Arc<dyn RemoteResourceApi>,
    local: Arc<dyn LocalStore>,
    store: Arc<ResourceStore>,
}

impl ResourceRepository {
    pub fn new(
        resource_type: ResourceType,
        remote: Arc<dyn RemoteResourceApi>,
        local: Arc<dyn LocalStore>,
        store: Arc<ResourceStore>,
    ) -> Self {
        store.register(resource_type.as_str());
        Self {
            resource_type,
            remote,
            local,
            store,
        }
    }

    pub fn resource_type(&self) -> &str {
        self.resource_type.as_str()
    }

    pub fn store(&self) -> &Arc<ResourceStore> {
        &self.store
    }

    /// Optimistic create. The outbox entry is opened before the remote call so an
    /// early confirmation can be matched; it is rolled back if the call fails.
    pub async fn add(&self, data: Map<String, Value>) -> Result<Resource> {
        let resource_type = self.resource_type();
        let temp_id = generate_temp_id();
        let entry = OutboxEntry::new(resource_type, &temp_id, payload_fingerprint(&data));

        self.store
            .mutate(resource_type, |slice| slice.open_outbox(entry.clone()));
        if let Err(err) = self.local.put_outbox_entry(&entry).await {
            self.store
                .mutate(resource_type, |slice| slice.take_outbox(&temp_id));
            return Err(err);
        }

        let response = match self.remote.create(resource_type, &data, &temp_id).await {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    "[Repository] Create {} failed, rolling back {}: {}",
                    resource_type, temp_id, err
                );
                self.rollback(&temp_id).await;
                return Err(err);
            }
        };

        let (server_id, body) = match response {
            Value::Object(map) => (extract_id(&map), map),
            _ => (None, data),
        };
        let optimistic = Resource::optimistic(resource_type, &temp_id, body);

        let outcome = self.store.mutate(resource_type, |slice| {
            if let Some(confirmed) = slice.take_settled(&temp_id) {
                return MergeOutcome::AlreadyConfirmed(confirmed);
            }
            let Some(entry) = slice.outbox_entry_mut(&temp_id) else {
                return MergeOutcome::RolledBack;
            };
            entry.server_id = server_id.clone();
            let entry = entry.clone();
            slice.upsert(optimistic.clone());
            MergeOutcome::Merged(entry)
        });

        match outcome {
            MergeOutcome::Merged(entry) => {
                if let Err(err) = self.local.record_optimistic_write(&optimistic, &entry).await {
                    error!(
                        "[Repository] Failed to persist optimistic {} {}: {}",
                        resource_type, temp_id, err
                    );
                }
                Ok(optimistic)
            }
            MergeOutcome::AlreadyConfirmed(confirmed) => {
                debug!(
                    "[Repository] {} {} confirmed before merge as {:?}",
                    resource_type, temp_id, confirmed.id
                );
                Ok(confirmed)
            }
            MergeOutcome::RolledBack => Err(Error::validation(format!(
                "optimistic write {} was rolled back while in flight",
                temp_id
            ))),
        }
    }

    pub async fn update(&self, id: &str, data: Map<String, Value>) -> Result<Resource> {
        let resource_type = self.resource_type();
        self.ensure_confirmed(id)?;
        let value = self.remote.update(resource_type, id, &data).await?;
        let resource = Resource::from_remote(resource_type, value, Some(id))?;
        self.store
            .mutate(resource_type, |slice| slice.upsert(resource.clone()));
        if let Err(err) = self.local.put_resource(&resource).await {
            warn!("[Repository] Failed to cache updated {} {}: {}", resource_type, id, err);
        }
        Ok(resource)
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        let resource_type = self.resource_type();
        self.ensure_confirmed(id)?;
        let deleted = self.remote.delete(resource_type, id).await?;
        self.store.mutate(resource_type, |slice| slice.remove(id));
        if let Err(err) = self.local.delete_resource(resource_type, id).await {
            warn!("[Repository] Failed to drop cached {} {}: {}", resource_type, id, err);
        }
        Ok(deleted)
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<Resource>> {
        let resource_type = self.resource_type();
        match self.remote.get(resource_type, id).await {
            Ok(Some(value)) => {
                let resource = Resource::from_remote(resource_type, value, Some(id))?;
                if let Err(err) = self.local.put_resource(&resource).await {
                    warn!("[Repository] Failed to cache {} {}: {}", resource_type, id, err);
                }
                Ok(Some(resource))
            }
            Ok(None) => Ok(None),
            Err(err) if err.is_remote_failure() => {
                warn!(
                    "[Repository] Remote get {} {} failed, using local cache: {}",
                    resource_type, id, err
                );
                self.get_local(id).await
            }
            Err(err) => Err(err),
        }
    }

    /// Remote list merged into shared state and cached; local snapshot on remote failure.
    pub async fn query(&self, params: &QueryParams) -> Result<Vec<Resource>> {
        let resource_type = self.resource_type();
        let values = match self.remote.list(resource_type, params).await {
            Ok(values) => values,
            Err(err) if err.is_remote_failure() => {
                warn!(
                    "[Repository] Remote query {} failed, using local cache: {}",
                    resource_type, err
                );
                return self.query_local(params).await;
            }
            Err(err) => return Err(err),
        };

        let mut resources = Vec::with_capacity(values.len());
        for value in values {
            match Resource::from_remote(resource_type, value, None) {
                Ok(resource) => resources.push(resource),
                Err(err) => debug!("[Repository] Skipping undecodable {}: {}", resource_type, err),
            }
        }

        // rows still awaiting confirmation stay optimistic, locally as well
        let applied: Vec<Resource> = self.store.mutate(resource_type, |slice| {
            resources
                .iter()
                .filter(|resource| slice.upsert_confirmed((*resource).clone()))
                .cloned()
                .collect()
        });
        if let Err(err) = self.local.put_resources(&applied).await {
            warn!("[Repository] Failed to cache {} query results: {}", resource_type, err);
        }
        Ok(resources)
    }

    /// Stale-but-usable local rows, never flagged optimistic.
    pub async fn query_local(&self, params: &QueryParams) -> Result<Vec<Resource>> {
        let rows = self.local.list_resources(self.resource_type()).await?;
        let rows = rows
            .into_iter()
            .map(|mut r| {
                r.is_optimistic = false;
                r
            })
            .collect();
        Ok(params.apply(rows))
    }

    pub async fn get_local(&self, id: &str) -> Result<Option<Resource>> {
        let row = self.local.get_resource(self.resource_type(), id).await?;
        Ok(row.map(|mut r| {
            r.is_optimistic = false;
            r
        }))
    }

    /// Drops an optimistic write: outbox entry and optimistic resource, memory and disk.
    pub async fn rollback(&self, temp_id: &str) -> bool {
        let resource_type = self.resource_type();
        let removed = self.store.mutate(resource_type, |slice| {
            slice.take_settled(temp_id);
            let entry = slice.take_outbox(temp_id);
            let resource = match slice.position_of_temp(temp_id) {
                Some(index) if slice.resources()[index].is_optimistic => slice.remove(temp_id),
                _ => None,
            };
            entry.is_some() || resource.is_some()
        });
        if let Err(err) = self.local.delete_outbox_entry(temp_id).await {
            error!("[Repository] Failed to drop outbox entry {}: {}", temp_id, err);
        }
        if let Err(err) = self.local.delete_resource(resource_type, temp_id).await {
            error!("[Repository] Failed to drop optimistic row {}: {}", temp_id, err);
        }
        removed
    }

    /// Loads persisted rows and open outbox entries into shared state. Outbox entries
    /// whose optimistic row never got written are dropped.
    pub async fn hydrate(&self) -> Result<usize> {
        let resource_type = self.resource_type();
        self.local.ensure_resource_table(resource_type).await?;
        let rows = self.local.list_resources(resource_type).await?;
        let entries = self.local.list_outbox_entries(Some(resource_type)).await?;

        let mut orphans = Vec::new();
        let mut stale_rows = Vec::new();
        let loaded = self.store.mutate(resource_type, |slice| {
            for mut row in rows {
                let pending = row
                    .temp_id
                    .as_deref()
                    .is_some_and(|t| entries.iter().any(|e| e.temp_id == t));
                row.is_optimistic = pending && row.id.is_none();
                if row.id.is_none() && !row.is_optimistic {
                    // no outbox entry left to confirm it against
                    stale_rows.extend(row.temp_id);
                    continue;
                }
                slice.upsert(row);
            }
            for entry in entries {
                if slice.position_of_temp(&entry.temp_id).is_some() {
                    slice.open_outbox(entry);
                } else {
                    orphans.push(entry.temp_id);
                }
            }
            slice.resources().len()
        });

        for temp_id in orphans {
            warn!(
                "[Repository] Dropping {} outbox entry {} without an optimistic row",
                resource_type, temp_id
            );
            self.local.delete_outbox_entry(&temp_id).await?;
        }
        for temp_id in stale_rows {
            warn!(
                "[Repository] Dropping unconfirmed {} row {} with no outbox entry",
                resource_type, temp_id
            );
            self.local.delete_resource(resource_type, &temp_id).await?;
        }
        Ok(loaded)
    }

    fn ensure_confirmed(&self, id: &str) -> Result<()> {
        if id.trim().is_empty() {
            return Err(Error::validation("id must not be empty"));
        }
        let pending = self.store.read(self.resource_type(), |slice| {
            slice
                .and_then(|s| s.find(id))
                .is_some_and(|r| r.id.is_none())
        });
        if pending {
            return Err(Error::validation(format!(
                "{} {} is awaiting server confirmation",
                self.resource_type(),
                id
            )));
        }
        Ok(())
    }
}
