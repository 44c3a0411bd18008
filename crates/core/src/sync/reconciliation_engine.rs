//! Applies confirmed `created`/`updated`/`deleted` events to one resource type.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use log::{debug, error};

use crate::config::{STRUCTURAL_MATCH_MAX_AGE_SECS, STRUCTURAL_MATCH_WINDOW};
use crate::resources::{
    payload_fingerprint, LocalStore, OutboxEntry, Resource, ResourceEvent, ResourceOperation,
    ResourceSlice, ResourceStore,
};
use crate::transport::{PushEvent, PushEventHandler};

/// How a `created` event was tied to an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    /// The event carried the client temp id.
    Correlation,
    /// The event id equals the id echoed by the create response.
    ServerId,
    /// Same payload fingerprint within the recent window.
    Structural,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Confirmed {
        temp_id: String,
        resource: Resource,
        strategy: MatchStrategy,
    },
    Appended(Resource),
    Replaced(Resource),
    Updated(Resource),
    Deleted(String),
    Dropped(String),
}

pub struct ReconciliationEngine {
    resource_type: String,
    store: Arc<ResourceStore>,
    local: Arc<dyn LocalStore>,
}

impl ReconciliationEngine {
    pub fn new(resource_type: &str, store: Arc<ResourceStore>, local: Arc<dyn LocalStore>) -> Self {
        store.register(resource_type);
        Self {
            resource_type: resource_type.to_string(),
            store,
            local,
        }
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub async fn apply(&self, event: &ResourceEvent) -> ReconcileOutcome {
        if event.resource_type != self.resource_type {
            return ReconcileOutcome::Dropped(format!(
                "event for {} routed to {}",
                event.resource_type, self.resource_type
            ));
        }
        let outcome = match event.operation {
            ResourceOperation::Created => self.apply_created(event),
            ResourceOperation::Updated => self.apply_updated(event),
            ResourceOperation::Deleted => self.apply_deleted(event),
        };
        self.persist(&outcome).await;
        outcome
    }

    fn apply_created(&self, event: &ResourceEvent) -> ReconcileOutcome {
        let fingerprint = payload_fingerprint(&event.payload);
        let confirmed = Resource::confirmed(&self.resource_type, &event.id, event.payload.clone());

        self.store.mutate(&self.resource_type, |slice| {
            if let Some((entry, strategy)) =
                take_matching_entry(slice, event.temp_id.as_deref(), &event.id, &fingerprint)
            {
                let mut resource = confirmed;
                match slice.position_of_temp(&entry.temp_id) {
                    Some(index) => {
                        resource.created_at = slice.resources()[index].created_at;
                        slice.replace_at(index, resource.clone());
                        slice.retain_single(&event.id, index);
                    }
                    None => match slice.position_of_id(&event.id) {
                        Some(index) => slice.replace_at(index, resource.clone()),
                        None => {
                            slice.push(resource.clone());
                            slice.settle(&entry.temp_id, resource.clone());
                        }
                    },
                }
                return ReconcileOutcome::Confirmed {
                    temp_id: entry.temp_id,
                    resource,
                    strategy,
                };
            }

            match slice.position_of_id(&event.id) {
                Some(index) => {
                    slice.replace_at(index, confirmed.clone());
                    ReconcileOutcome::Replaced(confirmed)
                }
                None => {
                    slice.push(confirmed.clone());
                    ReconcileOutcome::Appended(confirmed)
                }
            }
        })
    }

    fn apply_updated(&self, event: &ResourceEvent) -> ReconcileOutcome {
        self.store.mutate(&self.resource_type, |slice| {
            match slice.find_by_id_mut(&event.id) {
                Some(resource) => {
                    resource.apply_fields(&event.payload);
                    resource.is_optimistic = false;
                    ReconcileOutcome::Updated(resource.clone())
                }
                None => ReconcileOutcome::Dropped(format!("update for unknown id {}", event.id)),
            }
        })
    }

    fn apply_deleted(&self, event: &ResourceEvent) -> ReconcileOutcome {
        self.store.mutate(&self.resource_type, |slice| {
            match slice.position_of_id(&event.id) {
                Some(_) => {
                    slice.remove(&event.id);
                    ReconcileOutcome::Deleted(event.id.clone())
                }
                None => ReconcileOutcome::Dropped(format!("delete for unknown id {}", event.id)),
            }
        })
    }

    async fn persist(&self, outcome: &ReconcileOutcome) {
        let result = match outcome {
            ReconcileOutcome::Confirmed {
                temp_id,
                resource,
                strategy,
            } => {
                debug!(
                    "[Reconcile] {} {} confirmed as {:?} ({:?})",
                    self.resource_type, temp_id, resource.id, strategy
                );
                self.local.confirm_created(temp_id, resource).await
            }
            ReconcileOutcome::Appended(resource)
            | ReconcileOutcome::Replaced(resource)
            | ReconcileOutcome::Updated(resource) => self.local.put_resource(resource).await,
            ReconcileOutcome::Deleted(id) => self
                .local
                .delete_resource(&self.resource_type, id)
                .await
                .map(|_| ()),
            ReconcileOutcome::Dropped(reason) => {
                debug!("[Reconcile] Dropped {} event: {}", self.resource_type, reason);
                Ok(())
            }
        };
        if let Err(err) = result {
            error!(
                "[Reconcile] Failed to persist {} event: {}",
                self.resource_type, err
            );
        }
    }
}

/// Correlation id first, then echoed server id, then the bounded structural fallback.
fn take_matching_entry(
    slice: &mut ResourceSlice,
    temp_id: Option<&str>,
    event_id: &str,
    fingerprint: &str,
) -> Option<(OutboxEntry, MatchStrategy)> {
    if let Some(temp_id) = temp_id {
        if let Some(entry) = slice.take_outbox(temp_id) {
            return Some((entry, MatchStrategy::Correlation));
        }
    }
    if let Some(entry) = slice.take_outbox_where(|e| e.server_id.as_deref() == Some(event_id)) {
        return Some((entry, MatchStrategy::ServerId));
    }

    let cutoff = Utc::now() - Duration::seconds(STRUCTURAL_MATCH_MAX_AGE_SECS);
    let mut recent: Vec<&OutboxEntry> = slice.outbox().iter().collect();
    recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let candidate = recent
        .into_iter()
        .take(STRUCTURAL_MATCH_WINDOW)
        .filter(|e| e.created_at >= cutoff)
        .filter(|e| e.server_id.is_none())
        .find(|e| e.payload_fingerprint == fingerprint)
        .map(|e| e.temp_id.clone())?;
    slice
        .take_outbox(&candidate)
        .map(|entry| (entry, MatchStrategy::Structural))
}

#[async_trait]
impl PushEventHandler for ReconciliationEngine {
    async fn handle_event(&self, event: &PushEvent) {
        if let PushEvent::Resource(resource_event) = event {
            self.apply(resource_event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{LocalStore, QueryParams, ResourceRepository, ResourceType};
    use crate::store::MemoryLocalStore;
    use crate::test_support::FakeRemote;
    use serde_json::{json, Map, Value};

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn event(op: ResourceOperation, id: &str, payload: Value, temp_id: Option<&str>) -> ResourceEvent {
        ResourceEvent {
            operation: op,
            resource_type: "patients".to_string(),
            id: id.to_string(),
            payload: obj(payload),
            session_id: None,
            temp_id: temp_id.map(str::to_string),
        }
    }

    struct Fixture {
        remote: Arc<FakeRemote>,
        local: Arc<MemoryLocalStore>,
        store: Arc<ResourceStore>,
        repo: ResourceRepository,
        engine: ReconciliationEngine,
    }

    fn fixture() -> Fixture {
        let remote = Arc::new(FakeRemote::new());
        let local = Arc::new(MemoryLocalStore::new());
        let store = Arc::new(ResourceStore::new());
        let repo = ResourceRepository::new(
            ResourceType::parse("patients").unwrap(),
            remote.clone(),
            local.clone(),
            store.clone(),
        );
        let engine = ReconciliationEngine::new("patients", store.clone(), local.clone());
        Fixture {
            remote,
            local,
            store,
            repo,
            engine,
        }
    }

    fn optimistic_count(store: &ResourceStore) -> usize {
        store
            .read("patients", |s| s.map(|s| s.optimistic_count()))
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn created_event_with_temp_id_confirms_optimistic_resource() {
        let f = fixture();
        let pending = f.repo.add(obj(json!({ "name": "Ana" }))).await.unwrap();
        let temp_id = pending.temp_id.clone().unwrap();

        let outcome = f
            .engine
            .apply(&event(
                ResourceOperation::Created,
                "p-100",
                json!({ "id": "p-100", "name": "Ana" }),
                Some(&temp_id),
            ))
            .await;

        assert!(matches!(
            outcome,
            ReconcileOutcome::Confirmed { strategy: MatchStrategy::Correlation, .. }
        ));
        let snapshot = f.store.snapshot("patients");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key(), Some("p-100"));
        assert!(snapshot[0].temp_id.is_none());
        assert!(f.store.outbox_entries("patients").is_empty());
        let rows = f.local.list_resources("patients").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key(), Some("p-100"));
    }

    #[tokio::test]
    async fn created_event_matches_echoed_server_id() {
        let f = fixture();
        f.repo.add(obj(json!({ "name": "Ana" }))).await.unwrap();
        let server_id = f.store.outbox_entries("patients")[0]
            .server_id
            .clone()
            .unwrap();

        let outcome = f
            .engine
            .apply(&event(
                ResourceOperation::Created,
                &server_id,
                json!({ "name": "Ana (normalized)" }),
                None,
            ))
            .await;
        assert!(matches!(
            outcome,
            ReconcileOutcome::Confirmed { strategy: MatchStrategy::ServerId, .. }
        ));
        assert_eq!(optimistic_count(&f.store), 0);
    }

    #[tokio::test]
    async fn structural_fallback_matches_identical_payload() {
        let f = fixture();
        f.store.mutate("patients", |s| {
            s.open_outbox(OutboxEntry::new(
                "patients",
                "tmp_a",
                payload_fingerprint(&obj(json!({ "name": "Ana" }))),
            ));
            s.push(Resource::optimistic("patients", "tmp_a", obj(json!({ "name": "Ana" }))));
        });

        let outcome = f
            .engine
            .apply(&event(
                ResourceOperation::Created,
                "p-7",
                json!({ "id": "p-7", "name": "Ana", "createdAt": "2024-01-01T00:00:00Z" }),
                None,
            ))
            .await;
        assert!(matches!(
            outcome,
            ReconcileOutcome::Confirmed { strategy: MatchStrategy::Structural, .. }
        ));
        assert_eq!(f.store.snapshot("patients").len(), 1);
    }

    #[tokio::test]
    async fn structural_fallback_ignores_stale_entries() {
        let f = fixture();
        let mut stale = OutboxEntry::new(
            "patients",
            "tmp_old",
            payload_fingerprint(&obj(json!({ "name": "Ana" }))),
        );
        stale.created_at = Utc::now() - Duration::seconds(STRUCTURAL_MATCH_MAX_AGE_SECS + 60);
        f.store.mutate("patients", |s| {
            s.open_outbox(stale);
        });

        let outcome = f
            .engine
            .apply(&event(ResourceOperation::Created, "p-1", json!({ "name": "Ana" }), None))
            .await;
        assert!(matches!(outcome, ReconcileOutcome::Appended(_)));
        assert_eq!(f.store.outbox_entries("patients").len(), 1);
    }

    #[tokio::test]
    async fn query_before_confirmation_keeps_one_row_per_id() {
        let f = fixture();
        let pending = f.repo.add(obj(json!({ "name": "Ana" }))).await.unwrap();
        let temp_id = pending.temp_id.clone().unwrap();
        let server_id = f.store.outbox_entries("patients")[0]
            .server_id
            .clone()
            .unwrap();

        f.repo.query(&QueryParams::new()).await.unwrap();
        let listed = f.store.snapshot("patients");
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_optimistic);

        f.engine
            .apply(&event(
                ResourceOperation::Created,
                &server_id,
                json!({ "id": server_id, "name": "Ana" }),
                Some(&temp_id),
            ))
            .await;

        let snapshot = f.store.snapshot("patients");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key(), Some(server_id.as_str()));
        assert!(!snapshot[0].is_optimistic);
        let rows = f.local.list_resources("patients").await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn confirmation_removes_a_listed_copy_of_the_same_id() {
        let f = fixture();
        f.store.mutate("patients", |s| {
            s.open_outbox(OutboxEntry::new("patients", "tmp_a", "fp".to_string()));
            s.push(Resource::optimistic("patients", "tmp_a", obj(json!({ "name": "Ana" }))));
            s.push(Resource::confirmed("patients", "p-5", obj(json!({ "name": "Ana" }))));
        });

        f.engine
            .apply(&event(
                ResourceOperation::Created,
                "p-5",
                json!({ "id": "p-5", "name": "Ana" }),
                Some("tmp_a"),
            ))
            .await;

        let snapshot = f.store.snapshot("patients");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key(), Some("p-5"));
    }

    #[tokio::test]
    async fn duplicate_created_event_is_idempotent() {
        let f = fixture();
        let pending = f.repo.add(obj(json!({ "name": "Ana" }))).await.unwrap();
        let temp_id = pending.temp_id.unwrap();
        let created = event(
            ResourceOperation::Created,
            "p-1",
            json!({ "id": "p-1", "name": "Ana" }),
            Some(&temp_id),
        );

        f.engine.apply(&created).await;
        let first = f.store.snapshot("patients");
        let outcome = f.engine.apply(&created).await;
        let second = f.store.snapshot("patients");

        assert!(matches!(outcome, ReconcileOutcome::Replaced(_)));
        assert_eq!(first.len(), second.len());
        assert_eq!(
            first.iter().map(|r| (r.key().map(str::to_string), r.data.clone())).collect::<Vec<_>>(),
            second.iter().map(|r| (r.key().map(str::to_string), r.data.clone())).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn no_orphan_optimism_after_interleaved_adds_and_confirmations() {
        let f = fixture();
        let a = f.repo.add(obj(json!({ "name": "A" }))).await.unwrap();
        let b = f.repo.add(obj(json!({ "name": "B" }))).await.unwrap();
        f.remote.set_failing(true);
        assert!(f.repo.add(obj(json!({ "name": "C" }))).await.is_err());
        f.remote.set_failing(false);

        assert_eq!(optimistic_count(&f.store), f.store.outbox_entries("patients").len());

        f.engine
            .apply(&event(
                ResourceOperation::Created,
                "p-b",
                json!({ "name": "B" }),
                b.temp_id.as_deref(),
            ))
            .await;
        assert_eq!(optimistic_count(&f.store), 1);
        assert_eq!(f.store.outbox_entries("patients").len(), 1);

        f.engine
            .apply(&event(
                ResourceOperation::Created,
                "p-a",
                json!({ "name": "A" }),
                a.temp_id.as_deref(),
            ))
            .await;
        assert_eq!(optimistic_count(&f.store), 0);
        assert!(f.store.outbox_entries("patients").is_empty());
        assert!(f.local.list_outbox_entries(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn updated_and_deleted_events_for_known_ids() {
        let f = fixture();
        f.engine
            .apply(&event(ResourceOperation::Created, "p-1", json!({ "name": "Ana", "age": 30 }), None))
            .await;
        let outcome = f
            .engine
            .apply(&event(ResourceOperation::Updated, "p-1", json!({ "age": 31 }), None))
            .await;
        let ReconcileOutcome::Updated(updated) = outcome else {
            panic!("expected update");
        };
        assert_eq!(updated.data["name"], json!("Ana"));
        assert_eq!(updated.data["age"], json!(31));

        let outcome = f
            .engine
            .apply(&event(ResourceOperation::Deleted, "p-1", json!({}), None))
            .await;
        assert_eq!(outcome, ReconcileOutcome::Deleted("p-1".to_string()));
        assert!(f.store.snapshot("patients").is_empty());
        assert!(f.local.list_resources("patients").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn events_for_unknown_ids_are_dropped() {
        let f = fixture();
        let update = f
            .engine
            .apply(&event(ResourceOperation::Updated, "ghost", json!({ "age": 1 }), None))
            .await;
        let delete = f
            .engine
            .apply(&event(ResourceOperation::Deleted, "ghost", json!({}), None))
            .await;
        assert!(matches!(update, ReconcileOutcome::Dropped(_)));
        assert!(matches!(delete, ReconcileOutcome::Dropped(_)));
        assert!(f.store.snapshot("patients").is_empty());
    }
}
