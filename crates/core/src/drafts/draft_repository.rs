//! Draft staging on top of a resource repository.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::drafts_model::{Draft, DraftAction, DraftAwareItem, DraftPayload, DraftStatus};
use crate::errors::{Error, Result};
use crate::resources::{QueryParams, Resource, ResourceRepository};
use crate::transport::{PushEvent, PushEventHandler};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Draft-aware repository: drafts live in memory until committed through the
/// wrapped [`ResourceRepository`] or cancelled.
pub struct DraftRepository {
    repository: Arc<ResourceRepository>,
    drafts: Mutex<Vec<Draft>>,
    committing: Mutex<HashSet<String>>,
}

impl DraftRepository {
    pub fn new(repository: Arc<ResourceRepository>) -> Self {
        Self {
            repository,
            drafts: Mutex::new(Vec::new()),
            committing: Mutex::new(HashSet::new()),
        }
    }

    pub fn resource_type(&self) -> &str {
        self.repository.resource_type()
    }

    pub fn repository(&self) -> &Arc<ResourceRepository> {
        &self.repository
    }

    pub fn create_draft(
        &self,
        data: Map<String, Value>,
        session_id: Option<&str>,
        target_id: Option<&str>,
    ) -> Result<Draft> {
        if target_id.is_some_and(|t| t.trim().is_empty()) {
            return Err(Error::validation("draft target id must not be empty"));
        }
        let now = Utc::now();
        let draft = Draft {
            id: format!("draft_{}", Uuid::now_v7()),
            resource_type: self.resource_type().to_string(),
            session_id: session_id.map(str::to_string),
            target_id: target_id.map(str::to_string),
            data,
            status: DraftStatus::Draft,
            created_at: now,
            updated_at: now,
        };
        lock(&self.drafts).push(draft.clone());
        debug!("[Drafts] Created {} draft {}", self.resource_type(), draft.id);
        Ok(draft)
    }

    /// Field-replacement update. `Draft -> Updated`, `Updated -> Updated`.
    pub fn update_draft(&self, id: &str, data: Map<String, Value>) -> Result<Draft> {
        self.transition(id, |draft| {
            for (field, value) in data {
                draft.data.insert(field, value);
            }
            draft.status = DraftStatus::Updated;
        })
    }

    /// Applies the draft through the repository; only a successful write marks it committed.
    pub async fn commit_draft(&self, id: &str) -> Result<Resource> {
        let draft = self.begin_commit(id)?;

        let result = match draft.target_id.as_deref() {
            Some(target_id) => self.repository.update(target_id, draft.data.clone()).await,
            None => self.repository.add(draft.data.clone()).await,
        };
        let resource = match result {
            Ok(resource) => resource,
            Err(err) => {
                lock(&self.committing).remove(id);
                return Err(err);
            }
        };
        self.finish_commit(id);
        info!(
            "[Drafts] Committed {} draft {} as {:?}",
            self.resource_type(),
            id,
            resource.key()
        );
        Ok(resource)
    }

    pub fn cancel_draft(&self, id: &str) -> Result<Draft> {
        self.transition(id, |draft| draft.status = DraftStatus::Cancelled)
    }

    /// Committed resources with open drafts overlaid: a draft targeting a listed
    /// resource replaces it, the rest are appended.
    pub async fn query_with_drafts(&self, params: &QueryParams) -> Result<Vec<DraftAwareItem>> {
        let resources = self.repository.query(params).await?;
        let open: Vec<Draft> = lock(&self.drafts)
            .iter()
            .filter(|d| d.is_open())
            .cloned()
            .collect();

        let mut overlaid = HashSet::new();
        let mut items: Vec<DraftAwareItem> = resources
            .into_iter()
            .map(|resource| {
                let draft = open.iter().find(|d| {
                    d.target_id
                        .as_deref()
                        .is_some_and(|target| resource.matches_key(target))
                });
                match draft {
                    Some(draft) => {
                        overlaid.insert(draft.id.clone());
                        DraftAwareItem::Draft(draft.clone())
                    }
                    None => DraftAwareItem::Resource(resource),
                }
            })
            .collect();
        items.extend(
            open.into_iter()
                .filter(|d| !overlaid.contains(&d.id))
                .map(DraftAwareItem::Draft),
        );
        Ok(items)
    }

    /// Commits every open draft of the session, in creation order.
    pub async fn commit_session(&self, session_id: &str) -> Vec<(String, Result<Resource>)> {
        let mut results = Vec::new();
        for id in self.open_ids_for_session(session_id) {
            let result = self.commit_draft(&id).await;
            if let Err(err) = &result {
                warn!("[Drafts] Commit of {} in session {} failed: {}", id, session_id, err);
            }
            results.push((id, result));
        }
        results
    }

    pub fn cancel_session(&self, session_id: &str) -> Vec<(String, Result<Draft>)> {
        self.open_ids_for_session(session_id)
            .into_iter()
            .map(|id| {
                let result = self.cancel_draft(&id);
                (id, result)
            })
            .collect()
    }

    pub fn list_drafts(&self, session_id: Option<&str>) -> Vec<Draft> {
        lock(&self.drafts)
            .iter()
            .filter(|d| session_id.map_or(true, |s| d.session_id.as_deref() == Some(s)))
            .cloned()
            .collect()
    }

    pub fn get_draft(&self, id: &str) -> Option<Draft> {
        lock(&self.drafts).iter().find(|d| d.id == id).cloned()
    }

    /// Mirrors an agent-side draft change through the same transition rules.
    pub fn apply_remote(&self, action: DraftAction, payload: &DraftPayload) -> Result<Draft> {
        if payload.resource_type != self.resource_type() {
            return Err(Error::validation(format!(
                "draft {} belongs to {}",
                payload.id, payload.resource_type
            )));
        }
        match action {
            DraftAction::Created => {
                if self.get_draft(&payload.id).is_some() {
                    return self.transition(&payload.id, |draft| draft.data = payload.data.clone());
                }
                let now = Utc::now();
                let draft = Draft {
                    id: payload.id.clone(),
                    resource_type: payload.resource_type.clone(),
                    session_id: payload.session_id.clone(),
                    target_id: payload.target_id.clone(),
                    data: payload.data.clone(),
                    status: DraftStatus::Draft,
                    created_at: now,
                    updated_at: now,
                };
                lock(&self.drafts).push(draft.clone());
                Ok(draft)
            }
            DraftAction::Updated => self.transition(&payload.id, |draft| {
                draft.data = payload.data.clone();
                draft.status = DraftStatus::Updated;
            }),
            DraftAction::Committed => {
                self.transition(&payload.id, |draft| draft.status = DraftStatus::Committed)
            }
            DraftAction::Cancelled => {
                self.transition(&payload.id, |draft| draft.status = DraftStatus::Cancelled)
            }
        }
    }

    fn open_ids_for_session(&self, session_id: &str) -> Vec<String> {
        lock(&self.drafts)
            .iter()
            .filter(|d| d.is_open() && d.session_id.as_deref() == Some(session_id))
            .map(|d| d.id.clone())
            .collect()
    }

    /// Marks an open draft as committing. Lock order is `drafts` then `committing`.
    fn begin_commit(&self, id: &str) -> Result<Draft> {
        let drafts = lock(&self.drafts);
        let draft = find_open(&drafts, id)?;
        if !lock(&self.committing).insert(id.to_string()) {
            return Err(Error::validation(format!("draft {} is already being committed", id)));
        }
        Ok(draft.clone())
    }

    fn finish_commit(&self, id: &str) {
        let mut drafts = lock(&self.drafts);
        if let Some(draft) = drafts.iter_mut().find(|d| d.id == id) {
            draft.status = DraftStatus::Committed;
            draft.updated_at = Utc::now();
        }
        lock(&self.committing).remove(id);
    }

    /// Applies `change` to a non-terminal draft that is not mid-commit; anything
    /// else is left untouched.
    fn transition<F>(&self, id: &str, change: F) -> Result<Draft>
    where
        F: FnOnce(&mut Draft),
    {
        let mut drafts = lock(&self.drafts);
        find_open(&drafts, id)?;
        if lock(&self.committing).contains(id) {
            return Err(Error::validation(format!("draft {} is being committed", id)));
        }
        let draft = drafts
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| Error::not_found(format!("draft {}", id)))?;
        change(draft);
        draft.updated_at = Utc::now();
        Ok(draft.clone())
    }
}

fn find_open<'a>(drafts: &'a [Draft], id: &str) -> Result<&'a Draft> {
    let draft = drafts
        .iter()
        .find(|d| d.id == id)
        .ok_or_else(|| Error::not_found(format!("draft {}", id)))?;
    if draft.status.is_terminal() {
        return Err(Error::DraftState {
            draft_id: id.to_string(),
            status: draft.status,
        });
    }
    Ok(draft)
}

/// Routes `agent_draft_*` and `agent_drafts_listed` frames into a draft repository.
pub struct DraftNotificationHandler {
    drafts: Arc<DraftRepository>,
}

impl DraftNotificationHandler {
    pub fn new(drafts: Arc<DraftRepository>) -> Self {
        Self { drafts }
    }
}

#[async_trait]
impl PushEventHandler for DraftNotificationHandler {
    async fn handle_event(&self, event: &PushEvent) {
        let resource_type = self.drafts.resource_type();
        match event {
            PushEvent::Draft { action, draft } if draft.resource_type == resource_type => {
                if let Err(err) = self.drafts.apply_remote(*action, draft) {
                    debug!("[Drafts] Dropped agent {:?} for {}: {}", action, draft.id, err);
                }
            }
            PushEvent::DraftsListed(drafts) => {
                for draft in drafts.iter().filter(|d| d.resource_type == resource_type) {
                    let action = if self.drafts.get_draft(&draft.id).is_some() {
                        DraftAction::Updated
                    } else {
                        DraftAction::Created
                    };
                    if let Err(err) = self.drafts.apply_remote(action, draft) {
                        debug!("[Drafts] Skipped listed draft {}: {}", draft.id, err);
                    }
                }
            }
            _ => {}
        }
    }
}
