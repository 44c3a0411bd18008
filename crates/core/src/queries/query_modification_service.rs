//! Session-scoped modifications of per-type queries with exact revert.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use log::{debug, info, warn};
use uuid::Uuid;

use super::query_model::{EffectiveQuery, ModificationStatus, QueryModification, QueryModificationOp};
use crate::errors::{Error, Result};
use crate::resources::LocalStore;

const BASELINE_META_PREFIX: &str = "query_baseline:";

fn baseline_key(repository_type: &str) -> String {
    format!("{}{}", BASELINE_META_PREFIX, repository_type)
}

#[derive(Default)]
struct QueryState {
    queries: HashMap<String, EffectiveQuery>,
    // snapshot taken before the first active modification of a type
    baselines: HashMap<String, EffectiveQuery>,
    modifications: Vec<QueryModification>,
}

impl QueryState {
    /// Restores the baseline of `repository_type` and closes its active modifications:
    /// the ones selected by `reverted` become `Reverted`, the rest `Reset`.
    fn restore<P>(&mut self, repository_type: &str, reverted: P) -> Vec<QueryModification>
    where
        P: Fn(&QueryModification) -> bool,
    {
        if let Some(baseline) = self.baselines.remove(repository_type) {
            self.queries.insert(repository_type.to_string(), baseline);
        }
        let mut changed = Vec::new();
        for modification in self.modifications.iter_mut().filter(|m| {
            m.repository_type == repository_type && m.status == ModificationStatus::Active
        }) {
            modification.status = if reverted(modification) {
                ModificationStatus::Reverted
            } else {
                ModificationStatus::Reset
            };
            changed.push(modification.clone());
        }
        changed
    }

    fn checkpoint(&self, types: &[String]) -> Checkpoint {
        Checkpoint {
            entries: types
                .iter()
                .map(|t| {
                    (
                        t.clone(),
                        self.queries.get(t).cloned(),
                        self.baselines.get(t).cloned(),
                    )
                })
                .collect(),
            modifications: self.modifications.clone(),
        }
    }

    fn roll_back(&mut self, checkpoint: Checkpoint) {
        for (repository_type, query, baseline) in checkpoint.entries {
            match query {
                Some(query) => self.queries.insert(repository_type.clone(), query),
                None => self.queries.remove(&repository_type),
            };
            match baseline {
                Some(baseline) => self.baselines.insert(repository_type, baseline),
                None => self.baselines.remove(&repository_type),
            };
        }
        self.modifications = checkpoint.modifications;
    }
}

/// In-memory state of the touched types, put back when persisting a change fails.
struct Checkpoint {
    entries: Vec<(String, Option<EffectiveQuery>, Option<EffectiveQuery>)>,
    modifications: Vec<QueryModification>,
}

pub struct QueryModificationService {
    local: Arc<dyn LocalStore>,
    state: Mutex<QueryState>,
    // serializes mutations across their persistence awaits
    writes: tokio::sync::Mutex<()>,
}

impl QueryModificationService {
    pub fn new(local: Arc<dyn LocalStore>) -> Self {
        Self {
            local,
            state: Mutex::new(QueryState::default()),
            writes: tokio::sync::Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the base query of a type. Refused while modifications are active.
    pub fn set_base_query(&self, repository_type: &str, query: EffectiveQuery) -> Result<()> {
        let mut state = self.state();
        if state.baselines.contains_key(repository_type) {
            return Err(Error::validation(format!(
                "{} has active query modifications",
                repository_type
            )));
        }
        state.queries.insert(repository_type.to_string(), query);
        Ok(())
    }

    pub fn effective_query(&self, repository_type: &str) -> EffectiveQuery {
        self.state()
            .queries
            .get(repository_type)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn modify_query(
        &self,
        session_id: &str,
        repository_type: &str,
        ops: Vec<QueryModificationOp>,
    ) -> Result<QueryModification> {
        if session_id.trim().is_empty() {
            return Err(Error::validation("session id must not be empty"));
        }
        if ops.is_empty() {
            return Err(Error::validation("a query modification needs at least one operation"));
        }

        let _write = self.writes.lock().await;
        let types = [repository_type.to_string()];
        let (checkpoint, modification, new_baseline) = {
            let mut state = self.state();
            let checkpoint = state.checkpoint(&types);
            let current = state
                .queries
                .get(repository_type)
                .cloned()
                .unwrap_or_default();
            let new_baseline = if state.baselines.contains_key(repository_type) {
                None
            } else {
                state
                    .baselines
                    .insert(repository_type.to_string(), current.clone());
                Some(current.clone())
            };

            let mut next = current;
            for op in &ops {
                next.apply(op);
            }
            state.queries.insert(repository_type.to_string(), next);

            let modification = QueryModification {
                id: Uuid::now_v7().to_string(),
                session_id: session_id.to_string(),
                repository_type: repository_type.to_string(),
                modifications: ops,
                status: ModificationStatus::Active,
                timestamp: Utc::now(),
            };
            state.modifications.push(modification.clone());
            (checkpoint, modification, new_baseline)
        };

        let persisted = self
            .persist_opened(repository_type, new_baseline.as_ref(), &modification)
            .await;
        if let Err(err) = persisted {
            warn!("[QueryMods] Could not persist {} modification: {}", repository_type, err);
            self.state().roll_back(checkpoint);
            return Err(err);
        }
        debug!(
            "[QueryMods] Session {} modified {} ({} ops)",
            session_id,
            repository_type,
            modification.modifications.len()
        );
        Ok(modification)
    }

    /// Restores the pre-modification query of the type. The modification becomes
    /// `Reverted`, other active ones on the same type `Reset`.
    pub async fn revert_query_modification(&self, modification_id: &str) -> Result<Vec<QueryModification>> {
        let _write = self.writes.lock().await;
        let (types, checkpoint, changed) = {
            let mut state = self.state();
            let target = state
                .modifications
                .iter()
                .find(|m| m.id == modification_id)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("query modification {}", modification_id)))?;
            if target.status != ModificationStatus::Active {
                return Err(Error::validation(format!(
                    "query modification {} is already {}",
                    modification_id,
                    target.status.as_str()
                )));
            }
            let types = [target.repository_type];
            let checkpoint = state.checkpoint(&types);
            let changed = state.restore(&types[0], |m| m.id == modification_id);
            (types, checkpoint, changed)
        };
        self.persist_closed(&types, checkpoint, &changed).await?;
        Ok(changed)
    }

    pub async fn revert_all_modifications_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<QueryModification>> {
        let _write = self.writes.lock().await;
        let (types, checkpoint, changed) = {
            let mut state = self.state();
            let mut types: Vec<String> = state
                .modifications
                .iter()
                .filter(|m| m.session_id == session_id && m.status == ModificationStatus::Active)
                .map(|m| m.repository_type.clone())
                .collect();
            types.sort();
            types.dedup();
            let checkpoint = state.checkpoint(&types);
            let mut changed = Vec::new();
            for repository_type in &types {
                changed.extend(state.restore(repository_type, |m| m.session_id == session_id));
            }
            (types, checkpoint, changed)
        };
        if !types.is_empty() {
            info!(
                "[QueryMods] Reverted session {} on {}",
                session_id,
                types.join(", ")
            );
        }
        self.persist_closed(&types, checkpoint, &changed).await?;
        Ok(changed)
    }

    /// Restores the baseline and marks every active modification of the type `Reset`.
    pub async fn reset_query(&self, repository_type: &str) -> Result<Vec<QueryModification>> {
        let _write = self.writes.lock().await;
        let types = [repository_type.to_string()];
        let (checkpoint, changed) = {
            let mut state = self.state();
            let checkpoint = state.checkpoint(&types);
            (checkpoint, state.restore(repository_type, |_| false))
        };
        self.persist_closed(&types, checkpoint, &changed).await?;
        Ok(changed)
    }

    pub fn list_modifications(&self, session_id: Option<&str>) -> Vec<QueryModification> {
        self.state()
            .modifications
            .iter()
            .filter(|m| session_id.map_or(true, |s| m.session_id == s))
            .cloned()
            .collect()
    }

    /// Reloads history and baselines from the local store and rebuilds the
    /// effective query of every type that still has active modifications.
    pub async fn restore(&self) -> Result<usize> {
        let _write = self.writes.lock().await;
        let mut history = self.local.list_query_modifications(None).await?;
        history.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        let mut active_types: Vec<String> = history
            .iter()
            .filter(|m| m.status == ModificationStatus::Active)
            .map(|m| m.repository_type.clone())
            .collect();
        active_types.sort();
        active_types.dedup();

        let mut baselines = HashMap::new();
        for repository_type in &active_types {
            match self.local.get_meta(&baseline_key(repository_type)).await? {
                Some(raw) => {
                    baselines.insert(repository_type.clone(), serde_json::from_str::<EffectiveQuery>(&raw)?);
                }
                None => warn!(
                    "[QueryMods] No baseline stored for {}; assuming the default query",
                    repository_type
                ),
            }
        }

        let mut state = self.state();
        for repository_type in &active_types {
            let baseline = baselines.remove(repository_type).unwrap_or_default();
            let mut query = baseline.clone();
            for modification in history.iter().filter(|m| {
                &m.repository_type == repository_type && m.status == ModificationStatus::Active
            }) {
                for op in &modification.modifications {
                    query.apply(op);
                }
            }
            state.baselines.insert(repository_type.clone(), baseline);
            state.queries.insert(repository_type.clone(), query);
        }
        let count = history.len();
        state.modifications = history;
        Ok(count)
    }

    async fn persist_opened(
        &self,
        repository_type: &str,
        new_baseline: Option<&EffectiveQuery>,
        modification: &QueryModification,
    ) -> Result<()> {
        if let Some(baseline) = new_baseline {
            let raw = serde_json::to_string(baseline)?;
            self.local.set_meta(&baseline_key(repository_type), &raw).await?;
        }
        self.local.put_query_modification(modification).await
    }

    /// Persists closed modifications and drops the stored baselines; on failure the
    /// in-memory state goes back to `checkpoint`.
    async fn persist_closed(
        &self,
        types: &[String],
        checkpoint: Checkpoint,
        changed: &[QueryModification],
    ) -> Result<()> {
        let result = async {
            for modification in changed {
                self.local.put_query_modification(modification).await?;
            }
            for repository_type in types {
                self.local.delete_meta(&baseline_key(repository_type)).await?;
            }
            Ok::<_, Error>(())
        }
        .await;
        if let Err(err) = &result {
            warn!("[QueryMods] Could not persist closed modifications: {}", err);
            self.state().roll_back(checkpoint);
        }
        result
    }
}
