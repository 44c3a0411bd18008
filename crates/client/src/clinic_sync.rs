//! Composition root: one `ClinicSync` owns every repository, the shared resource
//! state, the reachability monitor, the push transport and the query modification
//! channel for a single identity tuple.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use futures::future::join_all;
use log::{debug, info, warn};
use serde_json::{Map, Value};
use tokio::sync::watch;

use clinicsync_core::commands::{CommandOutcome, ResourceCommand};
use clinicsync_core::config::SyncConfig;
use clinicsync_core::drafts::{Draft, DraftAwareItem, DraftNotificationHandler, DraftRepository};
use clinicsync_core::errors::{Error, Result};
use clinicsync_core::events::SubscriptionId;
use clinicsync_core::health::{HealthStatus, ReachabilityMonitor};
use clinicsync_core::queries::{
    EffectiveQuery, QueryModification, QueryModificationOp, QueryModificationService,
};
use clinicsync_core::resources::{
    LocalStore, QueryParams, Resource, ResourceObserver, ResourceRepository, ResourceStore,
};
use clinicsync_core::search::{SearchCache, SearchRequest};
use clinicsync_core::sync::ReconciliationEngine;
use clinicsync_core::transport::{
    EventTransport, MessageSnapshot, PushEventHandler, TransportStatus,
    EVENT_AGENT_DRAFTS_LISTED, EVENT_AGENT_DRAFT_CANCELLED, EVENT_AGENT_DRAFT_COMMITTED,
    EVENT_AGENT_DRAFT_CREATED, EVENT_AGENT_DRAFT_UPDATED,
};
use clinicsync_remote::{
    HttpHealthProbe, MetaTokenProvider, ResourceApiClient, TcpPushConnector, TokenProvider,
};
use clinicsync_storage_sqlite::SqliteLocalStore;

use crate::builder::ClinicSyncBuilder;
use crate::validation::{require_id, require_object, ResourceValidator};

const DRAFT_EVENT_KINDS: [&str; 5] = [
    EVENT_AGENT_DRAFT_CREATED,
    EVENT_AGENT_DRAFT_UPDATED,
    EVENT_AGENT_DRAFT_COMMITTED,
    EVENT_AGENT_DRAFT_CANCELLED,
    EVENT_AGENT_DRAFTS_LISTED,
];

/// Everything wired for one resource type.
pub(crate) struct ResourceSlot {
    pub repository: Arc<ResourceRepository>,
    pub engine: Arc<ReconciliationEngine>,
    pub drafts: Option<Arc<DraftRepository>>,
    pub validator: Option<Arc<dyn ResourceValidator>>,
}

pub struct ClinicSync {
    config: SyncConfig,
    store: Arc<ResourceStore>,
    local: Arc<dyn LocalStore>,
    slots: BTreeMap<String, ResourceSlot>,
    monitor: ReachabilityMonitor,
    transport: Option<EventTransport>,
    search: SearchCache,
    queries: QueryModificationService,
    handler_ids: Mutex<Vec<SubscriptionId>>,
    started: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClinicSync {
    pub fn builder(config: SyncConfig) -> ClinicSyncBuilder {
        ClinicSyncBuilder::new(config)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        config: SyncConfig,
        store: Arc<ResourceStore>,
        local: Arc<dyn LocalStore>,
        slots: BTreeMap<String, ResourceSlot>,
        monitor: ReachabilityMonitor,
        transport: Option<EventTransport>,
        search: SearchCache,
        queries: QueryModificationService,
    ) -> Self {
        Self {
            config,
            store,
            local,
            slots,
            monitor,
            transport,
            search,
            queries,
            handler_ids: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Wires the production stack: SQLite store under `data_dir`, the HTTP
    /// resource client and health probe, and the TCP push connector when a push
    /// address is configured.
    pub fn open(config: SyncConfig) -> anyhow::Result<Self> {
        let api_base_url = config
            .api_base_url
            .clone()
            .context("No API base URL configured (set CLINIC_API_URL)")?;

        let local: Arc<dyn LocalStore> = Arc::new(
            SqliteLocalStore::open(&config.data_dir)
                .with_context(|| format!("Failed to open local store in {}", config.data_dir))?,
        );
        let tokens: Arc<dyn TokenProvider> = Arc::new(MetaTokenProvider::new(local.clone()));

        let remote = ResourceApiClient::with_timeout(
            &api_base_url,
            config.identity.clone(),
            tokens.clone(),
            config.request_timeout(),
        )
        .context("Failed to create resource API client")?;
        let probe = HttpHealthProbe::with_timeout(&api_base_url, config.health_timeout())
            .context("Failed to create health probe")?;

        let mut builder = ClinicSyncBuilder::new(config.clone())
            .remote(Arc::new(remote))
            .local_store(local)
            .health_probe(Arc::new(probe));
        if let Some(address) = config.push_address.as_deref() {
            builder = builder.connector(Arc::new(TcpPushConnector::new(address, tokens)));
        }
        let sync = builder.build().context("Failed to assemble sync engine")?;
        info!(
            "[ClinicSync] Opened for business {} location {} ({} resource types)",
            config.identity.business_id,
            config.identity.location_id,
            sync.slots.len()
        );
        Ok(sync)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn resource_types(&self) -> Vec<String> {
        self.slots.keys().cloned().collect()
    }

    pub fn local_store(&self) -> Arc<dyn LocalStore> {
        Arc::clone(&self.local)
    }

    /// Hydrates every repository from the local store, restores query
    /// modifications, registers push handlers, starts monitoring and connects.
    /// A failed connect is logged and left visible through `transport_status`.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("[ClinicSync] start() called on a running instance");
            return Ok(());
        }

        let hydrated = join_all(self.slots.values().map(|slot| slot.repository.hydrate())).await;
        for (resource_type, result) in self.slots.keys().zip(hydrated) {
            match result {
                Ok(count) => debug!("[ClinicSync] Hydrated {} {} rows", count, resource_type),
                Err(err) => warn!("[ClinicSync] Hydrating {} failed: {}", resource_type, err),
            }
        }

        let restored = match self.queries.restore().await {
            Ok(restored) => restored,
            Err(err) => {
                // nothing was registered yet, so a later start() can retry
                self.started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        if restored > 0 {
            info!("[ClinicSync] Restored {} query modifications", restored);
        }

        self.register_handlers();
        self.monitor.start_monitoring().await;

        if let Some(transport) = &self.transport {
            if let Err(err) = transport.connect().await {
                warn!("[ClinicSync] Push channel unavailable: {}", err);
            }
        }
        Ok(())
    }

    fn register_handlers(&self) {
        let Some(transport) = &self.transport else {
            return;
        };
        let mut ids = lock(&self.handler_ids);
        for (resource_type, slot) in &self.slots {
            let engine: Arc<dyn PushEventHandler> = slot.engine.clone();
            ids.push(transport.subscribe_resource(resource_type, engine));
            if let Some(drafts) = &slot.drafts {
                let handler: Arc<dyn PushEventHandler> =
                    Arc::new(DraftNotificationHandler::new(drafts.clone()));
                for kind in DRAFT_EVENT_KINDS {
                    ids.push(transport.subscribe_kind(kind, handler.clone()));
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.monitor.stop_monitoring().await;
        if let Some(transport) = &self.transport {
            transport.disconnect().await;
            for id in lock(&self.handler_ids).drain(..) {
                transport.unsubscribe(id);
            }
        }
        info!("[ClinicSync] Shut down");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn slot(&self, resource_type: &str) -> Result<&ResourceSlot> {
        self.slots.get(resource_type).ok_or_else(|| {
            Error::validation(format!("unknown resource type '{}'", resource_type))
        })
    }

    fn draft_repository(&self, resource_type: &str) -> Result<&Arc<DraftRepository>> {
        self.slot(resource_type)?.drafts.as_ref().ok_or_else(|| {
            Error::validation(format!("resource type '{}' does not support drafts", resource_type))
        })
    }

    fn admit_write(&self, resource_type: &str) -> Result<()> {
        if self.monitor.can_make_requests() {
            return Ok(());
        }
        Err(Error::Unavailable(format!(
            "{} write refused: {}",
            resource_type,
            self.monitor
                .status()
                .last_error
                .unwrap_or_else(|| "remote service unreachable".to_string())
        )))
    }

    fn validated(&self, resource_type: &str, data: Value) -> Result<(&ResourceSlot, Map<String, Value>)> {
        let slot = self.slot(resource_type)?;
        let data = require_object(data)?;
        if let Some(validator) = &slot.validator {
            validator.validate(&data)?;
        }
        Ok((slot, data))
    }

    pub async fn add(&self, resource_type: &str, data: Value) -> Result<Resource> {
        let (slot, data) = self.validated(resource_type, data)?;
        self.admit_write(resource_type)?;
        slot.repository.add(data).await
    }

    pub async fn update(&self, resource_type: &str, id: &str, data: Value) -> Result<Resource> {
        let id = require_id(id)?;
        let (slot, data) = self.validated(resource_type, data)?;
        self.admit_write(resource_type)?;
        slot.repository.update(id, data).await
    }

    pub async fn remove(&self, resource_type: &str, id: &str) -> Result<bool> {
        let id = require_id(id)?;
        let slot = self.slot(resource_type)?;
        self.admit_write(resource_type)?;
        slot.repository.remove(id).await
    }

    pub async fn get_by_id(&self, resource_type: &str, id: &str) -> Result<Option<Resource>> {
        let id = require_id(id)?;
        let slot = self.slot(resource_type)?;
        if self.monitor.can_make_requests() {
            slot.repository.get_by_id(id).await
        } else {
            slot.repository.get_local(id).await
        }
    }

    /// Runs the type's effective query with `overrides` layered on top.
    pub async fn query(&self, resource_type: &str, overrides: &QueryParams) -> Result<Vec<Resource>> {
        let slot = self.slot(resource_type)?;
        let params = self
            .queries
            .effective_query(resource_type)
            .to_params()
            .merged_with(overrides);
        if self.monitor.can_make_requests() {
            slot.repository.query(&params).await
        } else {
            debug!("[ClinicSync] Remote suspended, reading {} locally", resource_type);
            slot.repository.query_local(&params).await
        }
    }

    /// Drops an optimistic resource the server never confirmed.
    pub async fn rollback(&self, resource_type: &str, temp_id: &str) -> Result<bool> {
        let temp_id = require_id(temp_id)?;
        Ok(self.slot(resource_type)?.repository.rollback(temp_id).await)
    }

    pub async fn execute(&self, command: &dyn ResourceCommand) -> Result<CommandOutcome> {
        let slot = self.slot(command.resource_type())?;
        if self.monitor.can_make_requests() {
            return command.execute(&slot.repository).await;
        }
        if command.is_write() {
            self.admit_write(command.resource_type())?;
        }
        command.execute_local(&slot.repository).await
    }

    /// Remote search through the cache. While requests are suspended the local
    /// store is filtered instead.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<Resource>> {
        let slot = self.slot(&request.resource_type)?;
        if !self.monitor.can_make_requests() {
            return local_search(&slot.repository, request).await;
        }
        self.search.search(request).await
    }

    /// Like [`search`](Self::search) but a failed remote attempt falls back to the
    /// local store.
    pub async fn search_with_fallback(&self, request: &SearchRequest) -> Result<Vec<Resource>> {
        let slot = self.slot(&request.resource_type)?;
        if !self.monitor.can_make_requests() {
            return local_search(&slot.repository, request).await;
        }
        let repository = slot.repository.clone();
        self.search
            .search_with_fallback(request, |request| async move {
                local_search(&repository, &request).await
            })
            .await
    }

    pub fn cached_search(&self, resource_type: &str, field: &str, term: &str) -> Option<Vec<Resource>> {
        self.search.get_cached(resource_type, field, term)
    }

    pub fn clear_search_cache(&self) {
        self.search.clear();
    }

    pub fn health_status(&self) -> HealthStatus {
        self.monitor.status()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<HealthStatus> {
        self.monitor.subscribe()
    }

    pub fn set_network_online(&self, online: bool) {
        self.monitor.set_network_online(online);
    }

    pub async fn check_health_now(&self) -> HealthStatus {
        self.monitor.check_now().await
    }

    pub fn subscribe(
        &self,
        resource_type: &str,
        observer: Arc<dyn ResourceObserver>,
    ) -> Result<SubscriptionId> {
        self.slot(resource_type)?;
        Ok(self.store.subscribe(resource_type, observer))
    }

    /// Removes a store observer or a transport listener, whichever owns `id`.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        if self.store.unsubscribe(id) {
            return true;
        }
        self.transport
            .as_ref()
            .is_some_and(|transport| transport.unsubscribe(id))
    }

    pub fn snapshot(&self, resource_type: &str) -> Vec<Resource> {
        self.store.snapshot(resource_type)
    }

    pub fn on_message<F>(&self, listener: F) -> Result<SubscriptionId>
    where
        F: Fn(&MessageSnapshot) + Send + Sync + 'static,
    {
        Ok(self.transport()?.on_message(listener))
    }

    pub fn on_session_update<F>(&self, listener: F) -> Result<SubscriptionId>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Ok(self.transport()?.on_session_update(listener))
    }

    pub fn on_transport_error<F>(&self, listener: F) -> Result<SubscriptionId>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Ok(self.transport()?.on_error(listener))
    }

    pub fn subscribe_kind(&self, kind: &str, handler: Arc<dyn PushEventHandler>) -> Result<SubscriptionId> {
        Ok(self.transport()?.subscribe_kind(kind, handler))
    }

    pub fn create_draft(
        &self,
        resource_type: &str,
        data: Value,
        session_id: Option<&str>,
        target_id: Option<&str>,
    ) -> Result<Draft> {
        let drafts = self.draft_repository(resource_type)?;
        drafts.create_draft(require_object(data)?, session_id, target_id)
    }

    pub fn update_draft(&self, resource_type: &str, draft_id: &str, data: Value) -> Result<Draft> {
        self.draft_repository(resource_type)?
            .update_draft(draft_id, require_object(data)?)
    }

    /// Validates the merged draft data, then writes it through the repository.
    pub async fn commit_draft(&self, resource_type: &str, draft_id: &str) -> Result<Resource> {
        let drafts = self.draft_repository(resource_type)?;
        let draft = drafts
            .get_draft(draft_id)
            .ok_or_else(|| Error::not_found(format!("draft {}", draft_id)))?;
        if let Some(validator) = &self.slot(resource_type)?.validator {
            validator.validate(&draft.data)?;
        }
        self.admit_write(resource_type)?;
        drafts.commit_draft(draft_id).await
    }

    pub fn cancel_draft(&self, resource_type: &str, draft_id: &str) -> Result<Draft> {
        self.draft_repository(resource_type)?.cancel_draft(draft_id)
    }

    pub fn get_draft(&self, resource_type: &str, draft_id: &str) -> Result<Option<Draft>> {
        Ok(self.draft_repository(resource_type)?.get_draft(draft_id))
    }

    pub fn list_drafts(&self, resource_type: &str, session_id: Option<&str>) -> Result<Vec<Draft>> {
        Ok(self.draft_repository(resource_type)?.list_drafts(session_id))
    }

    /// Drafts of every draft-aware type for one session.
    pub fn list_session_drafts(&self, session_id: &str) -> Vec<Draft> {
        self.draft_repositories()
            .flat_map(|drafts| drafts.list_drafts(Some(session_id)))
            .collect()
    }

    pub async fn query_with_drafts(
        &self,
        resource_type: &str,
        overrides: &QueryParams,
    ) -> Result<Vec<DraftAwareItem>> {
        let drafts = self.draft_repository(resource_type)?;
        let params = self
            .queries
            .effective_query(resource_type)
            .to_params()
            .merged_with(overrides);
        drafts.query_with_drafts(&params).await
    }

    /// Commits every open draft of the session across types, one result per draft.
    pub async fn commit_session(&self, session_id: &str) -> Result<Vec<(String, Result<Resource>)>> {
        let session_id = require_id(session_id)?;
        if !self.monitor.can_make_requests() {
            return Err(Error::Unavailable(format!(
                "cannot commit session {} while the remote service is unreachable",
                session_id
            )));
        }
        let mut results = Vec::new();
        for drafts in self.draft_repositories() {
            results.extend(drafts.commit_session(session_id).await);
        }
        Ok(results)
    }

    pub fn cancel_session(&self, session_id: &str) -> Vec<(String, Result<Draft>)> {
        self.draft_repositories()
            .flat_map(|drafts| drafts.cancel_session(session_id))
            .collect()
    }

    fn draft_repositories(&self) -> impl Iterator<Item = &Arc<DraftRepository>> {
        self.slots.values().filter_map(|slot| slot.drafts.as_ref())
    }

    pub fn set_base_query(&self, resource_type: &str, query: EffectiveQuery) -> Result<()> {
        self.slot(resource_type)?;
        self.queries.set_base_query(resource_type, query)
    }

    pub fn effective_query(&self, resource_type: &str) -> EffectiveQuery {
        self.queries.effective_query(resource_type)
    }

    pub async fn modify_query(
        &self,
        session_id: &str,
        resource_type: &str,
        ops: Vec<QueryModificationOp>,
    ) -> Result<QueryModification> {
        self.slot(resource_type)?;
        self.queries.modify_query(session_id, resource_type, ops).await
    }

    pub async fn revert_query_modification(&self, modification_id: &str) -> Result<Vec<QueryModification>> {
        self.queries.revert_query_modification(modification_id).await
    }

    pub async fn revert_all_modifications_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<QueryModification>> {
        self.queries
            .revert_all_modifications_for_session(session_id)
            .await
    }

    pub async fn reset_query(&self, resource_type: &str) -> Result<Vec<QueryModification>> {
        self.slot(resource_type)?;
        self.queries.reset_query(resource_type).await
    }

    pub fn list_query_modifications(&self, session_id: Option<&str>) -> Vec<QueryModification> {
        self.queries.list_modifications(session_id)
    }

    fn transport(&self) -> Result<&EventTransport> {
        self.transport
            .as_ref()
            .ok_or_else(|| Error::transport("no push channel configured"))
    }

    pub async fn connect(&self) -> Result<()> {
        self.transport()?.connect().await
    }

    pub async fn disconnect(&self) {
        if let Some(transport) = &self.transport {
            transport.disconnect().await;
        }
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.transport()?.reconnect().await
    }

    pub async fn send_message(&self, content: &str, extra: Option<Map<String, Value>>) -> Result<()> {
        if content.trim().is_empty() {
            return Err(Error::validation("message content must not be empty"));
        }
        self.transport()?.send_message(content, extra).await
    }

    pub fn transport_status(&self) -> TransportStatus {
        self.transport
            .as_ref()
            .map(EventTransport::status)
            .unwrap_or_default()
    }
}

async fn local_search(repository: &ResourceRepository, request: &SearchRequest) -> Result<Vec<Resource>> {
    let mut hits: Vec<Resource> = repository
        .query_local(&QueryParams::new())
        .await?
        .into_iter()
        .filter(|resource| request.matches(resource))
        .collect();
    if let Some(limit) = request.limit {
        hits.truncate(limit as usize);
    }
    Ok(hits)
}
