//! Explicit construction of a [`ClinicSync`] instance from its collaborators.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use clinicsync_core::config::SyncConfig;
use clinicsync_core::drafts::DraftRepository;
use clinicsync_core::errors::{Error, Result};
use clinicsync_core::health::{HealthProbe, MonitorConfig, ReachabilityMonitor};
use clinicsync_core::queries::QueryModificationService;
use clinicsync_core::resources::{
    LocalStore, RemoteResourceApi, ResourceRepository, ResourceStore, ResourceType,
};
use clinicsync_core::search::SearchCache;
use clinicsync_core::store::MemoryLocalStore;
use clinicsync_core::sync::ReconciliationEngine;
use clinicsync_core::transport::{EventTransport, PushConnector};

use crate::clinic_sync::{ClinicSync, ResourceSlot};
use crate::validation::ResourceValidator;

pub struct ClinicSyncBuilder {
    config: SyncConfig,
    remote: Option<Arc<dyn RemoteResourceApi>>,
    local: Option<Arc<dyn LocalStore>>,
    connector: Option<Arc<dyn PushConnector>>,
    probe: Option<Arc<dyn HealthProbe>>,
    validators: HashMap<String, Arc<dyn ResourceValidator>>,
}

impl ClinicSyncBuilder {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            remote: None,
            local: None,
            connector: None,
            probe: None,
            validators: HashMap::new(),
        }
    }

    pub fn remote(mut self, remote: Arc<dyn RemoteResourceApi>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Defaults to a process-local store when not set.
    pub fn local_store(mut self, local: Arc<dyn LocalStore>) -> Self {
        self.local = Some(local);
        self
    }

    /// Without a connector the instance runs without a push channel.
    pub fn connector(mut self, connector: Arc<dyn PushConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn validator(mut self, resource_type: &str, validator: Arc<dyn ResourceValidator>) -> Self {
        self.validators.insert(resource_type.to_string(), validator);
        self
    }

    pub fn build(self) -> Result<ClinicSync> {
        let remote = self
            .remote
            .ok_or_else(|| Error::validation("a remote resource API is required"))?;
        let probe = self
            .probe
            .ok_or_else(|| Error::validation("a health probe is required"))?;
        let local = self
            .local
            .unwrap_or_else(|| Arc::new(MemoryLocalStore::new()));

        for resource_type in self.validators.keys() {
            if !self.config.resource_types.contains(resource_type) {
                return Err(Error::validation(format!(
                    "validator registered for unknown resource type '{}'",
                    resource_type
                )));
            }
        }

        let store = Arc::new(ResourceStore::new());
        let mut slots = BTreeMap::new();
        for name in &self.config.resource_types {
            let resource_type = ResourceType::parse(name)?;
            let repository = Arc::new(ResourceRepository::new(
                resource_type,
                remote.clone(),
                local.clone(),
                store.clone(),
            ));
            let engine = Arc::new(ReconciliationEngine::new(name, store.clone(), local.clone()));
            let drafts = self
                .config
                .is_draft_aware(name)
                .then(|| Arc::new(DraftRepository::new(repository.clone())));
            slots.insert(
                name.clone(),
                ResourceSlot {
                    repository,
                    engine,
                    drafts,
                    validator: self.validators.get(name).cloned(),
                },
            );
        }

        let monitor = ReachabilityMonitor::new(probe, MonitorConfig::from(&self.config));
        let transport = self
            .connector
            .map(|connector| EventTransport::new(connector, self.config.identity.clone()));
        let search = SearchCache::new(remote, self.config.search_cache_ttl());
        let queries = QueryModificationService::new(local.clone());

        Ok(ClinicSync::assemble(
            self.config,
            store,
            local,
            slots,
            monitor,
            transport,
            search,
            queries,
        ))
    }
}
