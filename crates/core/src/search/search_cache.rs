//! TTL cache in front of remote search.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use tokio::time::Instant;

use super::search_model::{SearchKey, SearchRequest};
use crate::errors::Result;
use crate::resources::{RemoteResourceApi, Resource};

#[derive(Debug, Clone)]
pub struct SearchCacheEntry {
    pub key: SearchKey,
    pub results: Vec<Resource>,
    pub timestamp: Instant,
}

pub struct SearchCache {
    remote: Arc<dyn RemoteResourceApi>,
    ttl: Duration,
    entries: Mutex<HashMap<SearchKey, SearchCacheEntry>>,
}

impl SearchCache {
    pub fn new(remote: Arc<dyn RemoteResourceApi>, ttl: Duration) -> Self {
        Self {
            remote,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<SearchKey, SearchCacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Always asks the remote service; successful results replace the cached entry.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<Resource>> {
        let values = self.remote.search(request).await?;
        let mut results = Vec::with_capacity(values.len());
        for value in values {
            match Resource::from_remote(&request.resource_type, value, None) {
                Ok(resource) => results.push(resource),
                Err(err) => debug!("[SearchCache] Skipping undecodable result: {}", err),
            }
        }
        let key = request.key();
        self.entries().insert(
            key.clone(),
            SearchCacheEntry {
                key,
                results: results.clone(),
                timestamp: Instant::now(),
            },
        );
        Ok(results)
    }

    /// Remote search; `fallback` runs only if the remote attempt fails and its
    /// results are never cached.
    pub async fn search_with_fallback<F, Fut>(
        &self,
        request: &SearchRequest,
        fallback: F,
    ) -> Result<Vec<Resource>>
    where
        F: FnOnce(SearchRequest) -> Fut,
        Fut: Future<Output = Result<Vec<Resource>>>,
    {
        match self.search(request).await {
            Ok(results) => Ok(results),
            Err(err) => {
                warn!(
                    "[SearchCache] Remote search on {}.{} failed, using fallback: {}",
                    request.resource_type, request.field, err
                );
                fallback(request.clone()).await
            }
        }
    }

    /// Cached results if present and fresh. Expired entries are evicted.
    pub fn get_cached(&self, resource_type: &str, field: &str, term: &str) -> Option<Vec<Resource>> {
        let key = SearchKey::new(resource_type, field, term);
        let mut entries = self.entries();
        let fresh = entries
            .get(&key)
            .map(|entry| entry.timestamp.elapsed() <= self.ttl)?;
        if fresh {
            entries.get(&key).map(|entry| entry.results.clone())
        } else {
            entries.remove(&key);
            None
        }
    }

    pub fn invalidate(&self, resource_type: &str) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|key, _| key.resource_type != resource_type);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
