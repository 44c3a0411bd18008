//! Access-token sources for the resource API and the push channel.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use clinicsync_core::resources::LocalStore;

use crate::error::{ApiError, Result};

/// Meta key under which the host application stores auth data.
pub const AUTH_META_KEY: &str = "auth";

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current bearer token, `None` when the user is signed out.
    async fn access_token(&self) -> Result<Option<String>>;
}

/// Fixed token, for tests and service accounts.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn none() -> Self {
        Self { token: None }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<Option<String>> {
        Ok(self.token.clone())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredAuth {
    token: Option<String>,
    access_token: Option<String>,
}

/// Reads `{"token": ..}` or `{"accessToken": ..}` from the local meta table on every call.
pub struct MetaTokenProvider {
    store: Arc<dyn LocalStore>,
}

impl MetaTokenProvider {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TokenProvider for MetaTokenProvider {
    async fn access_token(&self) -> Result<Option<String>> {
        let raw = self
            .store
            .get_meta(AUTH_META_KEY)
            .await
            .map_err(|e| ApiError::auth(format!("failed to read stored auth: {}", e)))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let stored: StoredAuth = serde_json::from_str(&raw)?;
        Ok(stored
            .token
            .or(stored.access_token)
            .filter(|token| !token.trim().is_empty()))
    }
}
