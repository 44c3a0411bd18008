//! Runtime configuration and defaults for the sync engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reachability probe cadence in seconds.
pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

/// Upper bound for a single health probe in milliseconds.
pub const HEALTH_CHECK_TIMEOUT_MS: u64 = 3_000;

/// Failed probes in a row after which remote requests are no longer admitted.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Lifetime of a cached search result in seconds.
pub const SEARCH_CACHE_TTL_SECS: u64 = 5 * 60;

/// Timeout for remote resource API calls.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Number of newest outbox entries considered by the structural match fallback.
pub const STRUCTURAL_MATCH_WINDOW: usize = 10;

/// Outbox entries older than this are never matched structurally.
pub const STRUCTURAL_MATCH_MAX_AGE_SECS: i64 = 5 * 60;

pub const DEFAULT_RESOURCE_TYPES: [&str; 6] = [
    "patients",
    "treatments",
    "appointments",
    "sales",
    "sessions",
    "messages",
];

pub const DEFAULT_DRAFT_RESOURCE_TYPES: [&str; 3] = ["patients", "treatments", "appointments"];

/// Identity tuple a push channel and the resource endpoint are scoped to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelIdentity {
    pub business_id: String,
    pub user_id: String,
    pub location_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub api_base_url: Option<String>,
    pub push_address: Option<String>,
    pub identity: ChannelIdentity,
    pub data_dir: String,
    pub health_interval_secs: u64,
    pub health_timeout_ms: u64,
    pub max_consecutive_failures: u32,
    pub search_cache_ttl_secs: u64,
    pub request_timeout_secs: u64,
    pub resource_types: Vec<String>,
    pub draft_resource_types: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            push_address: None,
            identity: ChannelIdentity::default(),
            data_dir: "clinicsync_data".to_string(),
            health_interval_secs: HEALTH_CHECK_INTERVAL_SECS,
            health_timeout_ms: HEALTH_CHECK_TIMEOUT_MS,
            max_consecutive_failures: MAX_CONSECUTIVE_FAILURES,
            search_cache_ttl_secs: SEARCH_CACHE_TTL_SECS,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            resource_types: DEFAULT_RESOURCE_TYPES.iter().map(|t| t.to_string()).collect(),
            draft_resource_types: DEFAULT_DRAFT_RESOURCE_TYPES
                .iter()
                .map(|t| t.to_string())
                .collect(),
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_value(name)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("[Config] Ignoring {}: '{}' is not a valid number", name, raw);
            None
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `CLINIC_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.api_base_url = env_value("CLINIC_API_URL");
        config.push_address = env_value("CLINIC_PUSH_URL");
        if let Some(value) = env_value("CLINIC_BUSINESS_ID") {
            config.identity.business_id = value;
        }
        if let Some(value) = env_value("CLINIC_USER_ID") {
            config.identity.user_id = value;
        }
        if let Some(value) = env_value("CLINIC_LOCATION_ID") {
            config.identity.location_id = value;
        }
        if let Some(value) = env_value("CLINIC_DATA_DIR") {
            config.data_dir = value;
        }
        if let Some(value) = env_number("CLINIC_HEALTH_INTERVAL_SECS") {
            config.health_interval_secs = value;
        }
        if let Some(value) = env_number("CLINIC_HEALTH_TIMEOUT_MS") {
            config.health_timeout_ms = value;
        }
        if let Some(value) = env_number("CLINIC_MAX_CONSECUTIVE_FAILURES") {
            config.max_consecutive_failures = value;
        }
        config
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn search_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.search_cache_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn is_draft_aware(&self, resource_type: &str) -> bool {
        self.draft_resource_types.iter().any(|t| t == resource_type)
    }
}
