use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Latest reachability verdict as exposed to callers and subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub can_make_requests: bool,
    pub last_error: Option<String>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            is_healthy: true,
            last_check: None,
            consecutive_failures: 0,
            can_make_requests: true,
            last_error: None,
        }
    }
}

impl HealthStatus {
    /// Fields whose change is worth a notification.
    pub(crate) fn signature(&self) -> (bool, bool, u32) {
        (
            self.is_healthy,
            self.can_make_requests,
            self.consecutive_failures,
        )
    }
}

/// What a single probe observed, before the timeout wrapper is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy { status: u16 },
    NetworkError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    Timeout { after_ms: u64 },
    Network(String),
    Unhealthy { status: u16 },
}

impl ProbeFailure {
    pub fn message(&self) -> String {
        match self {
            Self::Timeout { after_ms } => format!("health check timed out after {} ms", after_ms),
            Self::Network(detail) => format!("health check network error: {}", detail),
            Self::Unhealthy { status } => format!("health check returned status {}", status),
        }
    }
}
