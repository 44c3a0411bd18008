use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::resources::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DraftStatus {
    Draft,
    Updated,
    Committed,
    Cancelled,
}

impl DraftStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Updated => "updated",
            Self::Committed => "committed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Staged, not-yet-committed change to a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub id: String,
    pub resource_type: String,
    pub session_id: Option<String>,
    /// Resource the draft edits; `None` means the commit creates a new one.
    pub target_id: Option<String>,
    pub data: Map<String, Value>,
    pub status: DraftStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Draft {
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Agent-side draft lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftAction {
    Created,
    Updated,
    Committed,
    Cancelled,
}

/// Draft as carried by `agent_draft_*` push frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftPayload {
    #[serde(alias = "draftId")]
    pub id: String,
    pub resource_type: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Row of a draft-aware query: a committed resource or an open draft overlaid on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DraftAwareItem {
    Resource(Resource),
    Draft(Draft),
}

impl DraftAwareItem {
    pub fn is_draft(&self) -> bool {
        matches!(self, Self::Draft(_))
    }

    pub fn data(&self) -> &Map<String, Value> {
        match self {
            Self::Resource(resource) => &resource.data,
            Self::Draft(draft) => &draft.data,
        }
    }
}
