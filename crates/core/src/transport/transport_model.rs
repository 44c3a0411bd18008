//! Push channel frames, parsed events and connection status.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::drafts::{DraftAction, DraftPayload};
use crate::errors::{Error, Result};
use crate::resources::{ResourceEvent, ResourceOperation};

pub const EVENT_JOIN: &str = "join";
pub const EVENT_NEW_MESSAGE: &str = "new_message";
pub const EVENT_SEND_MESSAGE: &str = "send_message";
pub const EVENT_SESSION_UPDATE: &str = "session_update";
pub const EVENT_RESOURCE_CREATED: &str = "resource_created";
pub const EVENT_RESOURCE_UPDATED: &str = "resource_updated";
pub const EVENT_RESOURCE_DELETED: &str = "resource_deleted";
pub const EVENT_AGENT_DRAFT_CREATED: &str = "agent_draft_created";
pub const EVENT_AGENT_DRAFT_UPDATED: &str = "agent_draft_updated";
pub const EVENT_AGENT_DRAFT_COMMITTED: &str = "agent_draft_committed";
pub const EVENT_AGENT_DRAFT_CANCELLED: &str = "agent_draft_cancelled";
pub const EVENT_AGENT_DRAFTS_LISTED: &str = "agent_drafts_listed";
pub const EVENT_AGENT_QUERY_RESULT: &str = "agent_resource_query_result";
pub const EVENT_AGENT_QUERY_ERROR: &str = "agent_resource_query_error";

/// One newline-delimited JSON frame on the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl PushFrame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// A fragment of a streamed assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageChunk {
    #[serde(alias = "id")]
    pub message_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default)]
    pub role: Option<String>,
}

/// Accumulated view of a message, emitted after every chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSnapshot {
    pub message_id: String,
    pub session_id: Option<String>,
    pub role: String,
    pub content: String,
    pub is_streaming: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Resource(ResourceEvent),
    Message(MessageChunk),
    SessionUpdate { session_id: String },
    Draft { action: DraftAction, draft: DraftPayload },
    DraftsListed(Vec<DraftPayload>),
    QueryResult(Value),
    QueryError(Value),
    Other(PushFrame),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceEventPayload {
    resource_type: String,
    id: Value,
    #[serde(default, alias = "payload")]
    data: Map<String, Value>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default, alias = "_tempId")]
    temp_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionUpdatePayload {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DraftListPayload {
    Wrapped { drafts: Vec<DraftPayload> },
    Bare(Vec<DraftPayload>),
}

impl PushEvent {
    pub fn parse(frame: &PushFrame) -> Result<Self> {
        let payload = frame.payload.clone();
        let event = match frame.event.as_str() {
            EVENT_NEW_MESSAGE => Self::Message(serde_json::from_value(payload)?),
            EVENT_SESSION_UPDATE => {
                let update: SessionUpdatePayload = serde_json::from_value(payload)?;
                Self::SessionUpdate {
                    session_id: update.session_id,
                }
            }
            EVENT_RESOURCE_CREATED => Self::resource(ResourceOperation::Created, payload)?,
            EVENT_RESOURCE_UPDATED => Self::resource(ResourceOperation::Updated, payload)?,
            EVENT_RESOURCE_DELETED => Self::resource(ResourceOperation::Deleted, payload)?,
            EVENT_AGENT_DRAFT_CREATED => Self::draft(DraftAction::Created, payload)?,
            EVENT_AGENT_DRAFT_UPDATED => Self::draft(DraftAction::Updated, payload)?,
            EVENT_AGENT_DRAFT_COMMITTED => Self::draft(DraftAction::Committed, payload)?,
            EVENT_AGENT_DRAFT_CANCELLED => Self::draft(DraftAction::Cancelled, payload)?,
            EVENT_AGENT_DRAFTS_LISTED => {
                let drafts = match serde_json::from_value(payload)? {
                    DraftListPayload::Wrapped { drafts } | DraftListPayload::Bare(drafts) => drafts,
                };
                Self::DraftsListed(drafts)
            }
            EVENT_AGENT_QUERY_RESULT => Self::QueryResult(payload),
            EVENT_AGENT_QUERY_ERROR => Self::QueryError(payload),
            _ => Self::Other(frame.clone()),
        };
        Ok(event)
    }

    fn resource(operation: ResourceOperation, payload: Value) -> Result<Self> {
        let raw: ResourceEventPayload = serde_json::from_value(payload)?;
        let id = match raw.id {
            Value::String(id) if !id.is_empty() => id,
            Value::Number(n) => n.to_string(),
            other => {
                return Err(Error::transport(format!(
                    "resource event without usable id: {}",
                    other
                )))
            }
        };
        Ok(Self::Resource(ResourceEvent {
            operation,
            resource_type: raw.resource_type,
            id,
            payload: raw.data,
            session_id: raw.session_id,
            temp_id: raw.temp_id,
        }))
    }

    fn draft(action: DraftAction, payload: Value) -> Result<Self> {
        let draft = match payload {
            Value::Object(mut map) if map.contains_key("draft") => {
                serde_json::from_value(map.remove("draft").unwrap_or_default())?
            }
            other => serde_json::from_value(other)?,
        };
        Ok(Self::Draft { action, draft })
    }

    /// The frame name this event arrived under.
    pub fn kind(&self) -> &str {
        match self {
            Self::Resource(event) => match event.operation {
                ResourceOperation::Created => EVENT_RESOURCE_CREATED,
                ResourceOperation::Updated => EVENT_RESOURCE_UPDATED,
                ResourceOperation::Deleted => EVENT_RESOURCE_DELETED,
            },
            Self::Message(_) => EVENT_NEW_MESSAGE,
            Self::SessionUpdate { .. } => EVENT_SESSION_UPDATE,
            Self::Draft { action, .. } => match action {
                DraftAction::Created => EVENT_AGENT_DRAFT_CREATED,
                DraftAction::Updated => EVENT_AGENT_DRAFT_UPDATED,
                DraftAction::Committed => EVENT_AGENT_DRAFT_COMMITTED,
                DraftAction::Cancelled => EVENT_AGENT_DRAFT_CANCELLED,
            },
            Self::DraftsListed(_) => EVENT_AGENT_DRAFTS_LISTED,
            Self::QueryResult(_) => EVENT_AGENT_QUERY_RESULT,
            Self::QueryError(_) => EVENT_AGENT_QUERY_ERROR,
            Self::Other(frame) => frame.event.as_str(),
        }
    }

    /// Session id carried by the event, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Message(chunk) => chunk.session_id.as_deref(),
            Self::SessionUpdate { session_id } => Some(session_id.as_str()),
            Self::Resource(event) => event.session_id.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStatus {
    pub state: ConnectionState,
    pub session_id: Option<String>,
    pub last_error: Option<String>,
}

impl Default for TransportStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            session_id: None,
            last_error: None,
        }
    }
}
