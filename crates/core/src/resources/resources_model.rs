//! Resource, outbox and query parameter models.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::{Error, RemoteError, RemoteErrorKind, Result};

/// Prefix of client-generated provisional identifiers.
pub const TEMP_ID_PREFIX: &str = "tmp_";

/// Validated resource type name, e.g. `patients`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceType(String);

impl ResourceType {
    /// Accepts lowercase ASCII letters, digits and underscores.
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("resource type must not be empty"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(Error::validation(format!(
                "invalid resource type '{}': only [a-z0-9_] allowed",
                name
            )));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ResourceType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ResourceType> for String {
    fn from(value: ResourceType) -> Self {
        value.0
    }
}

impl AsRef<str> for ResourceType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Time-ordered, so temp ids sort in creation order.
pub fn generate_temp_id() -> String {
    format!("{}{}", TEMP_ID_PREFIX, Uuid::now_v7())
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// A typed record owned by the remote service and mirrored locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: Option<String>,
    pub temp_id: Option<String>,
    pub resource_type: String,
    pub data: Map<String, Value>,
    pub is_optimistic: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    /// Client-side record for a write the server has accepted but not yet confirmed.
    pub fn optimistic(resource_type: &str, temp_id: &str, data: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            temp_id: Some(temp_id.to_string()),
            resource_type: resource_type.to_string(),
            data,
            is_optimistic: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn confirmed(resource_type: &str, id: &str, data: Map<String, Value>) -> Self {
        let now = Utc::now();
        let created_at = timestamp_field(&data, &["createdAt", "created_at"]).unwrap_or(now);
        let updated_at = timestamp_field(&data, &["updatedAt", "updated_at"]).unwrap_or(now);
        Self {
            id: Some(id.to_string()),
            temp_id: None,
            resource_type: resource_type.to_string(),
            data,
            is_optimistic: false,
            created_at,
            updated_at,
        }
    }

    /// Builds a confirmed resource from a remote JSON object. `fallback_id` is used
    /// when the body does not carry its own id.
    pub fn from_remote(resource_type: &str, value: Value, fallback_id: Option<&str>) -> Result<Self> {
        let data = match value {
            Value::Object(map) => map,
            other => {
                return Err(RemoteError::new(
                    RemoteErrorKind::Decode,
                    format!("expected a JSON object for {}, got {}", resource_type, other),
                )
                .into())
            }
        };
        let id = extract_id(&data)
            .or_else(|| fallback_id.map(str::to_string))
            .ok_or_else(|| {
                Error::from(RemoteError::new(
                    RemoteErrorKind::Decode,
                    format!("{} payload carries no id", resource_type),
                ))
            })?;
        Ok(Self::confirmed(resource_type, &id, data))
    }

    /// Primary identity: the server id once assigned, otherwise the temp id.
    pub fn key(&self) -> Option<&str> {
        self.id.as_deref().or(self.temp_id.as_deref())
    }

    pub fn matches_key(&self, key: &str) -> bool {
        self.id.as_deref() == Some(key) || self.temp_id.as_deref() == Some(key)
    }

    /// Field-replacement merge of `payload` onto `data`.
    pub fn apply_fields(&mut self, payload: &Map<String, Value>) {
        for (field, value) in payload {
            self.data.insert(field.clone(), value.clone());
        }
        self.updated_at = Utc::now();
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }
}

/// Reads `id` (or `_id`) from a payload, accepting strings and numbers.
pub fn extract_id(data: &Map<String, Value>) -> Option<String> {
    ["id", "_id"].iter().find_map(|key| match data.get(*key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn timestamp_field(data: &Map<String, Value>, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter().find_map(|key| {
        data.get(*key)
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    })
}

/// Pending-confirmation record for one optimistic create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub temp_id: String,
    pub resource_type: String,
    pub payload_fingerprint: String,
    /// Id echoed by the create response, once known.
    pub server_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn new(resource_type: &str, temp_id: &str, payload_fingerprint: String) -> Self {
        Self {
            temp_id: temp_id.to_string(),
            resource_type: resource_type.to_string(),
            payload_fingerprint,
            server_id: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceOperation {
    Created,
    Updated,
    Deleted,
}

impl ResourceOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

/// Server-pushed notification of a confirmed change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEvent {
    pub operation: ResourceOperation,
    pub resource_type: String,
    pub id: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Parameters of a list query. Filters are equality matches on top-level fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
    #[serde(default)]
    pub sort: Option<SortSpec>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub include: Vec<String>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters.insert(field.into(), value);
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some(SortSpec {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Call-site values win over `self` for filters, sort and limit.
    pub fn merged_with(&self, overrides: &QueryParams) -> QueryParams {
        let mut merged = self.clone();
        for (field, value) in &overrides.filters {
            merged.filters.insert(field.clone(), value.clone());
        }
        if overrides.sort.is_some() {
            merged.sort = overrides.sort.clone();
        }
        if overrides.limit.is_some() {
            merged.limit = overrides.limit;
        }
        for relation in &overrides.include {
            if !merged.include.contains(relation) {
                merged.include.push(relation.clone());
            }
        }
        merged
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        self.filters
            .iter()
            .all(|(field, expected)| resource.data.get(field) == Some(expected))
    }

    /// Filter, sort and truncate a local snapshot.
    pub fn apply(&self, resources: Vec<Resource>) -> Vec<Resource> {
        let mut selected: Vec<Resource> = resources.into_iter().filter(|r| self.matches(r)).collect();
        if let Some(sort) = &self.sort {
            selected.sort_by(|a, b| {
                let ordering = compare_values(a.data.get(&sort.field), b.data.get(&sort.field));
                match sort.direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                }
            });
        }
        if let Some(limit) = self.limit {
            selected.truncate(limit as usize);
        }
        selected
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}
