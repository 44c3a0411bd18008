use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resources::Resource;

/// A field search against one resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub resource_type: String,
    pub field: String,
    pub term: String,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
}

impl SearchRequest {
    pub fn new(resource_type: &str, field: &str, term: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            field: field.to_string(),
            term: term.to_string(),
            limit: None,
            filters: BTreeMap::new(),
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_filter(mut self, field: &str, value: Value) -> Self {
        self.filters.insert(field.to_string(), value);
        self
    }

    pub fn key(&self) -> SearchKey {
        SearchKey::new(&self.resource_type, &self.field, &self.term)
    }

    /// Case-insensitive substring match on `field`, plus equality filters.
    pub fn matches(&self, resource: &Resource) -> bool {
        let term = self.term.to_lowercase();
        let hit = match resource.data.get(&self.field) {
            Some(Value::String(value)) => value.to_lowercase().contains(&term),
            Some(Value::Number(n)) => n.to_string().contains(&term),
            _ => false,
        };
        hit && self
            .filters
            .iter()
            .all(|(field, expected)| resource.data.get(field) == Some(expected))
    }
}

/// Cache key: `(resource type, field, term)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchKey {
    pub resource_type: String,
    pub field: String,
    pub term: String,
}

impl SearchKey {
    pub fn new(resource_type: &str, field: &str, term: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            field: field.to_string(),
            term: term.to_string(),
        }
    }
}
