use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::resources::{QueryParams, SortDirection, SortSpec};

/// Query currently applied to a repository type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveQuery {
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
    #[serde(default)]
    pub sort: Option<SortSpec>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default, rename = "where")]
    pub where_clauses: BTreeMap<String, Value>,
}

impl EffectiveQuery {
    pub fn apply(&mut self, op: &QueryModificationOp) {
        match op {
            QueryModificationOp::AddFilter { field, value } => {
                self.filters.insert(field.clone(), value.clone());
            }
            QueryModificationOp::RemoveFilter { field } => {
                self.filters.remove(field);
            }
            QueryModificationOp::SetSort { field, direction } => {
                self.sort = Some(SortSpec {
                    field: field.clone(),
                    direction: *direction,
                });
            }
            QueryModificationOp::SetLimit { limit } => self.limit = Some(*limit),
            QueryModificationOp::AddInclude { relation } => {
                if !self.include.contains(relation) {
                    self.include.push(relation.clone());
                }
            }
            QueryModificationOp::SetWhere { clauses } => {
                self.where_clauses = clauses
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
            }
            QueryModificationOp::AddWhere { field, value } => {
                self.where_clauses.insert(field.clone(), value.clone());
            }
            QueryModificationOp::RemoveWhere { field } => {
                self.where_clauses.remove(field);
            }
        }
    }

    /// Flattens filters and where clauses into list parameters; where clauses win.
    pub fn to_params(&self) -> QueryParams {
        let mut filters = self.filters.clone();
        for (field, value) in &self.where_clauses {
            filters.insert(field.clone(), value.clone());
        }
        QueryParams {
            filters,
            sort: self.sort.clone(),
            limit: self.limit,
            include: self.include.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryModificationOp {
    AddFilter { field: String, value: Value },
    RemoveFilter { field: String },
    SetSort {
        field: String,
        #[serde(default)]
        direction: SortDirection,
    },
    SetLimit { limit: u32 },
    AddInclude { relation: String },
    SetWhere { clauses: Map<String, Value> },
    AddWhere { field: String, value: Value },
    RemoveWhere { field: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationStatus {
    Active,
    Reverted,
    Reset,
}

impl ModificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Reverted => "reverted",
            Self::Reset => "reset",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "reverted" => Some(Self::Reverted),
            "reset" => Some(Self::Reset),
            _ => None,
        }
    }
}

/// One session's change to a repository type's effective query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryModification {
    pub id: String,
    pub session_id: String,
    pub repository_type: String,
    pub modifications: Vec<QueryModificationOp>,
    pub status: ModificationStatus,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ops_merge_onto_query() {
        let mut query = EffectiveQuery::default();
        for op in [
            QueryModificationOp::AddFilter { field: "status".into(), value: json!("open") },
            QueryModificationOp::SetSort { field: "date".into(), direction: SortDirection::Desc },
            QueryModificationOp::SetLimit { limit: 5 },
            QueryModificationOp::AddInclude { relation: "patient".into() },
            QueryModificationOp::AddInclude { relation: "patient".into() },
            QueryModificationOp::AddWhere { field: "status".into(), value: json!("closed") },
        ] {
            query.apply(&op);
        }
        assert_eq!(query.include, vec!["patient".to_string()]);
        let params = query.to_params();
        assert_eq!(params.filters.get("status"), Some(&json!("closed")));
        assert_eq!(params.limit, Some(5));
        assert_eq!(params.sort.unwrap().direction, SortDirection::Desc);
    }

    #[test]
    fn ops_deserialize_from_tagged_json() {
        let op: QueryModificationOp =
            serde_json::from_value(json!({ "type": "set_limit", "limit": 3 })).unwrap();
        assert_eq!(op, QueryModificationOp::SetLimit { limit: 3 });
        let op: QueryModificationOp =
            serde_json::from_value(json!({ "type": "set_sort", "field": "name" })).unwrap();
        assert_eq!(
            op,
            QueryModificationOp::SetSort { field: "name".into(), direction: SortDirection::Asc }
        );
    }
}
