//! Database models for resource rows and outbox entries.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use clinicsync_core::errors::{Error, Result};
use clinicsync_core::resources::{OutboxEntry, Resource};

use crate::db::{timestamp_from_db, timestamp_to_db};

/// Row of a runtime-created `res_<type>` table.
#[derive(diesel::QueryableByName, Debug, Clone)]
pub struct ResourceRowDB {
    #[diesel(sql_type = diesel::sql_types::Text)]
    pub key: String,
    #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Text>)]
    pub id: Option<String>,
    #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Text>)]
    pub temp_id: Option<String>,
    #[diesel(sql_type = diesel::sql_types::Text)]
    pub data: String,
    #[diesel(sql_type = diesel::sql_types::Bool)]
    pub is_optimistic: bool,
    #[diesel(sql_type = diesel::sql_types::Text)]
    pub created_at: String,
    #[diesel(sql_type = diesel::sql_types::Text)]
    pub updated_at: String,
}

impl ResourceRowDB {
    pub fn into_resource(self, resource_type: &str) -> Result<Resource> {
        let data: Map<String, Value> = serde_json::from_str(&self.data)?;
        Ok(Resource {
            id: self.id,
            temp_id: self.temp_id,
            resource_type: resource_type.to_string(),
            data,
            is_optimistic: self.is_optimistic,
            created_at: timestamp_from_db(&self.created_at)?,
            updated_at: timestamp_from_db(&self.updated_at)?,
        })
    }
}

/// Owned insert payload, built before handing work to the writer thread.
#[derive(Debug, Clone)]
pub struct NewResourceRow {
    pub table: String,
    pub key: String,
    pub id: Option<String>,
    pub temp_id: Option<String>,
    pub data: String,
    pub is_optimistic: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl NewResourceRow {
    pub fn from_resource(table: String, resource: &Resource) -> Result<Self> {
        let key = resource
            .key()
            .ok_or_else(|| Error::validation("resource has neither an id nor a temp id"))?
            .to_string();
        Ok(Self {
            table,
            key,
            id: resource.id.clone(),
            temp_id: resource.temp_id.clone(),
            data: serde_json::to_string(&resource.data)?,
            is_optimistic: resource.is_optimistic,
            created_at: timestamp_to_db(&resource.created_at),
            updated_at: timestamp_to_db(&resource.updated_at),
        })
    }
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(primary_key(temp_id))]
#[diesel(table_name = crate::schema::outbox)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct OutboxEntryDB {
    pub temp_id: String,
    pub resource_type: String,
    pub payload_fingerprint: String,
    pub server_id: Option<String>,
    pub created_at: String,
}

impl From<&OutboxEntry> for OutboxEntryDB {
    fn from(entry: &OutboxEntry) -> Self {
        Self {
            temp_id: entry.temp_id.clone(),
            resource_type: entry.resource_type.clone(),
            payload_fingerprint: entry.payload_fingerprint.clone(),
            server_id: entry.server_id.clone(),
            created_at: timestamp_to_db(&entry.created_at),
        }
    }
}

impl TryFrom<OutboxEntryDB> for OutboxEntry {
    type Error = Error;

    fn try_from(row: OutboxEntryDB) -> Result<Self> {
        Ok(Self {
            created_at: timestamp_from_db(&row.created_at)?,
            temp_id: row.temp_id,
            resource_type: row.resource_type,
            payload_fingerprint: row.payload_fingerprint,
            server_id: row.server_id,
        })
    }
}
