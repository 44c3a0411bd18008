//! Repository for runtime-created resource tables and the outbox.
//!
//! Every registered resource type owns a `res_<type>` table. Rows are keyed by
//! `key` (server id once assigned, temp id before) and can also be found by
//! either id column, so a confirmed row replaces its optimistic predecessor.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{self, Pool};
use diesel::sql_types::{Bool, Nullable, Text};
use diesel::sqlite::SqliteConnection;
use log::debug;

use clinicsync_core::errors::Result;
use clinicsync_core::resources::{OutboxEntry, Resource, ResourceType};

use super::model::{NewResourceRow, OutboxEntryDB, ResourceRowDB};
use crate::db::{get_connection, WriteHandle};
use crate::errors::StorageError;
use crate::schema::outbox;

const RESOURCE_TABLE_PREFIX: &str = "res_";

pub(crate) fn quote_identifier(value: &str) -> String {
    format!("`{}`", value.replace('`', "``"))
}

/// Physical table for a resource type. Rejects names that are not valid types.
pub fn resource_table_name(resource_type: &str) -> Result<String> {
    let resource_type = ResourceType::parse(resource_type)?;
    Ok(format!("{}{}", RESOURCE_TABLE_PREFIX, resource_type))
}

fn create_table_sql(table: &str) -> String {
    let quoted = quote_identifier(table);
    format!(
        "CREATE TABLE IF NOT EXISTS {quoted} (
            key TEXT NOT NULL PRIMARY KEY,
            id TEXT,
            temp_id TEXT,
            data TEXT NOT NULL,
            is_optimistic INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS {id_idx} ON {quoted} (id);
        CREATE INDEX IF NOT EXISTS {temp_idx} ON {quoted} (temp_id);",
        quoted = quoted,
        id_idx = quote_identifier(&format!("idx_{}_id", table)),
        temp_idx = quote_identifier(&format!("idx_{}_temp_id", table)),
    )
}

fn delete_matching_rows(conn: &mut SqliteConnection, table: &str, key: &str) -> Result<usize> {
    let deleted = diesel::sql_query(format!(
        "DELETE FROM {} WHERE key = ? OR id = ? OR temp_id = ?",
        quote_identifier(table)
    ))
    .bind::<Text, _>(key)
    .bind::<Text, _>(key)
    .bind::<Text, _>(key)
    .execute(conn)
    .map_err(StorageError::from)?;
    Ok(deleted)
}

/// Replaces any row sharing the key, id or temp id, then inserts the new row.
pub(crate) fn upsert_resource_row(conn: &mut SqliteConnection, row: &NewResourceRow) -> Result<()> {
    let table = quote_identifier(&row.table);
    diesel::sql_query(format!(
        "DELETE FROM {} WHERE key = ? OR (id IS NOT NULL AND id = ?) OR (temp_id IS NOT NULL AND temp_id = ?)",
        table
    ))
    .bind::<Text, _>(row.key.clone())
    .bind::<Nullable<Text>, _>(row.id.clone())
    .bind::<Nullable<Text>, _>(row.temp_id.clone())
    .execute(conn)
    .map_err(StorageError::from)?;

    diesel::sql_query(format!(
        "INSERT INTO {} (key, id, temp_id, data, is_optimistic, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        table
    ))
    .bind::<Text, _>(row.key.clone())
    .bind::<Nullable<Text>, _>(row.id.clone())
    .bind::<Nullable<Text>, _>(row.temp_id.clone())
    .bind::<Text, _>(row.data.clone())
    .bind::<Bool, _>(row.is_optimistic)
    .bind::<Text, _>(row.created_at.clone())
    .bind::<Text, _>(row.updated_at.clone())
    .execute(conn)
    .map_err(StorageError::from)?;
    Ok(())
}

pub(crate) fn upsert_outbox_row(conn: &mut SqliteConnection, row: &OutboxEntryDB) -> Result<()> {
    diesel::insert_into(outbox::table)
        .values(row)
        .on_conflict(outbox::temp_id)
        .do_update()
        .set((
            outbox::resource_type.eq(&row.resource_type),
            outbox::payload_fingerprint.eq(&row.payload_fingerprint),
            outbox::server_id.eq(&row.server_id),
            outbox::created_at.eq(&row.created_at),
        ))
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

pub struct ResourceTableRepository {
    pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
    writer: WriteHandle,
    known_tables: Mutex<HashSet<String>>,
}

impl ResourceTableRepository {
    pub fn new(
        pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
        writer: WriteHandle,
    ) -> Self {
        Self {
            pool,
            writer,
            known_tables: Mutex::new(HashSet::new()),
        }
    }

    fn known_tables(&self) -> MutexGuard<'_, HashSet<String>> {
        self.known_tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates the type's table on first use and returns its name.
    pub async fn ensure_table(&self, resource_type: &str) -> Result<String> {
        let table = resource_table_name(resource_type)?;
        if self.known_tables().contains(&table) {
            return Ok(table);
        }

        let sql = create_table_sql(&table);
        self.writer
            .exec(move |conn| {
                conn.batch_execute(&sql).map_err(StorageError::from)?;
                Ok(())
            })
            .await?;

        debug!("[LocalStore] Resource table {} ready", table);
        self.known_tables().insert(table.clone());
        Ok(table)
    }

    pub async fn upsert(&self, resource: &Resource) -> Result<()> {
        let table = self.ensure_table(&resource.resource_type).await?;
        let row = NewResourceRow::from_resource(table, resource)?;
        self.writer
            .exec(move |conn| upsert_resource_row(conn, &row))
            .await
    }

    /// Writes every row in a single transaction.
    pub async fn upsert_many(&self, resources: &[Resource]) -> Result<usize> {
        let mut tables: BTreeMap<String, String> = BTreeMap::new();
        for resource in resources {
            if !tables.contains_key(&resource.resource_type) {
                let table = self.ensure_table(&resource.resource_type).await?;
                tables.insert(resource.resource_type.clone(), table);
            }
        }

        let rows = resources
            .iter()
            .map(|resource| {
                let table = tables
                    .get(&resource.resource_type)
                    .cloned()
                    .unwrap_or_default();
                NewResourceRow::from_resource(table, resource)
            })
            .collect::<Result<Vec<_>>>()?;

        self.writer
            .exec(move |conn| {
                for row in &rows {
                    upsert_resource_row(conn, row)?;
                }
                Ok(rows.len())
            })
            .await
    }

    pub async fn get(&self, resource_type: &str, key: &str) -> Result<Option<Resource>> {
        let table = self.ensure_table(resource_type).await?;
        let mut conn = get_connection(&self.pool)?;
        let row = diesel::sql_query(format!(
            "SELECT key, id, temp_id, data, is_optimistic, created_at, updated_at
             FROM {} WHERE key = ? OR id = ? OR temp_id = ? LIMIT 1",
            quote_identifier(&table)
        ))
        .bind::<Text, _>(key)
        .bind::<Text, _>(key)
        .bind::<Text, _>(key)
        .get_result::<ResourceRowDB>(&mut conn)
        .optional()
        .map_err(StorageError::from)?;

        row.map(|row| row.into_resource(resource_type)).transpose()
    }

    pub async fn list(&self, resource_type: &str) -> Result<Vec<Resource>> {
        let table = self.ensure_table(resource_type).await?;
        let mut conn = get_connection(&self.pool)?;
        let rows = diesel::sql_query(format!(
            "SELECT key, id, temp_id, data, is_optimistic, created_at, updated_at
             FROM {} ORDER BY created_at ASC, key ASC",
            quote_identifier(&table)
        ))
        .load::<ResourceRowDB>(&mut conn)
        .map_err(StorageError::from)?;

        rows.into_iter()
            .map(|row| row.into_resource(resource_type))
            .collect()
    }

    pub async fn delete(&self, resource_type: &str, key: &str) -> Result<bool> {
        let table = self.ensure_table(resource_type).await?;
        let key = key.to_string();
        let deleted = self
            .writer
            .exec(move |conn| delete_matching_rows(conn, &table, &key))
            .await?;
        Ok(deleted > 0)
    }

    pub async fn clear(&self, resource_type: &str) -> Result<usize> {
        let table = self.ensure_table(resource_type).await?;
        self.writer
            .exec(move |conn| {
                let deleted = diesel::sql_query(format!("DELETE FROM {}", quote_identifier(&table)))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(deleted)
            })
            .await
    }

    pub async fn put_outbox(&self, entry: &OutboxEntry) -> Result<()> {
        let row = OutboxEntryDB::from(entry);
        self.writer
            .exec(move |conn| upsert_outbox_row(conn, &row))
            .await
    }

    pub async fn delete_outbox(&self, temp_id: &str) -> Result<bool> {
        let temp_id = temp_id.to_string();
        let deleted = self
            .writer
            .exec(move |conn| {
                let deleted = diesel::delete(outbox::table.find(temp_id))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(deleted)
            })
            .await?;
        Ok(deleted > 0)
    }

    /// Outbox entries oldest first.
    pub fn list_outbox(&self, resource_type: Option<&str>) -> Result<Vec<OutboxEntry>> {
        let mut conn = get_connection(&self.pool)?;
        let mut query = outbox::table
            .select(OutboxEntryDB::as_select())
            .order(outbox::created_at.asc())
            .into_boxed();
        if let Some(resource_type) = resource_type {
            query = query.filter(outbox::resource_type.eq(resource_type.to_string()));
        }
        let rows = query
            .load::<OutboxEntryDB>(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(OutboxEntry::try_from).collect()
    }

    pub async fn record_optimistic_write(
        &self,
        resource: &Resource,
        entry: &OutboxEntry,
    ) -> Result<()> {
        let table = self.ensure_table(&resource.resource_type).await?;
        let row = NewResourceRow::from_resource(table, resource)?;
        let outbox_row = OutboxEntryDB::from(entry);
        self.writer
            .exec(move |conn| {
                upsert_outbox_row(conn, &outbox_row)?;
                upsert_resource_row(conn, &row)
            })
            .await
    }

    pub async fn confirm_created(&self, temp_id: &str, resource: &Resource) -> Result<()> {
        let table = self.ensure_table(&resource.resource_type).await?;
        let row = NewResourceRow::from_resource(table.clone(), resource)?;
        let temp_id = temp_id.to_string();
        self.writer
            .exec(move |conn| {
                delete_matching_rows(conn, &table, &temp_id)?;
                diesel::delete(outbox::table.find(temp_id.as_str()))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                upsert_resource_row(conn, &row)
            })
            .await
    }
}
