use std::sync::Arc;

use diesel::prelude::*;
use diesel::r2d2::{self, Pool};
use diesel::sqlite::SqliteConnection;

use clinicsync_core::errors::Result;
use clinicsync_core::queries::QueryModification;

use super::model::QueryModificationDB;
use crate::db::{get_connection, timestamp_from_db, timestamp_to_db, WriteHandle};
use crate::errors::StorageError;
use crate::schema::agent_query_modifications;

fn enum_to_db<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?.trim_matches('"').to_string())
}

fn enum_from_db<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_str(&format!("\"{}\"", value))?)
}

fn to_db(modification: &QueryModification) -> Result<QueryModificationDB> {
    Ok(QueryModificationDB {
        id: modification.id.clone(),
        session_id: modification.session_id.clone(),
        repository_type: modification.repository_type.clone(),
        modifications: serde_json::to_string(&modification.modifications)?,
        status: enum_to_db(&modification.status)?,
        timestamp: timestamp_to_db(&modification.timestamp),
    })
}

fn from_db(row: QueryModificationDB) -> Result<QueryModification> {
    Ok(QueryModification {
        modifications: serde_json::from_str(&row.modifications)?,
        status: enum_from_db(&row.status)?,
        timestamp: timestamp_from_db(&row.timestamp)?,
        id: row.id,
        session_id: row.session_id,
        repository_type: row.repository_type,
    })
}

pub struct QueryModificationRepository {
    pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
    writer: WriteHandle,
}

impl QueryModificationRepository {
    pub fn new(
        pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
        writer: WriteHandle,
    ) -> Self {
        Self { pool, writer }
    }

    /// Inserts or replaces the modification (status changes rewrite the row).
    pub async fn upsert(&self, modification: &QueryModification) -> Result<()> {
        let row = to_db(modification)?;
        self.writer
            .exec(move |conn| {
                diesel::insert_into(agent_query_modifications::table)
                    .values(&row)
                    .on_conflict(agent_query_modifications::id)
                    .do_update()
                    .set(&row)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    /// Oldest first, optionally restricted to one session.
    pub fn list(&self, session_id: Option<&str>) -> Result<Vec<QueryModification>> {
        let mut conn = get_connection(&self.pool)?;
        let mut query = agent_query_modifications::table
            .select(QueryModificationDB::as_select())
            .order(agent_query_modifications::timestamp.asc())
            .into_boxed();
        if let Some(session_id) = session_id {
            query = query.filter(agent_query_modifications::session_id.eq(session_id.to_string()));
        }
        let rows = query
            .load::<QueryModificationDB>(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(from_db).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinicsync_core::queries::ModificationStatus;

    #[test]
    fn status_round_trips_through_db_text() {
        let text = enum_to_db(&ModificationStatus::Reverted).unwrap();
        assert_eq!(text, "reverted");
        let status: ModificationStatus = enum_from_db(&text).unwrap();
        assert_eq!(status, ModificationStatus::Reverted);
    }
}
