use std::sync::Arc;

use chrono::Utc;
use diesel::prelude::*;
use diesel::r2d2::{self, Pool};
use diesel::sqlite::SqliteConnection;

use clinicsync_core::errors::Result;

use super::model::MetaDB;
use crate::db::{get_connection, timestamp_to_db, WriteHandle};
use crate::errors::StorageError;
use crate::schema::meta;

pub struct MetaRepository {
    pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
    writer: WriteHandle,
}

impl MetaRepository {
    pub fn new(
        pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
        writer: WriteHandle,
    ) -> Self {
        Self { pool, writer }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = get_connection(&self.pool)?;
        let row = meta::table
            .find(key)
            .first::<MetaDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(row.map(|r| r.value))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let row = MetaDB {
            key: key.to_string(),
            value: value.to_string(),
            updated_at: timestamp_to_db(&Utc::now()),
        };
        self.writer
            .exec(move |conn| {
                diesel::insert_into(meta::table)
                    .values(&row)
                    .on_conflict(meta::key)
                    .do_update()
                    .set((
                        meta::value.eq(&row.value),
                        meta::updated_at.eq(&row.updated_at),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.writer
            .exec(move |conn| {
                diesel::delete(meta::table.find(key))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }
}
