use diesel::prelude::*;
use serde::{Deserialize, Serialize};

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
#[diesel(primary_key(key))]
#[diesel(table_name = crate::schema::meta)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct MetaDB {
    pub key: String,
    pub value: String,
    pub updated_at: String,
}
