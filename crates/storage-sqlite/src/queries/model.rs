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
#[diesel(table_name = crate::schema::agent_query_modifications)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct QueryModificationDB {
    pub id: String,
    pub session_id: String,
    pub repository_type: String,
    /// JSON array of modification ops.
    pub modifications: String,
    pub status: String,
    pub timestamp: String,
}
