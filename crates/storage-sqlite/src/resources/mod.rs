//! Per-type resource tables and the outbox of unconfirmed creates.

mod model;
mod repository;

pub use model::{NewResourceRow, OutboxEntryDB, ResourceRowDB};
pub use repository::{resource_table_name, ResourceTableRepository};
