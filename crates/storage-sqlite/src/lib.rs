//! SQLite implementation of the clinicsync local persistent store.
//!
//! Reads go through an r2d2 pool; every write is funneled through a single
//! writer thread ([`db::WriteHandle`]) and runs in its own transaction.

pub mod db;
pub mod errors;
pub mod local_store;
pub mod meta;
pub mod queries;
pub mod resources;
pub mod schema;

pub use errors::StorageError;
pub use local_store::SqliteLocalStore;
