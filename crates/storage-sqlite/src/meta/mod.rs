//! Key/value metadata (auth data, query baselines).

mod model;
mod repository;

pub use model::MetaDB;
pub use repository::MetaRepository;
