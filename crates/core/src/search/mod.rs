//! Remote search with a short-lived result cache.

mod search_cache;
mod search_model;

pub use search_cache::*;
pub use search_model::*;
