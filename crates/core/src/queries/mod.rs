//! Query modification channel used by the assistant to reshape repository queries.

mod query_model;
mod query_modification_service;

pub use query_model::*;
pub use query_modification_service::*;
