//! History of agent query modifications.

mod model;
mod repository;

pub use model::QueryModificationDB;
pub use repository::QueryModificationRepository;
