//! Resource domain: models, seams, shared state and the per-type repository.

mod fingerprint;
mod resource_repository;
mod resource_store;
mod resources_model;
mod resources_traits;

pub use fingerprint::*;
pub use resource_repository::*;
pub use resource_store::*;
pub use resources_model::*;
pub use resources_traits::*;
