//! Draft state machine for resources edited by the assistant or the UI before commit.

mod draft_repository;
mod drafts_model;

pub use draft_repository::*;
pub use drafts_model::*;
