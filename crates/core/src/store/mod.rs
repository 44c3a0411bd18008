//! Local store implementations shipped with the core crate.

mod memory_store;

pub use memory_store::*;
