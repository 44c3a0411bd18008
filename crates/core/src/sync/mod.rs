//! Reconciliation of server-pushed resource events with local optimistic state.

mod reconciliation_engine;

pub use reconciliation_engine::*;
