//! Reachability of the remote service.

mod health_model;
mod reachability_monitor;

pub use health_model::*;
pub use reachability_monitor::*;
