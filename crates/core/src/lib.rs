//! Local-first resource synchronization engine for the clinic client.
//!
//! The UI reads and writes typed resources through repositories that talk to the
//! remote service, fall back to a local persistent store when it is unreachable,
//! apply writes optimistically and reconcile them with server-confirmed events
//! arriving over the push channel.

pub mod commands;
pub mod config;
pub mod drafts;
pub mod errors;
pub mod events;
pub mod health;
pub mod queries;
pub mod resources;
pub mod search;
pub mod store;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use errors::{DatabaseError, Error, RemoteError, RemoteErrorKind, Result};
pub use events::SubscriptionId;
