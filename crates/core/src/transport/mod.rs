//! Push channel: frames, connectors, message streaming and event routing.

mod event_transport;
mod memory_connector;
mod streaming;
mod transport_model;
mod transport_traits;

pub use event_transport::*;
pub use memory_connector::*;
pub use streaming::*;
pub use transport_model::*;
pub use transport_traits::*;
