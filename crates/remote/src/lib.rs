//! Network adapters for the clinicsync engine: the REST resource client, the
//! health probe and the TCP push-channel connector.

pub mod auth;
pub mod client;
pub mod error;
pub mod health_probe;
pub mod push_connector;

#[cfg(test)]
mod test_server;

pub use auth::{MetaTokenProvider, StaticTokenProvider, TokenProvider, AUTH_META_KEY};
pub use client::ResourceApiClient;
pub use error::{ApiError, ApiRetryClass, Result};
pub use health_probe::HttpHealthProbe;
pub use push_connector::TcpPushConnector;
