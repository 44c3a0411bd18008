//! Entry point for embedding the sync engine: build a [`ClinicSync`] per
//! business/location and drive every resource type through it.

mod builder;
mod clinic_sync;
mod validation;

#[cfg(test)]
mod test_support;

pub use builder::ClinicSyncBuilder;
pub use clinic_sync::ClinicSync;
pub use validation::{RequiredFields, ResourceValidator};

pub use clinicsync_core::config::{ChannelIdentity, SyncConfig};
pub use clinicsync_core::errors::{Error, Result};
