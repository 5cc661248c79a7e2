pub mod adbus;
pub mod batch;
pub mod classad;
pub mod common;
pub mod credentials;
pub mod crypto;

pub use crate::common::{Map, Set};

pub type Error = crate::common::error::CoreError;
pub type Result<T> = std::result::Result<T, Error>;

/// Result of an operation that talks to an external system (collector, batch daemon,
/// credential creation script).
pub type ExternalResult<T> = anyhow::Result<T>;

pub const GLIDEINWMS_VERSION: &str = {
    match option_env!("GWMS_BUILD_VERSION") {
        Some(version) => version,
        None => env!("CARGO_PKG_VERSION"),
    }
};
