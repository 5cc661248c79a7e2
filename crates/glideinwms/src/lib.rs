#![deny(clippy::await_holding_refcell_ref)]

pub mod aggregator;
pub mod common;
pub mod factory;
pub mod frontend;
pub mod matching;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::GwmsError;
pub type Result<T> = std::result::Result<T, Error>;

// Reexports
pub use gwms_core;
pub use gwms_core::{Map, Set};

pub const GWMS_VERSION: &str = {
    match option_env!("GWMS_BUILD_VERSION") {
        Some(version) => version,
        None => const_format::concatcp!(env!("CARGO_PKG_VERSION"), "-dev"),
    }
};
