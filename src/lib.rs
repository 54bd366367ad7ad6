// src/lib.rs
pub mod config;
pub mod error;
pub mod modules;
pub mod registry_client;
pub mod signal;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{Result, WatchError};
pub use registry_client::{ConsulClient, RegistryClient};
pub use signal::SignalHandler;
