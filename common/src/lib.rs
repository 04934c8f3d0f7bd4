//! Shared pieces of the snapper daemon: configuration, message types,
//! snapshot naming and logging setup.

pub mod config;
pub mod logging;
pub mod protocol;
pub mod snapshot;
