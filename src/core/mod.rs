//! Shared data-types, configuration and logging setup go here.

pub mod address;
pub mod flags;
pub mod logging;
pub mod uuid;
