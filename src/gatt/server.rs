//! The local GATT server. Only the built-in services are modelled: enough for
//! a remote client to discover and read them.

pub mod gatt_database;
pub mod services;
