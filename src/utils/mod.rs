//! Utilities shared by the GATT client and its tests

pub mod task;
