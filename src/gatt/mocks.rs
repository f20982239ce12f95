//! Mocked implementations of the GATT client's collaborators, for use in test

pub mod mock_cache_store;
pub mod mock_callbacks;
pub mod mock_peer;
pub mod mock_transport;
