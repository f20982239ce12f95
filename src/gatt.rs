//! The GATT client and the pieces around it: the transport and persistence
//! seams it drives, the events it reports, and the minimal local server whose
//! built-in services a peer can discover.

pub mod cache_store;
pub mod callbacks;
pub mod channel;
pub mod characteristic;
pub mod client;
pub mod ids;
pub mod mocks;
pub mod server;
pub mod status;
