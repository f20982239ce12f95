//! Outcomes reported to applications, and synchronous API rejections

use thiserror::Error;

use super::ids::{ClientIf, ConnectionId};

/// The status carried by every asynchronous result event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GattStatus {
    Success,
    /// The underlying transport primitive failed
    Error,
    /// No free slot (CLCB, registration, tracker entry)
    NoResources,
    /// An attribute id and a handle could not be mapped onto each other
    InternalError,
    /// Superseded by discovery or explicitly cancelled
    Cancel,
    /// The connection already holds its one pending operation
    Busy,
    /// An ATT error code returned by the peer
    Att(u8),
}

impl GattStatus {
    pub fn is_success(self) -> bool {
        self == GattStatus::Success
    }
}

/// Status of one chunk handed back by the persistence collaborator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheLoadStatus {
    /// This is the final chunk
    Complete,
    /// More chunks follow
    More,
    Error,
}

/// Reasons an API call is rejected before it reaches any state machine
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattClientError {
    #[error("unknown client interface {0:?}")]
    UnknownClient(ClientIf),
    #[error("unknown connection {0:?}")]
    UnknownConnection(ConnectionId),
    #[error("no free slot")]
    NoResources,
    #[error("not found in the server cache")]
    NotFound,
    #[error("GATT client is disabled")]
    NotEnabled,
}
