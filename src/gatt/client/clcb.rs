//! The connection control block: one per (client application, device) pair

use crate::{
    core::{address::AddressWithType, uuid::Uuid},
    gatt::{
        callbacks::{GattClientEvent, ReadResult, ReadTarget, WriteResult},
        channel::{AuthRequirement, GattOpType, GattWriteType},
        ids::{AttributeId, CharacteristicId, ClientIf, ConnectionId},
        status::GattStatus,
    },
};

use super::state_machine::ClcbEvent;

/// Index of a CLCB in the module's table. Allocated in increasing order, so
/// iterating the table visits CLCBs oldest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ClcbId(pub u32);

/// The states of a connection control block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClcbState {
    /// Allocated, not yet connecting
    Idle,
    /// Waiting for the transport to bring the link up
    Connecting,
    /// Operations are issued directly
    Connected,
    /// The device's attribute table is being loaded, discovered or saved.
    /// One operation may be queued.
    Discovering,
    /// Being torn down; every further event is ignored
    Closing,
}

/// Whether a rediscovery is scheduled behind the current operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AutoUpdate {
    NoSchedule,
    /// Rediscovery requested; waiting for the in-flight operation to finish
    DiscoveryWaiting,
    /// The in-flight operation finished (and its response was dropped);
    /// rediscovery may start despite the pending slot being occupied
    RequestWaiting,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ReadRequest {
    pub id: AttributeId,
    pub auth_req: AuthRequirement,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ReadMultipleRequest {
    pub ids: Vec<AttributeId>,
    pub auth_req: AuthRequirement,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct WriteRequest {
    pub id: AttributeId,
    pub write_type: GattWriteType,
    pub value: Vec<u8>,
    pub auth_req: AuthRequirement,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ExecuteWriteRequest {
    pub is_execute: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ConfirmRequest {
    pub characteristic: CharacteristicId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SearchRequest {
    pub service_uuid: Option<Uuid>,
}

/// The single operation a CLCB may hold, either in flight or queued behind
/// discovery
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PendingOperation {
    Read(ReadRequest),
    ReadMultiple(ReadMultipleRequest),
    Write(WriteRequest),
    ExecuteWrite(ExecuteWriteRequest),
    Confirm(ConfirmRequest),
    Search(SearchRequest),
}

impl PendingOperation {
    /// The transport completion that finishes this operation. Confirm and
    /// search never wait on the transport.
    pub fn op_type(&self) -> Option<GattOpType> {
        match self {
            PendingOperation::Read(_) | PendingOperation::ReadMultiple(_) => Some(GattOpType::Read),
            PendingOperation::Write(_) => Some(GattOpType::Write),
            PendingOperation::ExecuteWrite(_) => Some(GattOpType::ExecuteWrite),
            PendingOperation::Confirm(_) | PendingOperation::Search(_) => None,
        }
    }

    /// Feed this operation back into the state machine
    pub fn into_event(self) -> ClcbEvent {
        match self {
            PendingOperation::Read(req) => ClcbEvent::ApiRead(req),
            PendingOperation::ReadMultiple(req) => ClcbEvent::ApiReadMultiple(req),
            PendingOperation::Write(req) => ClcbEvent::ApiWrite(req),
            PendingOperation::ExecuteWrite(req) => ClcbEvent::ApiExecuteWrite(req),
            PendingOperation::Confirm(req) => ClcbEvent::ApiConfirm(req),
            PendingOperation::Search(req) => ClcbEvent::ApiSearch(req),
        }
    }

    /// The result event reporting this operation as failed with `status`
    /// without it ever reaching the transport
    pub fn failure_event(
        &self,
        conn_id: ConnectionId,
        status: GattStatus,
    ) -> Option<GattClientEvent> {
        match self {
            PendingOperation::Read(req) => Some(GattClientEvent::Read(ReadResult {
                conn_id,
                status,
                target: ReadTarget::Attribute(req.id),
                value: vec![],
            })),
            PendingOperation::ReadMultiple(req) => Some(GattClientEvent::Read(ReadResult {
                conn_id,
                status,
                target: ReadTarget::Multiple(req.ids.clone()),
                value: vec![],
            })),
            PendingOperation::Write(req) => Some(GattClientEvent::Write(WriteResult {
                conn_id,
                status,
                id: req.id,
                write_type: req.write_type,
            })),
            PendingOperation::ExecuteWrite(_) => {
                Some(GattClientEvent::ExecuteWrite { conn_id, status })
            }
            PendingOperation::Search(_) => {
                Some(GattClientEvent::SearchComplete { conn_id, status })
            }
            PendingOperation::Confirm(_) => None,
        }
    }
}

impl TryFrom<ClcbEvent> for PendingOperation {
    type Error = ClcbEvent;

    fn try_from(event: ClcbEvent) -> Result<Self, Self::Error> {
        match event {
            ClcbEvent::ApiRead(req) => Ok(PendingOperation::Read(req)),
            ClcbEvent::ApiReadMultiple(req) => Ok(PendingOperation::ReadMultiple(req)),
            ClcbEvent::ApiWrite(req) => Ok(PendingOperation::Write(req)),
            ClcbEvent::ApiExecuteWrite(req) => Ok(PendingOperation::ExecuteWrite(req)),
            ClcbEvent::ApiConfirm(req) => Ok(PendingOperation::Confirm(req)),
            ClcbEvent::ApiSearch(req) => Ok(PendingOperation::Search(req)),
            other => Err(other),
        }
    }
}

/// A connection control block
#[derive(Debug)]
pub(crate) struct Clcb {
    pub client_if: ClientIf,
    /// Key of the shared RemoteServerRecord
    pub address: AddressWithType,
    /// None until the transport reports the link up
    pub conn_id: Option<ConnectionId>,
    pub state: ClcbState,
    /// Status of the last discovery or operation
    pub status: GattStatus,
    pub auto_update: AutoUpdate,
    pub pending: Option<PendingOperation>,
}

impl Clcb {
    pub fn new(client_if: ClientIf, address: AddressWithType) -> Self {
        Self {
            client_if,
            address,
            conn_id: None,
            state: ClcbState::Idle,
            status: GattStatus::Success,
            auto_update: AutoUpdate::NoSchedule,
            pending: None,
        }
    }
}
