//! The interface between the GattClientModule and client applications. Every
//! result and unsolicited event is delivered synchronously, on the GATT
//! thread, through the callbacks object supplied at registration.

use crate::core::{address::AddressWithType, uuid::Uuid};

use super::{
    channel::GattWriteType,
    ids::{AttributeId, ClientIf, ConnectionId, ServiceId},
    status::GattStatus,
};

/// These callbacks are supplied by each application on register()
pub trait GattClientCallbacks {
    /// Invoked once per result or unsolicited event for this application
    fn on_gatt_client_event(&self, event: GattClientEvent);
}

/// The reason a link went down, as reported by the transport
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DisconnectReason(pub u16);

impl DisconnectReason {
    pub const UNKNOWN: Self = Self(0x0000);
    pub const CONNECTION_TIMEOUT: Self = Self(0x0008);
    pub const TERMINATE_PEER_USER: Self = Self(0x0013);
    pub const TERMINATE_LOCAL_HOST: Self = Self(0x0016);
    pub const FAIL_ESTABLISH: Self = Self(0x003e);
}

/// All events an application may receive
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GattClientEvent {
    Register { status: GattStatus, client_if: Option<ClientIf>, app_uuid: Uuid },
    Deregister { status: GattStatus, client_if: ClientIf },
    Open {
        status: GattStatus,
        client_if: ClientIf,
        address: AddressWithType,
        conn_id: Option<ConnectionId>,
    },
    Close {
        status: GattStatus,
        client_if: ClientIf,
        address: AddressWithType,
        conn_id: Option<ConnectionId>,
        reason: DisconnectReason,
    },
    CancelOpen { status: GattStatus, client_if: ClientIf },
    /// One per cached service matching a search
    SearchResult { conn_id: ConnectionId, service: ServiceId },
    SearchComplete { conn_id: ConnectionId, status: GattStatus },
    Read(ReadResult),
    Write(WriteResult),
    ExecuteWrite { conn_id: ConnectionId, status: GattStatus },
    Notify(Notification),
    /// The peer's attribute table changed; the cache is being rebuilt
    ServiceChanged { address: AddressWithType },
    Listen { status: GattStatus, client_if: ClientIf },
}

/// What a completed read referred to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadTarget {
    Attribute(AttributeId),
    Multiple(Vec<AttributeId>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadResult {
    pub conn_id: ConnectionId,
    pub status: GattStatus,
    pub target: ReadTarget,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteResult {
    pub conn_id: ConnectionId,
    pub status: GattStatus,
    pub id: AttributeId,
    pub write_type: GattWriteType,
}

/// A value pushed by the peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub conn_id: ConnectionId,
    pub address: AddressWithType,
    pub id: AttributeId,
    pub value: Vec<u8>,
    /// false for indications, which the application must confirm()
    pub is_notify: bool,
}
