//! This represents the ATT transport beneath the GATT client, to be either
//! mocked (in test) or linked to the native stack (in production).
//!
//! Every primitive returns synchronously whether the request was accepted.
//! The outcome arrives later through the `on_*` entry points of
//! [`GattClientModule`](super::client::GattClientModule).

use crate::core::{address::AddressWithType, uuid::Uuid};

use super::{
    characteristic::CharacteristicProperties,
    ids::{AttHandle, ClientIf, ConnectionId},
    status::GattStatus,
};

/// An instance of this trait will be provided to the GattClientModule on
/// initialization.
pub trait GattClientTransport {
    /// Allocate an interface id for a new client application
    fn register(&self, app_uuid: Uuid) -> Option<ClientIf>;

    /// Enable an interface id previously returned from register()
    fn start_if(&self, client_if: ClientIf);

    /// Release an interface id
    fn deregister(&self, client_if: ClientIf);

    /// Start a direct or background connection attempt. Returns false if the
    /// attempt could not be started.
    fn connect(&self, client_if: ClientIf, address: AddressWithType, is_direct: bool) -> bool;

    /// Cancel a pending connection attempt. Returns false if nothing was
    /// pending (e.g. the connection already completed).
    fn cancel_connect(&self, client_if: ClientIf, address: AddressWithType, is_direct: bool)
        -> bool;

    /// Start or stop accepting connections on behalf of a client, for one
    /// device or (address None) every device
    fn listen(&self, client_if: ClientIf, start: bool, address: Option<AddressWithType>) -> bool;

    /// Release a connection id
    fn disconnect(&self, conn_id: ConnectionId) -> GattStatus;

    /// The connection id this client holds on a live link to the device, if any
    fn get_conn_id_if_connected(
        &self,
        client_if: ClientIf,
        address: AddressWithType,
    ) -> Option<ConnectionId>;

    /// The peer a connection id refers to
    fn get_connection_info(&self, conn_id: ConnectionId) -> Option<AddressWithType>;

    /// Start one phase of attribute discovery. Results are reported through
    /// on_discovery_result(), then on_discovery_complete().
    fn discover(&self, conn_id: ConnectionId, request: DiscoveryRequest) -> GattStatus;

    /// Read one or several attribute values
    fn read(&self, conn_id: ConnectionId, params: ReadParams) -> GattStatus;

    /// Write (or prepare to write) an attribute value. Completion is
    /// reported for every write type, including commands.
    fn write(&self, conn_id: ConnectionId, write_type: GattWriteType, value: AttValue)
        -> GattStatus;

    /// Commit (is_execute) or cancel all prepared writes
    fn execute_write(&self, conn_id: ConnectionId, is_execute: bool) -> GattStatus;

    /// Acknowledge a handle value indication
    fn send_handle_value_confirm(&self, conn_id: ConnectionId, handle: AttHandle) -> GattStatus;
}

/// The three phases of attribute discovery
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryType {
    PrimaryServices,
    Characteristics,
    Descriptors,
}

/// One phase of attribute discovery
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryRequest {
    /// Discover all primary services
    PrimaryServices,
    /// Discover all characteristics in a handle range
    Characteristics { start: AttHandle, end: AttHandle },
    /// Discover all descriptors in a handle range
    Descriptors { start: AttHandle, end: AttHandle },
}

impl DiscoveryRequest {
    /// The phase this request belongs to
    pub fn kind(&self) -> DiscoveryType {
        match self {
            DiscoveryRequest::PrimaryServices => DiscoveryType::PrimaryServices,
            DiscoveryRequest::Characteristics { .. } => DiscoveryType::Characteristics,
            DiscoveryRequest::Descriptors { .. } => DiscoveryType::Descriptors,
        }
    }
}

/// One attribute reported by the peer during discovery
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryResult {
    Service { uuid: Uuid, start_handle: AttHandle, end_handle: AttHandle },
    Characteristic {
        declaration_handle: AttHandle,
        value_handle: AttHandle,
        uuid: Uuid,
        properties: CharacteristicProperties,
    },
    Descriptor { handle: AttHandle, uuid: Uuid },
}

/// The authentication requirements of a read or write
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuthRequirement {
    #[default]
    None,
    NoMitm,
    Mitm,
    SignedNoMitm,
    SignedMitm,
}

/// The kinds of read available
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadParams {
    ByHandle { handle: AttHandle, auth_req: AuthRequirement },
    Multiple { handles: Vec<AttHandle>, auth_req: AuthRequirement },
}

/// The various write types available (requests + commands)
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum GattWriteType {
    /// Reliable, expects a response (WRITE_REQ or PREPARE_WRITE_REQ)
    Request(GattWriteRequestType),
    /// Unreliable, no response required (WRITE_CMD)
    Command,
}

/// The types of write requests (that need responses)
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum GattWriteRequestType {
    /// Atomic (WRITE_REQ)
    Request,
    /// Transactional, should not be committed yet (PREPARE_WRITE_REQ)
    Prepare {
        /// The byte offset at which to write
        offset: u16,
    },
}

/// An attribute value to be written
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttValue {
    pub handle: AttHandle,
    pub offset: u16,
    pub value: Vec<u8>,
    pub auth_req: AuthRequirement,
}

/// The operations whose completion is reported via on_operation_complete()
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GattOpType {
    Read,
    Write,
    ExecuteWrite,
}

/// Data accompanying a successful operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationPayload {
    /// A value read from the peer. For a read-multiple the handle is the
    /// first requested handle and the value is the concatenated response.
    AttributeValue { handle: AttHandle, value: Vec<u8> },
    /// The handle a write applied to
    Handle(AttHandle),
}
