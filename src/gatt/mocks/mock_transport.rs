//! Mocked implementation of GattClientTransport for use in test

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeSet, HashMap},
};

use crate::{
    core::{address::AddressWithType, flags::MAX_CLIENT_APPS, uuid::Uuid},
    gatt::{
        channel::{AttValue, DiscoveryRequest, GattClientTransport, GattWriteType, ReadParams},
        ids::{AttHandle, ClientIf, ConnectionId, TransportIndex},
        status::GattStatus,
    },
};
use tokio::sync::mpsc::{self, unbounded_channel, UnboundedReceiver};

/// Events representing calls to GattClientTransport
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockTransportEvent {
    Register(Uuid),
    StartIf(ClientIf),
    Deregister(ClientIf),
    Connect { client_if: ClientIf, address: AddressWithType, is_direct: bool },
    CancelConnect { client_if: ClientIf, address: AddressWithType, is_direct: bool },
    Listen { client_if: ClientIf, start: bool, address: Option<AddressWithType> },
    Disconnect(ConnectionId),
    Discover(ConnectionId, DiscoveryRequest),
    Read(ConnectionId, ReadParams),
    Write(ConnectionId, GattWriteType, AttValue),
    ExecuteWrite(ConnectionId, bool),
    Confirm(ConnectionId, AttHandle),
}

/// Routes calls to GattClientTransport into a channel of MockTransportEvents,
/// and simulates the links that are up. Links never come up on their own:
/// tests add them with add_link().
pub struct MockTransport {
    tx: mpsc::UnboundedSender<MockTransportEvent>,
    registered: RefCell<BTreeSet<ClientIf>>,
    links: RefCell<HashMap<AddressWithType, TransportIndex>>,
    connect_result: Cell<bool>,
    cancel_connect_result: Cell<bool>,
    listen_result: Cell<bool>,
    operation_status: Cell<GattStatus>,
}

impl MockTransport {
    /// Constructor. Returns self and the RX side of the associated channel.
    pub fn new() -> (Self, UnboundedReceiver<MockTransportEvent>) {
        let (tx, rx) = unbounded_channel();
        (
            Self {
                tx,
                registered: RefCell::default(),
                links: RefCell::default(),
                connect_result: Cell::new(true),
                cancel_connect_result: Cell::new(true),
                listen_result: Cell::new(true),
                operation_status: Cell::new(GattStatus::Success),
            },
            rx,
        )
    }

    /// Bring up a link to this peer, returning its transport index
    pub fn add_link(&self, address: AddressWithType) -> TransportIndex {
        let mut links = self.links.borrow_mut();
        let next = links.values().map(|tcb_idx| tcb_idx.0).max().unwrap_or(0) + 1;
        *links.entry(address).or_insert(TransportIndex(next))
    }

    /// Take down the link to this peer
    pub fn remove_link(&self, address: AddressWithType) {
        self.links.borrow_mut().remove(&address);
    }

    /// The value returned by every subsequent connect()
    pub fn set_connect_result(&self, accepted: bool) {
        self.connect_result.set(accepted);
    }

    /// The value returned by every subsequent cancel_connect()
    pub fn set_cancel_connect_result(&self, cancelled: bool) {
        self.cancel_connect_result.set(cancelled);
    }

    /// The value returned by every subsequent listen()
    pub fn set_listen_result(&self, accepted: bool) {
        self.listen_result.set(accepted);
    }

    /// The status returned by every subsequent link-level primitive
    pub fn set_operation_status(&self, status: GattStatus) {
        self.operation_status.set(status);
    }

    fn send(&self, event: MockTransportEvent) {
        self.tx.send(event).ok();
    }
}

impl GattClientTransport for MockTransport {
    fn register(&self, app_uuid: Uuid) -> Option<ClientIf> {
        self.send(MockTransportEvent::Register(app_uuid));
        let mut registered = self.registered.borrow_mut();
        let client_if =
            (1..=MAX_CLIENT_APPS as u8).map(ClientIf).find(|id| !registered.contains(id))?;
        registered.insert(client_if);
        Some(client_if)
    }

    fn start_if(&self, client_if: ClientIf) {
        self.send(MockTransportEvent::StartIf(client_if));
    }

    fn deregister(&self, client_if: ClientIf) {
        self.registered.borrow_mut().remove(&client_if);
        self.send(MockTransportEvent::Deregister(client_if));
    }

    fn connect(&self, client_if: ClientIf, address: AddressWithType, is_direct: bool) -> bool {
        self.send(MockTransportEvent::Connect { client_if, address, is_direct });
        self.connect_result.get()
    }

    fn cancel_connect(
        &self,
        client_if: ClientIf,
        address: AddressWithType,
        is_direct: bool,
    ) -> bool {
        self.send(MockTransportEvent::CancelConnect { client_if, address, is_direct });
        self.cancel_connect_result.get()
    }

    fn listen(&self, client_if: ClientIf, start: bool, address: Option<AddressWithType>) -> bool {
        self.send(MockTransportEvent::Listen { client_if, start, address });
        self.listen_result.get()
    }

    fn disconnect(&self, conn_id: ConnectionId) -> GattStatus {
        self.send(MockTransportEvent::Disconnect(conn_id));
        self.operation_status.get()
    }

    fn get_conn_id_if_connected(
        &self,
        client_if: ClientIf,
        address: AddressWithType,
    ) -> Option<ConnectionId> {
        let tcb_idx = *self.links.borrow().get(&address)?;
        Some(ConnectionId::new(tcb_idx, client_if))
    }

    fn get_connection_info(&self, conn_id: ConnectionId) -> Option<AddressWithType> {
        let tcb_idx = conn_id.get_tcb_idx();
        self.links
            .borrow()
            .iter()
            .find(|(_, link)| **link == tcb_idx)
            .map(|(address, _)| *address)
    }

    fn discover(&self, conn_id: ConnectionId, request: DiscoveryRequest) -> GattStatus {
        self.send(MockTransportEvent::Discover(conn_id, request));
        self.operation_status.get()
    }

    fn read(&self, conn_id: ConnectionId, params: ReadParams) -> GattStatus {
        self.send(MockTransportEvent::Read(conn_id, params));
        self.operation_status.get()
    }

    fn write(
        &self,
        conn_id: ConnectionId,
        write_type: GattWriteType,
        value: AttValue,
    ) -> GattStatus {
        self.send(MockTransportEvent::Write(conn_id, write_type, value));
        self.operation_status.get()
    }

    fn execute_write(&self, conn_id: ConnectionId, is_execute: bool) -> GattStatus {
        self.send(MockTransportEvent::ExecuteWrite(conn_id, is_execute));
        self.operation_status.get()
    }

    fn send_handle_value_confirm(&self, conn_id: ConnectionId, handle: AttHandle) -> GattStatus {
        self.send(MockTransportEvent::Confirm(conn_id, handle));
        self.operation_status.get()
    }
}
