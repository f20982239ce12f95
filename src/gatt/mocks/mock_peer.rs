//! A simulated remote GATT server, answering the discovery and read requests
//! the client issues through a mocked transport

use crate::gatt::{
    channel::{DiscoveryRequest, GattOpType, OperationPayload},
    client::GattClientModule,
    ids::{AttHandle, ConnectionId},
    server::{
        gatt_database::GattDatabase,
        services::gatt::{service_changed_value, SERVICE_CHANGE_HANDLE},
    },
    status::GattStatus,
};

/// Feeds the contents of a GattDatabase back into a GattClientModule
pub struct MockPeer {
    /// The attribute table of the peer
    pub database: GattDatabase,
}

impl MockPeer {
    /// Constructor
    pub fn new(database: GattDatabase) -> Self {
        Self { database }
    }

    /// Answer one discovery request: every result, then completion
    pub fn respond(
        &self,
        module: &mut GattClientModule,
        conn_id: ConnectionId,
        request: DiscoveryRequest,
    ) {
        for result in self.database.discover(&request) {
            module.on_discovery_result(conn_id, result);
        }
        module.on_discovery_complete(conn_id, request.kind(), GattStatus::Success);
    }

    /// Answer a read of a single handle
    pub fn respond_read(
        &self,
        module: &mut GattClientModule,
        conn_id: ConnectionId,
        handle: AttHandle,
    ) {
        let (status, payload) = match self.database.read(handle) {
            Ok(value) => {
                (GattStatus::Success, Some(OperationPayload::AttributeValue { handle, value }))
            }
            Err(code) => (GattStatus::Att(code.0), None),
        };
        module.on_operation_complete(conn_id, GattOpType::Read, status, payload);
    }

    /// Indicate that the whole attribute table changed
    pub fn indicate_service_changed(&self, module: &mut GattClientModule, conn_id: ConnectionId) {
        module.on_indication_or_notification(
            conn_id,
            true,
            SERVICE_CHANGE_HANDLE,
            service_changed_value(AttHandle(0x0001)..=AttHandle(0xFFFF)),
        );
    }
}
