//! A GattClientModule wired to mocked collaborators, and a peer whose
//! attribute table holds the built-in services plus a heart rate service

use std::{iter::once, rc::Rc};

use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    core::{address::AddressWithType, flags::GattClientFlags, uuid::Uuid},
    gatt::{
        cache_store::CacheEntry,
        callbacks::GattClientEvent,
        channel::GattClientTransport,
        characteristic::CharacteristicProperties,
        ids::{
            AttHandle, CharacteristicId, ClientIf, ConnectionId, GattId, ServiceId, TransportIndex,
        },
        mocks::{
            mock_cache_store::{MockCacheStore, MockCacheStoreEvent},
            mock_callbacks::MockCallbacks,
            mock_peer::MockPeer,
            mock_transport::{MockTransport, MockTransportEvent},
        },
        server::{
            gatt_database::{
                GattCharacteristicWithHandle, GattDatabase, GattDescriptorWithHandle,
                GattServiceWithHandle, StaticDatastore,
            },
            services::{gatt::CLIENT_CHARACTERISTIC_CONFIGURATION_UUID, register_builtin_services},
        },
    },
};

use super::{server_cache::DiscoveryStep, ClcbState, GattClientModule, RemoteServerRecord};

pub const APP_UUID: Uuid = Uuid::new(0xabcd);

pub const HEART_RATE_SERVICE: ServiceId = ServiceId::primary(Uuid::new(0x180d), 0);
pub const MEASUREMENT: CharacteristicId = CharacteristicId {
    service: HEART_RATE_SERVICE,
    characteristic: GattId::new(Uuid::new(0x2a37), 0),
};
pub const BODY_SENSOR_LOCATION: CharacteristicId = CharacteristicId {
    service: HEART_RATE_SERVICE,
    characteristic: GattId::new(Uuid::new(0x2a38), 0),
};
pub const CCC_ID: GattId = GattId::new(CLIENT_CHARACTERISTIC_CONFIGURATION_UUID, 0);

const HEART_RATE_HANDLE: AttHandle = AttHandle(40);
pub const MEASUREMENT_HANDLE: AttHandle = AttHandle(42);
pub const MEASUREMENT_CCC_HANDLE: AttHandle = AttHandle(43);
pub const BODY_SENSOR_LOCATION_HANDLE: AttHandle = AttHandle(45);

/// The built-in services, then a heart rate service at 40..=45
pub fn sample_database() -> GattDatabase {
    let mut database = GattDatabase::new();
    register_builtin_services(&mut database).unwrap();
    database
        .add_service_with_handles(
            GattServiceWithHandle {
                handle: HEART_RATE_HANDLE,
                type_: HEART_RATE_SERVICE.id.uuid,
                characteristics: vec![
                    GattCharacteristicWithHandle {
                        handle: MEASUREMENT_HANDLE,
                        type_: MEASUREMENT.characteristic.uuid,
                        properties: CharacteristicProperties::NOTIFY,
                        descriptors: vec![GattDescriptorWithHandle {
                            handle: MEASUREMENT_CCC_HANDLE,
                            type_: CLIENT_CHARACTERISTIC_CONFIGURATION_UUID,
                        }],
                    },
                    GattCharacteristicWithHandle {
                        handle: BODY_SENSOR_LOCATION_HANDLE,
                        type_: BODY_SENSOR_LOCATION.characteristic.uuid,
                        properties: CharacteristicProperties::READ,
                        descriptors: vec![],
                    },
                ],
            },
            Rc::new(StaticDatastore::new([
                (MEASUREMENT_CCC_HANDLE, vec![0, 0]),
                (BODY_SENSOR_LOCATION_HANDLE, vec![1]),
            ])),
        )
        .unwrap();
    database
}

/// Everything queued on a channel so far
pub fn drain<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
    let mut out = vec![];
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

pub struct Harness {
    pub module: GattClientModule,
    pub transport: Rc<MockTransport>,
    pub transport_rx: UnboundedReceiver<MockTransportEvent>,
    pub cache_rx: UnboundedReceiver<MockCacheStoreEvent>,
    pub peer: MockPeer,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_flags(vec![])
    }

    /// Persistence is off unless the flags turn it back on
    pub fn with_flags(flags: Vec<&str>) -> Self {
        let flags = GattClientFlags::parse(
            once("INIT_persist_server_cache=false").chain(flags).map(String::from).collect(),
        );
        let (transport, transport_rx) = MockTransport::new();
        let transport = Rc::new(transport);
        let (cache_store, cache_rx) = MockCacheStore::new();
        let module = GattClientModule::new(flags, transport.clone(), Rc::new(cache_store));
        Self { module, transport, transport_rx, cache_rx, peer: MockPeer::new(sample_database()) }
    }

    pub fn register_app(&mut self) -> (ClientIf, UnboundedReceiver<GattClientEvent>) {
        let (callbacks, events) = MockCallbacks::new();
        let client_if = self.module.register(APP_UUID, Rc::new(callbacks)).unwrap();
        (client_if, events)
    }

    /// The connection id the transport assigns this client on the link
    pub fn conn_id(&self, client_if: ClientIf, address: AddressWithType) -> ConnectionId {
        self.transport.get_conn_id_if_connected(client_if, address).unwrap()
    }

    /// Bring the link up, open it directly and serve discovery to the end
    pub fn connect_with_cache(
        &mut self,
        client_if: ClientIf,
        address: AddressWithType,
    ) -> ConnectionId {
        self.transport.add_link(address);
        self.module.open(client_if, address, true).unwrap();
        self.serve_discovery();
        let conn_id = self.conn_id(client_if, address);
        assert_eq!(self.module.connection_state(conn_id), Some(ClcbState::Connected));
        conn_id
    }

    /// Answer every discovery request issued so far, and those issued while
    /// answering. Returns every other transport event, in order.
    pub fn serve_discovery(&mut self) -> Vec<MockTransportEvent> {
        let mut others = vec![];
        while let Ok(event) = self.transport_rx.try_recv() {
            match event {
                MockTransportEvent::Discover(conn_id, request) => {
                    self.peer.respond(&mut self.module, conn_id, request)
                }
                event => others.push(event),
            }
        }
        others
    }

    /// The table live discovery of the peer produces
    pub fn expected_snapshot(&self) -> Vec<CacheEntry> {
        let conn_id = ConnectionId::new(TransportIndex(1), ClientIf(1));
        let mut record = RemoteServerRecord::new(AddressWithType::EMPTY);
        let mut request = record.begin_discovery(conn_id);
        loop {
            for result in self.peer.database.discover(&request) {
                record.on_discovery_result(conn_id, result);
            }
            match record.advance_discovery(conn_id, request.kind()) {
                DiscoveryStep::Next(next) => request = next,
                DiscoveryStep::Done | DiscoveryStep::Ignored => break,
            }
        }
        record.cache().map(|cache| cache.to_entries()).unwrap_or_default()
    }
}
