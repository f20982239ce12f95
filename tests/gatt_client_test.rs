use std::rc::Rc;

use bluetooth_gattc::{
    core::{
        address::{AddressType, AddressWithType},
        flags::GattClientFlags,
        uuid::Uuid,
    },
    gatt::{
        cache_store::{AsyncCacheStore, InMemoryCacheDatastore},
        callbacks::{GattClientEvent, ReadResult, ReadTarget},
        channel::{AuthRequirement, GattClientTransport, ReadParams},
        client::{ClcbState, GattClientModule},
        ids::{AttributeId, CharacteristicId, ClientIf, ConnectionId, GattId, ServiceId},
        mocks::{
            mock_cache_store::MockCacheStore,
            mock_callbacks::MockCallbacks,
            mock_peer::MockPeer,
            mock_transport::{MockTransport, MockTransportEvent},
        },
        server::{
            gatt_database::GattDatabase,
            services::{
                gap::{DEVICE_APPEARANCE_UUID, DEVICE_NAME_UUID, GAP_SERVICE_UUID},
                gatt::{GATT_SERVICE_UUID, SERVICE_CHANGE_HANDLE, SERVICE_CHANGE_UUID},
                register_builtin_services,
            },
        },
        status::GattStatus,
    },
    new_event_loop, GattClientHandle,
};
use tokio::{
    sync::{mpsc::UnboundedReceiver, oneshot},
    task::{spawn_local, yield_now},
};
use utils::start_test;

mod utils;

const ADDRESS: AddressWithType = AddressWithType::new([1, 2, 3, 4, 5, 6], AddressType::Public);
const APP_UUID: Uuid = Uuid::new(0x1234);
const GAP_SERVICE: ServiceId = ServiceId::primary(GAP_SERVICE_UUID, 0);
const DEVICE_NAME: CharacteristicId = CharacteristicId {
    service: GAP_SERVICE,
    characteristic: GattId::new(DEVICE_NAME_UUID, 0),
};
const DEVICE_APPEARANCE: CharacteristicId = CharacteristicId {
    service: GAP_SERVICE,
    characteristic: GattId::new(DEVICE_APPEARANCE_UUID, 0),
};

fn builtin_database() -> GattDatabase {
    let mut database = GattDatabase::new();
    register_builtin_services(&mut database).unwrap();
    database
}

fn drain<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
    let mut out = vec![];
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

/// A module with persistence turned off, driven synchronously
fn start_client_module(
) -> (GattClientModule, Rc<MockTransport>, UnboundedReceiver<MockTransportEvent>) {
    let (transport, transport_rx) = MockTransport::new();
    let transport = Rc::new(transport);
    let (cache_store, _) = MockCacheStore::new();
    let module = GattClientModule::new(
        GattClientFlags::parse(vec!["INIT_persist_server_cache=false".into()]),
        transport.clone(),
        Rc::new(cache_store),
    );
    (module, transport, transport_rx)
}

fn connect_and_discover(
    module: &mut GattClientModule,
    transport: &MockTransport,
    transport_rx: &mut UnboundedReceiver<MockTransportEvent>,
    peer: &MockPeer,
) -> (ConnectionId, UnboundedReceiver<GattClientEvent>) {
    let (callbacks, events) = MockCallbacks::new();
    let client_if = module.register(APP_UUID, Rc::new(callbacks)).unwrap();
    transport.add_link(ADDRESS);
    module.open(client_if, ADDRESS, true).unwrap();
    serve(module, transport_rx, peer);
    let conn_id = transport.get_conn_id_if_connected(client_if, ADDRESS).unwrap();
    (conn_id, events)
}

/// Answer discovery requests until none remain; returns the other events
fn serve(
    module: &mut GattClientModule,
    transport_rx: &mut UnboundedReceiver<MockTransportEvent>,
    peer: &MockPeer,
) -> Vec<MockTransportEvent> {
    let mut others = vec![];
    while let Ok(event) = transport_rx.try_recv() {
        match event {
            MockTransportEvent::Discover(conn_id, request) => {
                peer.respond(module, conn_id, request)
            }
            event => others.push(event),
        }
    }
    others
}

/// Run a closure on the GATT client thread and wait for its result
async fn query<T: Send + 'static>(
    handle: &GattClientHandle,
    f: impl FnOnce(&mut GattClientModule) -> T + Send + 'static,
) -> T {
    let (tx, rx) = oneshot::channel();
    handle
        .do_in_gatt_thread(move |module| {
            tx.send(f(module)).ok();
        })
        .unwrap();
    rx.await.unwrap()
}

#[test]
fn test_builtin_services_discovered() {
    // arrange
    let (mut module, transport, mut transport_rx) = start_client_module();
    let peer = MockPeer::new(builtin_database());

    // act
    let (conn_id, mut events) =
        connect_and_discover(&mut module, &transport, &mut transport_rx, &peer);
    module.search(conn_id, None).unwrap();

    // assert
    assert_eq!(module.connection_state(conn_id), Some(ClcbState::Connected));
    let services: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            GattClientEvent::SearchResult { service, .. } => Some(service.id.uuid),
            _ => None,
        })
        .collect();
    assert_eq!(services, vec![GATT_SERVICE_UUID, GAP_SERVICE_UUID]);
    let characteristics = module.characteristics(conn_id, &GAP_SERVICE).unwrap();
    assert_eq!(characteristics.len(), 3);
    assert_eq!(characteristics[0].0, DEVICE_NAME);
    let service_changed = CharacteristicId {
        service: ServiceId::primary(GATT_SERVICE_UUID, 0),
        characteristic: GattId::new(SERVICE_CHANGE_UUID, 0),
    };
    assert_eq!(module.descriptors(conn_id, &service_changed).unwrap().len(), 1);
}

#[test]
fn test_read_gap_characteristics() {
    // arrange
    let (mut module, transport, mut transport_rx) = start_client_module();
    let peer = MockPeer::new(builtin_database());
    let (conn_id, mut events) =
        connect_and_discover(&mut module, &transport, &mut transport_rx, &peer);
    drain(&mut events);

    // act
    module
        .read(conn_id, AttributeId::characteristic(DEVICE_APPEARANCE), AuthRequirement::None)
        .unwrap();
    let Some(MockTransportEvent::Read(_, ReadParams::ByHandle { handle: appearance, .. })) =
        transport_rx.try_recv().ok()
    else {
        panic!("expected a read of the appearance");
    };
    peer.respond_read(&mut module, conn_id, appearance);
    module.read(conn_id, AttributeId::characteristic(DEVICE_NAME), AuthRequirement::None).unwrap();
    let Some(MockTransportEvent::Read(_, ReadParams::ByHandle { handle: name, .. })) =
        transport_rx.try_recv().ok()
    else {
        panic!("expected a read of the device name");
    };
    peer.respond_read(&mut module, conn_id, name);

    // assert
    assert_eq!(
        drain(&mut events),
        vec![
            GattClientEvent::Read(ReadResult {
                conn_id,
                status: GattStatus::Success,
                target: ReadTarget::Attribute(AttributeId::characteristic(DEVICE_APPEARANCE)),
                value: vec![0x00, 0x00],
            }),
            GattClientEvent::Read(ReadResult {
                conn_id,
                status: GattStatus::Att(0x05),
                target: ReadTarget::Attribute(AttributeId::characteristic(DEVICE_NAME)),
                value: vec![],
            }),
        ]
    );
}

#[test]
fn test_service_changed_rebuilds_cache() {
    // arrange
    let (mut module, transport, mut transport_rx) = start_client_module();
    let peer = MockPeer::new(builtin_database());
    let (conn_id, mut events) =
        connect_and_discover(&mut module, &transport, &mut transport_rx, &peer);
    drain(&mut events);

    // act
    peer.indicate_service_changed(&mut module, conn_id);
    let state_during = module.connection_state(conn_id);
    let others = serve(&mut module, &mut transport_rx, &peer);

    // assert
    assert_eq!(state_during, Some(ClcbState::Discovering));
    assert_eq!(others, vec![MockTransportEvent::Confirm(conn_id, SERVICE_CHANGE_HANDLE)]);
    assert_eq!(drain(&mut events), vec![GattClientEvent::ServiceChanged { address: ADDRESS }]);
    assert_eq!(module.connection_state(conn_id), Some(ClcbState::Connected));
    assert_eq!(module.characteristics(conn_id, &GAP_SERVICE).map(|c| c.len()), Ok(3));
}

#[test]
fn test_listen_reports_status() {
    // arrange
    let (mut module, transport, mut transport_rx) = start_client_module();
    let (callbacks, mut events) = MockCallbacks::new();
    let client_if = module.register(APP_UUID, Rc::new(callbacks)).unwrap();
    drain(&mut events);
    transport.set_listen_result(false);

    // act
    let result = module.listen(client_if, true, None);

    // assert
    assert!(result.is_ok());
    assert!(drain(&mut transport_rx).contains(&MockTransportEvent::Listen {
        client_if,
        start: true,
        address: None
    }));
    assert_eq!(
        drain(&mut events),
        vec![GattClientEvent::Listen { status: GattStatus::Error, client_if }]
    );
}

#[test]
fn test_table_persists_across_restart() {
    start_test(async {
        // arrange
        let datastore = Rc::new(InMemoryCacheDatastore::new());
        let database = builtin_database();

        // act: discover through a first event loop, which saves the table
        let (handle, event_loop) = new_event_loop();
        let (transport, mut transport_rx) = MockTransport::new();
        let transport = Rc::new(transport);
        let cache_store = AsyncCacheStore::new(datastore.clone(), handle.clone(), 2);
        let module = GattClientModule::new(
            GattClientFlags::default(),
            transport.clone(),
            Rc::new(cache_store),
        );
        let running = spawn_local(event_loop.run(module));
        let client_if = register(&handle).await;
        let tcb = transport.add_link(ADDRESS);
        let conn_id = ConnectionId::new(tcb, client_if);
        handle
            .do_in_gatt_thread(move |module| module.open(client_if, ADDRESS, true).unwrap())
            .unwrap();
        while datastore.snapshot(ADDRESS).is_none() {
            match transport_rx.try_recv() {
                Ok(MockTransportEvent::Discover(conn_id, request)) => {
                    let results = database.discover(&request);
                    handle
                        .do_in_gatt_thread(move |module| {
                            for result in results {
                                module.on_discovery_result(conn_id, result);
                            }
                            module.on_discovery_complete(
                                conn_id,
                                request.kind(),
                                GattStatus::Success,
                            );
                        })
                        .unwrap();
                }
                _ => yield_now().await,
            }
        }
        let discovered = query(&handle, move |module| {
            module.server_record(ADDRESS).and_then(|record| record.cache()).map(|c| c.to_entries())
        })
        .await;
        handle.stop().unwrap();
        running.await.unwrap();

        // act: a second event loop loads the table instead of discovering
        let (handle, event_loop) = new_event_loop();
        let (transport, mut transport_rx) = MockTransport::new();
        let transport = Rc::new(transport);
        let cache_store = AsyncCacheStore::new(datastore.clone(), handle.clone(), 2);
        let module = GattClientModule::new(
            GattClientFlags::default(),
            transport.clone(),
            Rc::new(cache_store),
        );
        let running = spawn_local(event_loop.run(module));
        let client_if = register(&handle).await;
        let tcb = transport.add_link(ADDRESS);
        let conn_id = ConnectionId::new(tcb, client_if);
        handle
            .do_in_gatt_thread(move |module| module.open(client_if, ADDRESS, true).unwrap())
            .unwrap();
        while query(&handle, move |module| module.connection_state(conn_id)).await
            != Some(ClcbState::Connected)
        {
            yield_now().await;
        }
        let loaded = query(&handle, move |module| {
            module.server_record(ADDRESS).and_then(|record| record.cache()).map(|c| c.to_entries())
        })
        .await;
        handle.stop().unwrap();
        running.await.unwrap();

        // assert
        assert_eq!(discovered, datastore.snapshot(ADDRESS));
        assert_eq!(loaded, discovered);
        assert!(!drain(&mut transport_rx)
            .iter()
            .any(|event| matches!(event, MockTransportEvent::Discover(..))));
    });
}

async fn register(handle: &GattClientHandle) -> ClientIf {
    query(handle, |module| {
        let (callbacks, _events) = MockCallbacks::new();
        module.register(APP_UUID, Rc::new(callbacks)).unwrap()
    })
    .await
}
