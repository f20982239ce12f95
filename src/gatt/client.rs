//! The GATT client. Owns the registration table, the CLCB pool and the
//! per-device server records, and is driven by application calls, transport
//! completions and persistence completions, all on one thread.

mod actions;
mod attribute_map;
mod clcb;
mod connections;
mod notification;
mod registration;
mod server_cache;
mod state_machine;

#[cfg(test)]
pub(crate) mod test_utils;

use std::{
    collections::{BTreeMap, HashMap},
    rc::Rc,
};

use log::{debug, error, warn};

use crate::{
    connection::{BackgroundConnectionTracker, LinkTracker},
    core::{address::AddressWithType, flags::GattClientFlags, uuid::Uuid},
};

use self::{
    clcb::{
        Clcb, ClcbId, ConfirmRequest, ExecuteWriteRequest, ReadMultipleRequest, ReadRequest,
        SearchRequest, WriteRequest,
    },
    registration::ClientRegistration,
    server_cache::DiscoveryStep,
    state_machine::{ClcbEvent, OperationCompletion},
};

use super::{
    cache_store::{CacheEntry, GattCacheStore},
    callbacks::GattClientEvent,
    channel::{
        AuthRequirement, DiscoveryResult, DiscoveryType, GattClientTransport, GattOpType,
        GattWriteType, OperationPayload,
    },
    characteristic::CharacteristicProperties,
    ids::{AttributeId, CharacteristicId, ClientIf, ConnectionId, ServiceId},
    status::{CacheLoadStatus, GattClientError, GattStatus},
};

pub use self::{
    clcb::ClcbState,
    server_cache::{
        CachedCharacteristic, CachedDescriptor, CachedService, RemoteServerRecord, ServerCache,
        ServerCacheState,
    },
};

/// Lifecycle of the whole module
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleState {
    Enabled,
    /// Waiting for the remaining applications to finish deregistering
    Disabling,
    Disabled,
}

/// The GATT client context. Exactly one exists per event loop.
pub struct GattClientModule {
    flags: GattClientFlags,
    state: ModuleState,
    transport: Rc<dyn GattClientTransport>,
    cache_store: Rc<dyn GattCacheStore>,
    registrations: BTreeMap<ClientIf, ClientRegistration>,
    clcbs: BTreeMap<ClcbId, Clcb>,
    next_clcb_id: ClcbId,
    servers: HashMap<AddressWithType, RemoteServerRecord>,
    background: BackgroundConnectionTracker,
    links: LinkTracker,
}

impl GattClientModule {
    /// Constructor
    pub fn new(
        flags: GattClientFlags,
        transport: Rc<dyn GattClientTransport>,
        cache_store: Rc<dyn GattCacheStore>,
    ) -> Self {
        Self {
            background: BackgroundConnectionTracker::new(flags.max_background_entries),
            flags,
            state: ModuleState::Enabled,
            transport,
            cache_store,
            registrations: BTreeMap::new(),
            clcbs: BTreeMap::new(),
            next_clcb_id: ClcbId(0),
            servers: HashMap::new(),
            links: LinkTracker::new(),
        }
    }

    /// The flags this module was configured with
    pub fn flags(&self) -> &GattClientFlags {
        &self.flags
    }

    /// Current lifecycle state
    pub fn state(&self) -> ModuleState {
        self.state
    }

    /// Whether a client interface is registered
    pub fn is_registered(&self, client_if: ClientIf) -> bool {
        self.registrations.contains_key(&client_if)
    }

    /// Everything known about a device, if it was ever connected
    pub fn server_record(&self, address: AddressWithType) -> Option<&RemoteServerRecord> {
        self.servers.get(&address)
    }

    /// The state of the CLCB holding a connection id
    pub fn connection_state(&self, conn_id: ConnectionId) -> Option<ClcbState> {
        let id = self.find_clcb_by_conn_id(conn_id)?;
        self.clcbs.get(&id).map(|clcb| clcb.state)
    }

    /// Whether the CLCB holding a connection id has an operation in flight or
    /// queued
    pub fn has_pending_operation(&self, conn_id: ConnectionId) -> bool {
        self.find_clcb_by_conn_id(conn_id)
            .and_then(|id| self.clcbs.get(&id))
            .is_some_and(|clcb| clcb.pending.is_some())
    }

    /// The background connection table
    pub fn background_connections(&self) -> &BackgroundConnectionTracker {
        &self.background
    }

    fn check_enabled(&self) -> Result<(), GattClientError> {
        match self.state {
            ModuleState::Enabled => Ok(()),
            _ => Err(GattClientError::NotEnabled),
        }
    }

    fn check_client(&self, client_if: ClientIf) -> Result<(), GattClientError> {
        self.check_enabled()?;
        if !self.registrations.contains_key(&client_if) {
            error!("unknown client_if {client_if:?}");
            return Err(GattClientError::UnknownClient(client_if));
        }
        Ok(())
    }

    fn dispatch(&mut self, conn_id: ConnectionId, event: ClcbEvent) -> Result<(), GattClientError> {
        self.check_enabled()?;
        let id = self
            .find_clcb_by_conn_id(conn_id)
            .ok_or(GattClientError::UnknownConnection(conn_id))?;
        self.sm_execute(id, event);
        Ok(())
    }

    /// Open a connection to a device. A direct open allocates a CLCB right
    /// away; a background open is tracked until the device connects.
    pub fn open(
        &mut self,
        client_if: ClientIf,
        address: AddressWithType,
        is_direct: bool,
    ) -> Result<(), GattClientError> {
        self.check_client(client_if)?;
        if !is_direct {
            self.init_background_connection(client_if, address);
            return Ok(());
        }

        let Some(id) = self
            .find_clcb_by_cif(client_if, address)
            .or_else(|| self.alloc_clcb(client_if, address))
        else {
            error!("no resources to open a new connection to {address}");
            self.send_event(
                client_if,
                GattClientEvent::Open {
                    status: GattStatus::NoResources,
                    client_if,
                    address,
                    conn_id: None,
                },
            );
            return Err(GattClientError::NoResources);
        };
        self.sm_execute(id, ClcbEvent::ApiOpen);
        Ok(())
    }

    /// Cancel a pending direct or background open
    pub fn cancel_open(
        &mut self,
        client_if: ClientIf,
        address: AddressWithType,
        is_direct: bool,
    ) -> Result<(), GattClientError> {
        self.check_client(client_if)?;
        if !is_direct {
            self.cancel_background_connection(client_if, address);
            return Ok(());
        }

        match self.find_clcb_by_cif(client_if, address) {
            Some(id) => self.sm_execute(id, ClcbEvent::ApiCancelOpen),
            None => {
                error!("no connection to {address} to cancel");
                self.send_event(
                    client_if,
                    GattClientEvent::CancelOpen { status: GattStatus::Error, client_if },
                );
            }
        }
        Ok(())
    }

    /// Close a connection. The Close event is delivered before this returns.
    pub fn close(&mut self, conn_id: ConnectionId) -> Result<(), GattClientError> {
        self.dispatch(conn_id, ClcbEvent::ApiClose)
    }

    /// Report the cached services of the device, optionally only those with
    /// a given UUID, followed by SearchComplete
    pub fn search(
        &mut self,
        conn_id: ConnectionId,
        service_uuid: Option<Uuid>,
    ) -> Result<(), GattClientError> {
        self.dispatch(conn_id, ClcbEvent::ApiSearch(SearchRequest { service_uuid }))
    }

    /// Read a characteristic value or descriptor
    pub fn read(
        &mut self,
        conn_id: ConnectionId,
        id: AttributeId,
        auth_req: AuthRequirement,
    ) -> Result<(), GattClientError> {
        self.dispatch(conn_id, ClcbEvent::ApiRead(ReadRequest { id, auth_req }))
    }

    /// Read several attributes in one request
    pub fn read_multiple(
        &mut self,
        conn_id: ConnectionId,
        ids: Vec<AttributeId>,
        auth_req: AuthRequirement,
    ) -> Result<(), GattClientError> {
        self.dispatch(conn_id, ClcbEvent::ApiReadMultiple(ReadMultipleRequest { ids, auth_req }))
    }

    /// Write a characteristic value or descriptor
    pub fn write(
        &mut self,
        conn_id: ConnectionId,
        id: AttributeId,
        write_type: GattWriteType,
        value: Vec<u8>,
        auth_req: AuthRequirement,
    ) -> Result<(), GattClientError> {
        self.dispatch(
            conn_id,
            ClcbEvent::ApiWrite(WriteRequest { id, write_type, value, auth_req }),
        )
    }

    /// Commit or cancel all prepared writes
    pub fn execute_write(
        &mut self,
        conn_id: ConnectionId,
        is_execute: bool,
    ) -> Result<(), GattClientError> {
        self.dispatch(conn_id, ClcbEvent::ApiExecuteWrite(ExecuteWriteRequest { is_execute }))
    }

    /// Acknowledge an indication forwarded to the application
    pub fn confirm(
        &mut self,
        conn_id: ConnectionId,
        characteristic: CharacteristicId,
    ) -> Result<(), GattClientError> {
        self.dispatch(conn_id, ClcbEvent::ApiConfirm(ConfirmRequest { characteristic }))
    }

    /// Ask to be connected to a device whenever it becomes reachable (or stop
    /// asking). Returns whether the tracker accepted the change.
    pub fn mark_background_connection(
        &mut self,
        client_if: ClientIf,
        address: AddressWithType,
        enable: bool,
    ) -> Result<bool, GattClientError> {
        self.check_client(client_if)?;
        Ok(self.background.mark(client_if, address, enable, false))
    }

    /// The characteristics of a cached service
    pub fn characteristics(
        &self,
        conn_id: ConnectionId,
        service: &ServiceId,
    ) -> Result<Vec<(CharacteristicId, CharacteristicProperties)>, GattClientError> {
        let cache = self.cache_for(conn_id)?;
        let service = cache.find_service(service).ok_or(GattClientError::NotFound)?;
        Ok(service
            .characteristics
            .iter()
            .map(|characteristic| {
                (
                    CharacteristicId { service: service.id, characteristic: characteristic.id },
                    characteristic.properties,
                )
            })
            .collect())
    }

    /// The descriptors of a cached characteristic
    pub fn descriptors(
        &self,
        conn_id: ConnectionId,
        characteristic: &CharacteristicId,
    ) -> Result<Vec<AttributeId>, GattClientError> {
        let cache = self.cache_for(conn_id)?;
        let cached =
            cache.find_characteristic(characteristic).ok_or(GattClientError::NotFound)?;
        Ok(cached
            .descriptors
            .iter()
            .map(|descriptor| AttributeId::descriptor(*characteristic, descriptor.id))
            .collect())
    }

    fn cache_for(&self, conn_id: ConnectionId) -> Result<&ServerCache, GattClientError> {
        let clcb = self
            .find_clcb_by_conn_id(conn_id)
            .and_then(|id| self.clcbs.get(&id))
            .ok_or(GattClientError::UnknownConnection(conn_id))?;
        self.servers
            .get(&clcb.address)
            .and_then(|record| record.cache())
            .ok_or(GattClientError::NotFound)
    }

    /// The transport finished a read, write or execute-write
    pub fn on_operation_complete(
        &mut self,
        conn_id: ConnectionId,
        op: GattOpType,
        status: GattStatus,
        payload: Option<OperationPayload>,
    ) {
        let Some(id) = self.find_clcb_by_conn_id(conn_id) else {
            error!("{op:?} completion for unknown {conn_id:?}, ignoring");
            return;
        };
        self.sm_execute(
            id,
            ClcbEvent::OperationComplete(OperationCompletion { op, status, payload }),
        );
    }

    /// The transport found one attribute during discovery
    pub fn on_discovery_result(&mut self, conn_id: ConnectionId, result: DiscoveryResult) {
        let Some(address) = self.clcb_address(conn_id) else {
            warn!("discovery result for unknown {conn_id:?}");
            return;
        };
        if let Some(record) = self.servers.get_mut(&address) {
            record.on_discovery_result(conn_id, result);
        }
    }

    /// The transport finished one discovery phase
    pub fn on_discovery_complete(
        &mut self,
        conn_id: ConnectionId,
        kind: DiscoveryType,
        status: GattStatus,
    ) {
        let Some(id) = self.find_clcb_by_conn_id(conn_id) else {
            warn!("{kind:?} discovery complete for unknown {conn_id:?}");
            return;
        };
        let Some(address) = self.clcbs.get(&id).map(|clcb| clcb.address) else {
            return;
        };
        let Some(record) = self.servers.get_mut(&address) else {
            return;
        };
        if record.state != ServerCacheState::Discovering || record.owner != Some(conn_id) {
            debug!("ignoring {kind:?} discovery complete on {conn_id:?}");
            return;
        }
        if !status.is_success() {
            error!("{kind:?} discovery of {address} failed: {status:?}");
            self.discovery_done(id, status);
            return;
        }
        match record.advance_discovery(conn_id, kind) {
            DiscoveryStep::Next(request) => {
                let status = self.transport.discover(conn_id, request);
                if !status.is_success() {
                    error!("failed to issue {request:?}: {status:?}");
                    self.discovery_done(id, status);
                }
            }
            DiscoveryStep::Done => self.discovery_done(id, GattStatus::Success),
            DiscoveryStep::Ignored => {}
        }
    }

    /// The persistence collaborator opened (or failed to open) a snapshot
    pub fn on_cache_open(
        &mut self,
        address: AddressWithType,
        conn_id: ConnectionId,
        status: GattStatus,
    ) {
        self.dispatch_cache_event(address, conn_id, ClcbEvent::CacheOpened(status));
    }

    /// The persistence collaborator produced a chunk of a snapshot
    pub fn on_cache_load(
        &mut self,
        address: AddressWithType,
        conn_id: ConnectionId,
        status: CacheLoadStatus,
        entries: Vec<CacheEntry>,
    ) {
        self.dispatch_cache_event(address, conn_id, ClcbEvent::CacheLoaded(status, entries));
    }

    /// The persistence collaborator stored a chunk of a snapshot
    pub fn on_cache_save(
        &mut self,
        address: AddressWithType,
        conn_id: ConnectionId,
        status: GattStatus,
    ) {
        self.dispatch_cache_event(address, conn_id, ClcbEvent::CacheSaved(status));
    }

    fn dispatch_cache_event(
        &mut self,
        address: AddressWithType,
        conn_id: ConnectionId,
        event: ClcbEvent,
    ) {
        match self.find_clcb_by_conn_id(conn_id) {
            Some(id) if self.clcbs.get(&id).is_some_and(|clcb| clcb.address == address) => {
                self.sm_execute(id, event)
            }
            _ => warn!("cache completion for {address} on stale {conn_id:?}"),
        }
    }

    fn clcb_address(&self, conn_id: ConnectionId) -> Option<AddressWithType> {
        let id = self.find_clcb_by_conn_id(conn_id)?;
        self.clcbs.get(&id).map(|clcb| clcb.address)
    }

    /// Deliver an event to an application, if it is still registered
    pub(crate) fn send_event(&self, client_if: ClientIf, event: GattClientEvent) {
        match self.registrations.get(&client_if) {
            Some(registration) => registration.callbacks.on_gatt_client_event(event),
            None => warn!("dropping {event:?} for unregistered {client_if:?}"),
        }
    }

    fn record_mut(&mut self, address: AddressWithType) -> &mut RemoteServerRecord {
        self.servers.entry(address).or_insert_with(|| RemoteServerRecord::new(address))
    }

    fn alloc_clcb(&mut self, client_if: ClientIf, address: AddressWithType) -> Option<ClcbId> {
        if self.clcbs.len() >= self.flags.max_clcb {
            error!("no free clcb for {client_if:?} to {address}");
            return None;
        }
        let registration = self.registrations.get_mut(&client_if)?;
        registration.num_clcb += 1;

        let id = self.next_clcb_id;
        self.next_clcb_id = ClcbId(id.0.wrapping_add(1));
        self.clcbs.insert(id, Clcb::new(client_if, address));
        self.record_mut(address).num_clcb += 1;
        debug!("allocated clcb {id:?} for {client_if:?} to {address}");
        Some(id)
    }

    fn dealloc_clcb(&mut self, id: ClcbId) -> Option<Clcb> {
        let clcb = self.clcbs.remove(&id)?;
        if let Some(registration) = self.registrations.get_mut(&clcb.client_if) {
            registration.num_clcb = registration.num_clcb.saturating_sub(1);
        }
        if let Some(record) = self.servers.get_mut(&clcb.address) {
            record.num_clcb = record.num_clcb.saturating_sub(1);
            if record.num_clcb == 0 {
                record.connected = false;
            }
        }
        debug!("released clcb {id:?}");
        Some(clcb)
    }

    fn find_clcb_by_cif(&self, client_if: ClientIf, address: AddressWithType) -> Option<ClcbId> {
        self.clcbs
            .iter()
            .find(|(_, clcb)| clcb.client_if == client_if && clcb.address == address)
            .map(|(id, _)| *id)
    }

    fn find_clcbs_by_cif(&self, client_if: ClientIf) -> Vec<ClcbId> {
        self.clcbs
            .iter()
            .filter(|(_, clcb)| clcb.client_if == client_if)
            .map(|(id, _)| *id)
            .collect()
    }

    fn find_clcb_by_conn_id(&self, conn_id: ConnectionId) -> Option<ClcbId> {
        self.clcbs.iter().find(|(_, clcb)| clcb.conn_id == Some(conn_id)).map(|(id, _)| *id)
    }

    /// Every CLCB sharing a device's record, oldest first
    fn clcbs_for_record(&self, address: AddressWithType) -> Vec<ClcbId> {
        self.clcbs
            .iter()
            .filter(|(_, clcb)| clcb.address == address)
            .map(|(id, _)| *id)
            .collect()
    }
}
