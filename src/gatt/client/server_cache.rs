//! The per-device attribute table, and the record that shares it between
//! every CLCB connected to that device.
//!
//! A table is built either live, through the three discovery phases, or by
//! appending the chunks of a persisted snapshot. Whichever CLCB started the
//! build is recorded as its owner; completions from anyone else are ignored.

use log::{debug, warn};

use crate::{
    core::{address::AddressWithType, uuid::Uuid},
    gatt::{
        cache_store::{CacheAttributeType, CacheEntry},
        channel::{DiscoveryRequest, DiscoveryResult, DiscoveryType},
        characteristic::CharacteristicProperties,
        ids::{AttHandle, ConnectionId, GattId, ServiceId},
    },
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedDescriptor {
    pub id: GattId,
    pub handle: AttHandle,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedCharacteristic {
    pub id: GattId,
    /// The value handle
    pub handle: AttHandle,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<CachedDescriptor>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedService {
    pub id: ServiceId,
    pub start_handle: AttHandle,
    pub end_handle: AttHandle,
    pub characteristics: Vec<CachedCharacteristic>,
}

/// A device's attribute table: services, then characteristics, then
/// descriptors, in the order the peer reported them
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerCache {
    pub(super) services: Vec<CachedService>,
}

fn next_inst_id<'a>(mut siblings: impl Iterator<Item = &'a GattId>, uuid: Uuid) -> u8 {
    let count = siblings.by_ref().filter(|id| id.uuid == uuid).count();
    u8::try_from(count).unwrap_or(u8::MAX)
}

impl ServerCache {
    /// Constructor
    pub fn new() -> Self {
        Self::default()
    }

    /// All cached services
    pub fn services(&self) -> &[CachedService] {
        &self.services
    }

    /// Whether nothing has been cached
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    fn add_service(&mut self, uuid: Uuid, start_handle: AttHandle, end_handle: AttHandle) {
        let inst_id = next_inst_id(self.services.iter().map(|service| &service.id.id), uuid);
        self.services.push(CachedService {
            id: ServiceId { id: GattId::new(uuid, inst_id), is_primary: true },
            start_handle,
            end_handle,
            characteristics: vec![],
        });
    }

    fn add_characteristic(
        &mut self,
        service_index: usize,
        uuid: Uuid,
        handle: AttHandle,
        properties: CharacteristicProperties,
    ) -> bool {
        let Some(service) = self.services.get_mut(service_index) else {
            return false;
        };
        if handle <= service.start_handle || handle > service.end_handle {
            warn!("characteristic {handle:?} outside service {:?}", service.id);
            return false;
        }
        let inst_id = next_inst_id(service.characteristics.iter().map(|chr| &chr.id), uuid);
        service.characteristics.push(CachedCharacteristic {
            id: GattId::new(uuid, inst_id),
            handle,
            properties,
            descriptors: vec![],
        });
        true
    }

    fn add_descriptor(
        &mut self,
        service_index: usize,
        char_index: usize,
        uuid: Uuid,
        handle: AttHandle,
    ) {
        let Some(characteristic) = self
            .services
            .get_mut(service_index)
            .and_then(|service| service.characteristics.get_mut(char_index))
        else {
            return;
        };
        let inst_id = next_inst_id(characteristic.descriptors.iter().map(|descr| &descr.id), uuid);
        characteristic
            .descriptors
            .push(CachedDescriptor { id: GattId::new(uuid, inst_id), handle });
    }

    /// Serialize the table into snapshot entries, in table order
    pub fn to_entries(&self) -> Vec<CacheEntry> {
        let mut entries = vec![];
        for service in &self.services {
            entries.push(CacheEntry {
                attr_type: CacheAttributeType::Service,
                handle: service.start_handle,
                end_handle: service.end_handle,
                uuid: service.id.id.uuid,
                inst_id: service.id.id.inst_id,
                properties: CharacteristicProperties::empty(),
                is_primary: service.id.is_primary,
            });
            for characteristic in &service.characteristics {
                entries.push(CacheEntry {
                    attr_type: CacheAttributeType::Characteristic,
                    handle: characteristic.handle,
                    end_handle: AttHandle::INVALID,
                    uuid: characteristic.id.uuid,
                    inst_id: characteristic.id.inst_id,
                    properties: characteristic.properties,
                    is_primary: service.id.is_primary,
                });
                for descriptor in &characteristic.descriptors {
                    entries.push(CacheEntry {
                        attr_type: CacheAttributeType::Descriptor,
                        handle: descriptor.handle,
                        end_handle: AttHandle::INVALID,
                        uuid: descriptor.id.uuid,
                        inst_id: descriptor.id.inst_id,
                        properties: CharacteristicProperties::empty(),
                        is_primary: service.id.is_primary,
                    });
                }
            }
        }
        entries
    }

    /// Append snapshot entries produced by to_entries(). Entries that do not
    /// fit the table structure (e.g. a descriptor before any characteristic)
    /// are dropped.
    pub fn append_entries(&mut self, entries: &[CacheEntry]) {
        for entry in entries {
            match entry.attr_type {
                CacheAttributeType::Service => self.services.push(CachedService {
                    id: ServiceId {
                        id: GattId::new(entry.uuid, entry.inst_id),
                        is_primary: entry.is_primary,
                    },
                    start_handle: entry.handle,
                    end_handle: entry.end_handle,
                    characteristics: vec![],
                }),
                CacheAttributeType::Characteristic => {
                    let Some(service) = self.services.last_mut() else {
                        warn!("dropping cached characteristic {:?} with no service", entry.handle);
                        continue;
                    };
                    service.characteristics.push(CachedCharacteristic {
                        id: GattId::new(entry.uuid, entry.inst_id),
                        handle: entry.handle,
                        properties: entry.properties,
                        descriptors: vec![],
                    });
                }
                CacheAttributeType::Descriptor => {
                    let Some(characteristic) = self
                        .services
                        .last_mut()
                        .and_then(|service| service.characteristics.last_mut())
                    else {
                        warn!(
                            "dropping cached descriptor {:?} with no characteristic",
                            entry.handle
                        );
                        continue;
                    };
                    characteristic.descriptors.push(CachedDescriptor {
                        id: GattId::new(entry.uuid, entry.inst_id),
                        handle: entry.handle,
                    });
                }
            }
        }
    }
}

/// Where a RemoteServerRecord is in building its attribute table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerCacheState {
    Idle,
    /// Reading a persisted snapshot
    Loading,
    /// No usable snapshot; live discovery must run next
    PendingDiscovery,
    /// Live discovery in flight
    Discovering,
    /// Writing the discovered table back to storage
    Saving,
}

/// What the owning CLCB must do after a discovery phase finished
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DiscoveryStep {
    Next(DiscoveryRequest),
    Done,
    Ignored,
}

#[derive(Debug)]
struct DiscoveryProgress {
    phase: DiscoveryType,
    service_index: usize,
    char_index: usize,
    /// Declaration handles of the current service's characteristics, parallel
    /// to its characteristic list
    declarations: Vec<AttHandle>,
    range: (AttHandle, AttHandle),
}

/// Everything known about one remote device. Shared by every CLCB for that
/// device and kept across disconnects.
#[derive(Debug)]
pub struct RemoteServerRecord {
    pub address: AddressWithType,
    pub connected: bool,
    pub state: ServerCacheState,
    /// A service-changed indication was received and rediscovery has not yet
    /// started
    pub service_changed_pending: bool,
    /// Client applications that have seen the pending service change
    pub update_count: usize,
    /// CLCBs referencing this record
    pub num_clcb: usize,
    /// The connection driving the current load, discovery or save
    pub(crate) owner: Option<ConnectionId>,
    /// Position in the snapshot being loaded or saved
    pub(crate) attr_index: usize,
    cache: Option<ServerCache>,
    discovery: Option<DiscoveryProgress>,
}

impl RemoteServerRecord {
    /// Constructor
    pub fn new(address: AddressWithType) -> Self {
        Self {
            address,
            connected: false,
            state: ServerCacheState::Idle,
            service_changed_pending: false,
            update_count: 0,
            num_clcb: 0,
            owner: None,
            attr_index: 0,
            cache: None,
            discovery: None,
        }
    }

    /// The attribute table, if one has been built
    pub fn cache(&self) -> Option<&ServerCache> {
        self.cache.as_ref()
    }

    /// Drop the attribute table and any build in progress
    pub(crate) fn invalidate(&mut self) {
        self.cache = None;
        self.discovery = None;
        self.attr_index = 0;
    }

    /// Return to Idle once a build has finished or been abandoned
    pub(crate) fn finish_build(&mut self) {
        self.state = ServerCacheState::Idle;
        self.owner = None;
        self.discovery = None;
        self.attr_index = 0;
    }

    /// Clear the table and start live discovery on behalf of `owner`
    pub(crate) fn begin_discovery(&mut self, owner: ConnectionId) -> DiscoveryRequest {
        debug!("starting discovery of {} on {owner:?}", self.address);
        self.cache = Some(ServerCache::new());
        self.state = ServerCacheState::Discovering;
        self.owner = Some(owner);
        self.discovery = Some(DiscoveryProgress {
            phase: DiscoveryType::PrimaryServices,
            service_index: 0,
            char_index: 0,
            declarations: vec![],
            range: (AttHandle(0x0001), AttHandle(0xffff)),
        });
        DiscoveryRequest::PrimaryServices
    }

    fn is_discovering_on(&self, conn_id: ConnectionId) -> bool {
        self.state == ServerCacheState::Discovering && self.owner == Some(conn_id)
    }

    /// Append one discovered attribute
    pub(crate) fn on_discovery_result(&mut self, conn_id: ConnectionId, result: DiscoveryResult) {
        if !self.is_discovering_on(conn_id) {
            return;
        }
        let (Some(progress), Some(cache)) = (self.discovery.as_mut(), self.cache.as_mut()) else {
            return;
        };
        let (start, end) = progress.range;
        match (progress.phase, result) {
            (
                DiscoveryType::PrimaryServices,
                DiscoveryResult::Service { uuid, start_handle, end_handle },
            ) if start_handle.is_valid() && start_handle <= end_handle => {
                cache.add_service(uuid, start_handle, end_handle)
            }
            (
                DiscoveryType::Characteristics,
                DiscoveryResult::Characteristic {
                    declaration_handle,
                    value_handle,
                    uuid,
                    properties,
                },
            ) => {
                if cache.add_characteristic(progress.service_index, uuid, value_handle, properties)
                {
                    progress.declarations.push(declaration_handle);
                }
            }
            (DiscoveryType::Descriptors, DiscoveryResult::Descriptor { handle, uuid })
                if start <= handle && handle <= end =>
            {
                cache.add_descriptor(progress.service_index, progress.char_index, uuid, handle)
            }
            (phase, result) => warn!("ignoring {result:?} during {phase:?} discovery"),
        }
    }

    /// A discovery phase finished successfully; work out the next one
    pub(crate) fn advance_discovery(
        &mut self,
        conn_id: ConnectionId,
        kind: DiscoveryType,
    ) -> DiscoveryStep {
        if !self.is_discovering_on(conn_id) {
            return DiscoveryStep::Ignored;
        }
        let Some(progress) = self.discovery.as_mut() else {
            return DiscoveryStep::Ignored;
        };
        if progress.phase != kind {
            warn!("{kind:?} complete while in {:?} phase", progress.phase);
            return DiscoveryStep::Ignored;
        }
        match kind {
            DiscoveryType::PrimaryServices => self.explore_service(0),
            DiscoveryType::Characteristics => {
                progress.char_index = 0;
                self.explore_descriptors()
            }
            DiscoveryType::Descriptors => {
                progress.char_index += 1;
                self.explore_descriptors()
            }
        }
    }

    fn explore_service(&mut self, index: usize) -> DiscoveryStep {
        let service = self.cache.as_ref().and_then(|cache| cache.services.get(index));
        let (Some(service), Some(progress)) = (service, self.discovery.as_mut()) else {
            self.discovery = None;
            return DiscoveryStep::Done;
        };
        progress.phase = DiscoveryType::Characteristics;
        progress.service_index = index;
        progress.char_index = 0;
        progress.declarations.clear();
        progress.range = (service.start_handle, service.end_handle);
        DiscoveryStep::Next(DiscoveryRequest::Characteristics {
            start: service.start_handle,
            end: service.end_handle,
        })
    }

    fn explore_descriptors(&mut self) -> DiscoveryStep {
        let (Some(progress), Some(cache)) = (self.discovery.as_mut(), self.cache.as_ref()) else {
            return DiscoveryStep::Ignored;
        };
        let Some(service) = cache.services.get(progress.service_index) else {
            return DiscoveryStep::Ignored;
        };
        while let Some(characteristic) = service.characteristics.get(progress.char_index) {
            let start = characteristic.handle.0.checked_add(1).map(AttHandle);
            let end = match progress.declarations.get(progress.char_index + 1) {
                Some(next_declaration) => AttHandle(next_declaration.0.saturating_sub(1)),
                None => service.end_handle,
            };
            if let Some(start) = start.filter(|start| *start <= end) {
                progress.phase = DiscoveryType::Descriptors;
                progress.range = (start, end);
                return DiscoveryStep::Next(DiscoveryRequest::Descriptors { start, end });
            }
            progress.char_index += 1;
        }
        let next_service = progress.service_index + 1;
        self.explore_service(next_service)
    }

    /// Append a chunk of a persisted snapshot. A chunk at index 0 starts a
    /// fresh table.
    pub(crate) fn append_snapshot(&mut self, entries: &[CacheEntry]) {
        if self.attr_index == 0 || self.cache.is_none() {
            self.cache = Some(ServerCache::new());
        }
        if let Some(cache) = self.cache.as_mut() {
            cache.append_entries(entries);
        }
        self.attr_index += entries.len();
    }

    /// The next chunk of the table to persist, with its start index, or None
    /// once everything has been handed off
    pub(crate) fn next_save_chunk(
        &mut self,
        chunk_size: usize,
    ) -> Option<(usize, Vec<CacheEntry>)> {
        let entries = self.cache.as_ref()?.to_entries();
        if self.attr_index >= entries.len() {
            return None;
        }
        let start = self.attr_index;
        let end = usize::min(start + chunk_size, entries.len());
        self.attr_index = end;
        Some((start, entries[start..end].to_vec()))
    }
}
