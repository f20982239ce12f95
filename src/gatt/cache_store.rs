//! The persistence collaborator that lets a discovered attribute table be
//! reused across reconnects and restarts.
//!
//! [`GattCacheStore`] is the callout surface the client drives directly. Its
//! completions re-enter the client through `on_cache_open`, `on_cache_load`
//! and `on_cache_save`. [`AsyncCacheStore`] implements it on top of an async,
//! whole-snapshot [`GattCacheDatastore`].

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::task::spawn_local;

use crate::{
    core::{address::AddressWithType, uuid::Uuid},
    GattClientHandle,
};

use super::{
    characteristic::CharacteristicProperties,
    client::GattClientModule,
    ids::{AttHandle, ConnectionId},
    status::{CacheLoadStatus, GattStatus},
};

/// The kind of attribute a persisted entry describes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheAttributeType {
    Service,
    Characteristic,
    Descriptor,
}

/// One persisted attribute. A snapshot is the sequence of these in table
/// order: each service followed by its characteristics, each characteristic
/// followed by its descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheEntry {
    pub attr_type: CacheAttributeType,
    /// Service start handle, characteristic value handle or descriptor handle
    pub handle: AttHandle,
    /// Service end handle, INVALID for anything else
    pub end_handle: AttHandle,
    pub uuid: Uuid,
    pub inst_id: u8,
    pub properties: CharacteristicProperties,
    pub is_primary: bool,
}

/// Callouts into non-volatile storage. None of these block: every call that
/// produces a result reports it later through the GattClientModule.
pub trait GattCacheStore {
    /// Open the snapshot of a device for reading or writing. Completes via
    /// on_cache_open().
    fn open(&self, address: AddressWithType, conn_id: ConnectionId, for_write: bool);

    /// Load the chunk of entries starting at start_index. Completes via
    /// on_cache_load().
    fn load(&self, address: AddressWithType, conn_id: ConnectionId, start_index: usize);

    /// Append a chunk of entries starting at start_index. Completes via
    /// on_cache_save().
    fn save(
        &self,
        address: AddressWithType,
        conn_id: ConnectionId,
        start_index: usize,
        entries: Vec<CacheEntry>,
    );

    /// Finish the current load or save session
    fn close(&self, address: AddressWithType, conn_id: ConnectionId);

    /// The snapshot for this device can no longer be trusted
    fn reset(&self, address: AddressWithType);
}

/// An asynchronous store of whole snapshots
#[async_trait(?Send)]
pub trait GattCacheDatastore {
    /// The stored snapshot for a device, if any
    async fn load(&self, address: AddressWithType) -> Option<Vec<CacheEntry>>;

    /// Replace the stored snapshot for a device
    async fn store(&self, address: AddressWithType, entries: Vec<CacheEntry>);

    /// Forget the stored snapshot for a device
    async fn reset(&self, address: AddressWithType);
}

/// A GattCacheDatastore that keeps snapshots for the life of the process
#[derive(Default)]
pub struct InMemoryCacheDatastore(RefCell<HashMap<AddressWithType, Vec<CacheEntry>>>);

impl InMemoryCacheDatastore {
    /// Constructor
    pub fn new() -> Self {
        Self::default()
    }

    /// The snapshot currently stored for a device
    pub fn snapshot(&self, address: AddressWithType) -> Option<Vec<CacheEntry>> {
        self.0.borrow().get(&address).cloned()
    }
}

#[async_trait(?Send)]
impl GattCacheDatastore for InMemoryCacheDatastore {
    async fn load(&self, address: AddressWithType) -> Option<Vec<CacheEntry>> {
        self.snapshot(address)
    }

    async fn store(&self, address: AddressWithType, entries: Vec<CacheEntry>) {
        self.0.borrow_mut().insert(address, entries);
    }

    async fn reset(&self, address: AddressWithType) {
        self.0.borrow_mut().remove(&address);
    }
}

#[derive(Default)]
struct SessionState {
    loaded: HashMap<AddressWithType, Vec<CacheEntry>>,
    writes: HashMap<AddressWithType, Vec<CacheEntry>>,
}

/// Adapts a GattCacheDatastore to the chunked GattCacheStore callouts. Must
/// be used from within the LocalSet running the GATT client event loop.
pub struct AsyncCacheStore<T: GattCacheDatastore + ?Sized + 'static> {
    datastore: Rc<T>,
    handle: GattClientHandle,
    chunk_size: usize,
    sessions: Rc<RefCell<SessionState>>,
}

impl<T: GattCacheDatastore + ?Sized + 'static> AsyncCacheStore<T> {
    /// Constructor. Completions are posted through `handle`.
    pub fn new(datastore: Rc<T>, handle: GattClientHandle, chunk_size: usize) -> Self {
        Self {
            datastore,
            handle,
            chunk_size: chunk_size.max(1),
            sessions: Rc::new(RefCell::new(SessionState::default())),
        }
    }

    fn post(handle: &GattClientHandle, f: impl FnOnce(&mut GattClientModule) + Send + 'static) {
        if let Err(err) = handle.do_in_gatt_thread(f) {
            warn!("dropping cache completion: {err}");
        }
    }
}

impl<T: GattCacheDatastore + ?Sized + 'static> GattCacheStore for AsyncCacheStore<T> {
    fn open(&self, address: AddressWithType, conn_id: ConnectionId, for_write: bool) {
        if for_write {
            self.sessions.borrow_mut().writes.insert(address, vec![]);
            Self::post(&self.handle, move |module| {
                module.on_cache_open(address, conn_id, GattStatus::Success)
            });
            return;
        }

        let datastore = self.datastore.clone();
        let sessions = self.sessions.clone();
        let handle = self.handle.clone();
        spawn_local(async move {
            let status = match datastore.load(address).await {
                Some(entries) if !entries.is_empty() => {
                    debug!("loaded {} cached attributes for {address}", entries.len());
                    sessions.borrow_mut().loaded.insert(address, entries);
                    GattStatus::Success
                }
                _ => GattStatus::Error,
            };
            Self::post(&handle, move |module| module.on_cache_open(address, conn_id, status));
        });
    }

    fn load(&self, address: AddressWithType, conn_id: ConnectionId, start_index: usize) {
        let (status, chunk) = match self.sessions.borrow().loaded.get(&address) {
            Some(entries) if start_index < entries.len() => {
                let end = usize::min(start_index + self.chunk_size, entries.len());
                let status = if end == entries.len() {
                    CacheLoadStatus::Complete
                } else {
                    CacheLoadStatus::More
                };
                (status, entries[start_index..end].to_vec())
            }
            _ => (CacheLoadStatus::Error, vec![]),
        };
        Self::post(&self.handle, move |module| {
            module.on_cache_load(address, conn_id, status, chunk)
        });
    }

    fn save(
        &self,
        address: AddressWithType,
        conn_id: ConnectionId,
        start_index: usize,
        entries: Vec<CacheEntry>,
    ) {
        let status = match self.sessions.borrow_mut().writes.get_mut(&address) {
            Some(pending) if pending.len() == start_index => {
                pending.extend(entries);
                GattStatus::Success
            }
            Some(pending) => {
                warn!("save at index {start_index} but {} entries are buffered", pending.len());
                GattStatus::Error
            }
            None => {
                warn!("save for {address} without an open write session");
                GattStatus::Error
            }
        };
        Self::post(&self.handle, move |module| module.on_cache_save(address, conn_id, status));
    }

    fn close(&self, address: AddressWithType, _conn_id: ConnectionId) {
        let mut sessions = self.sessions.borrow_mut();
        sessions.loaded.remove(&address);
        if let Some(entries) = sessions.writes.remove(&address) {
            let datastore = self.datastore.clone();
            spawn_local(async move { datastore.store(address, entries).await });
        }
    }

    fn reset(&self, address: AddressWithType) {
        let mut sessions = self.sessions.borrow_mut();
        sessions.loaded.remove(&address);
        sessions.writes.remove(&address);
        let datastore = self.datastore.clone();
        spawn_local(async move { datastore.reset(address).await });
    }
}

#[cfg(test)]
mod test {
    use crate::{
        core::address::AddressType,
        utils::task::{block_on_locally, try_await},
    };

    use super::*;

    const ADDRESS: AddressWithType = AddressWithType::new([1, 2, 3, 4, 5, 6], AddressType::Public);

    fn make_entry(handle: u16) -> CacheEntry {
        CacheEntry {
            attr_type: CacheAttributeType::Service,
            handle: AttHandle(handle),
            end_handle: AttHandle(handle),
            uuid: Uuid::new(0x180f),
            inst_id: 0,
            properties: CharacteristicProperties::empty(),
            is_primary: true,
        }
    }

    #[test]
    fn test_in_memory_store_then_load() {
        block_on_locally(async {
            // arrange
            let datastore = InMemoryCacheDatastore::new();

            // act
            datastore.store(ADDRESS, vec![make_entry(1), make_entry(5)]).await;
            let loaded = datastore.load(ADDRESS).await;

            // assert
            assert_eq!(loaded, Some(vec![make_entry(1), make_entry(5)]));
        });
    }

    #[test]
    fn test_in_memory_reset() {
        block_on_locally(async {
            // arrange
            let datastore = Rc::new(InMemoryCacheDatastore::new());
            datastore.store(ADDRESS, vec![make_entry(1)]).await;

            // act: reset from a spawned task, as the adapter does
            let cloned = datastore.clone();
            try_await(async move { cloned.reset(ADDRESS).await }).await.ok();

            // assert
            assert_eq!(datastore.snapshot(ADDRESS), None);
        });
    }
}
