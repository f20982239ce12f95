//! Mocked implementation of GattCacheStore for use in test. Completions are
//! never produced: the test drives them through the module.

use crate::{
    core::address::AddressWithType,
    gatt::{
        cache_store::{CacheEntry, GattCacheStore},
        ids::ConnectionId,
    },
};
use tokio::sync::mpsc::{self, unbounded_channel, UnboundedReceiver};

/// Routes calls to GattCacheStore into a channel of MockCacheStoreEvents
pub struct MockCacheStore(mpsc::UnboundedSender<MockCacheStoreEvent>);

impl MockCacheStore {
    /// Constructor. Returns self and the RX side of the associated channel.
    pub fn new() -> (Self, UnboundedReceiver<MockCacheStoreEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self(tx), rx)
    }
}

/// Events representing calls to GattCacheStore
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockCacheStoreEvent {
    /// GattCacheStore#open invoked
    Open { address: AddressWithType, conn_id: ConnectionId, for_write: bool },
    /// GattCacheStore#load invoked
    Load { address: AddressWithType, conn_id: ConnectionId, start_index: usize },
    /// GattCacheStore#save invoked
    Save {
        address: AddressWithType,
        conn_id: ConnectionId,
        start_index: usize,
        entries: Vec<CacheEntry>,
    },
    /// GattCacheStore#close invoked
    Close { address: AddressWithType, conn_id: ConnectionId },
    /// GattCacheStore#reset invoked
    Reset(AddressWithType),
}

impl GattCacheStore for MockCacheStore {
    fn open(&self, address: AddressWithType, conn_id: ConnectionId, for_write: bool) {
        self.0.send(MockCacheStoreEvent::Open { address, conn_id, for_write }).ok();
    }

    fn load(&self, address: AddressWithType, conn_id: ConnectionId, start_index: usize) {
        self.0.send(MockCacheStoreEvent::Load { address, conn_id, start_index }).ok();
    }

    fn save(
        &self,
        address: AddressWithType,
        conn_id: ConnectionId,
        start_index: usize,
        entries: Vec<CacheEntry>,
    ) {
        self.0.send(MockCacheStoreEvent::Save { address, conn_id, start_index, entries }).ok();
    }

    fn close(&self, address: AddressWithType, conn_id: ConnectionId) {
        self.0.send(MockCacheStoreEvent::Close { address, conn_id }).ok();
    }

    fn reset(&self, address: AddressWithType) {
        self.0.send(MockCacheStoreEvent::Reset(address)).ok();
    }
}
