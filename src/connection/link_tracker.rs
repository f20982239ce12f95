//! The set of links currently up, and the connection ids seen on each

use std::collections::{BTreeMap, BTreeSet};

use crate::{core::address::AddressWithType, gatt::ids::ConnectionId};

/// Updated from every connection state change the transport reports
#[derive(Debug, Default)]
pub struct LinkTracker {
    links: BTreeMap<AddressWithType, BTreeSet<ConnectionId>>,
}

impl LinkTracker {
    /// Constructor
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection id came up on a link to this device
    pub fn on_connected(&mut self, address: AddressWithType, conn_id: ConnectionId) {
        self.links.entry(address).or_default().insert(conn_id);
    }

    /// A connection id went down. The link is forgotten once no connection
    /// id remains on it.
    pub fn on_disconnected(&mut self, address: AddressWithType, conn_id: ConnectionId) {
        if let Some(conn_ids) = self.links.get_mut(&address) {
            conn_ids.remove(&conn_id);
            if conn_ids.is_empty() {
                self.links.remove(&address);
            }
        }
    }

    /// Whether any link to this device is up
    pub fn is_connected(&self, address: AddressWithType) -> bool {
        self.links.contains_key(&address)
    }

    /// Every device with a link up, in address order
    pub fn connected_addresses(&self) -> Vec<AddressWithType> {
        self.links.keys().copied().collect()
    }
}
