//! Tracks, per remote device, which client applications want an automatic
//! (background) connection and which only want to hear about connections
//! made by anyone else ("listen").

use std::collections::{hash_map::Entry, HashMap};

use log::{error, warn};

use crate::{core::address::AddressWithType, gatt::ids::ClientIf};

/// The interest of every client application in one device. Keyed by
/// [`AddressWithType::EMPTY`] for "listen to every device".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackgroundConnectionEntry {
    pub address: AddressWithType,
    /// One bit per ClientIf wanting an auto connection
    pub auto_connect_mask: u32,
    /// One bit per ClientIf listening for connections
    pub listen_mask: u32,
}

impl BackgroundConnectionEntry {
    fn is_empty(&self) -> bool {
        self.auto_connect_mask == 0 && self.listen_mask == 0
    }

    fn mask_mut(&mut self, is_listen: bool) -> &mut u32 {
        if is_listen {
            &mut self.listen_mask
        } else {
            &mut self.auto_connect_mask
        }
    }
}

/// A bounded table of BackgroundConnectionEntries. An entry exists only
/// while at least one bit is set in either of its masks.
#[derive(Debug)]
pub struct BackgroundConnectionTracker {
    capacity: usize,
    entries: HashMap<AddressWithType, BackgroundConnectionEntry>,
}

impl BackgroundConnectionTracker {
    /// Constructor
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: HashMap::new() }
    }

    /// Set or clear the auto-connect (or listen) bit of `client_if` for
    /// `address`. Returns false if the table is full, if clearing a bit of an
    /// untracked device, or if the client id cannot be represented.
    pub fn mark(
        &mut self,
        client_if: ClientIf,
        address: AddressWithType,
        enable: bool,
        is_listen: bool,
    ) -> bool {
        let Some(bit) = client_if.mask_bit() else {
            error!("client {client_if:?} does not fit in the background mask");
            return false;
        };
        let at_capacity = self.entries.len() >= self.capacity;

        match self.entries.entry(address) {
            Entry::Occupied(mut entry) => {
                let mask = entry.get_mut().mask_mut(is_listen);
                if enable {
                    *mask |= bit;
                } else {
                    *mask &= !bit;
                }
                if entry.get().is_empty() {
                    entry.remove();
                }
                true
            }
            Entry::Vacant(_) if !enable => {
                warn!("no background entry for {address} to clear");
                false
            }
            Entry::Vacant(_) if at_capacity => {
                error!("background connection table full, dropping {address}");
                false
            }
            Entry::Vacant(entry) => {
                let mut new_entry =
                    BackgroundConnectionEntry { address, auto_connect_mask: 0, listen_mask: 0 };
                *new_entry.mask_mut(is_listen) |= bit;
                entry.insert(new_entry);
                true
            }
        }
    }

    /// Whether the client asked to be auto-connected to this device
    pub fn is_auto_connect(&self, client_if: ClientIf, address: AddressWithType) -> bool {
        self.has_bit(client_if, address, |entry| entry.auto_connect_mask)
    }

    /// Whether the client listens for connections to this device, directly or
    /// through a listen-to-all registration
    pub fn is_listening(&self, client_if: ClientIf, address: AddressWithType) -> bool {
        self.has_bit(client_if, address, |entry| entry.listen_mask)
            || self.has_bit(client_if, AddressWithType::EMPTY, |entry| entry.listen_mask)
    }

    /// Every client listening for connections to this device, in ascending order
    pub fn listeners(&self, address: AddressWithType) -> Vec<ClientIf> {
        let mask = [address, AddressWithType::EMPTY]
            .iter()
            .filter_map(|key| self.entries.get(key))
            .fold(0, |mask, entry| mask | entry.listen_mask);
        clients_in(mask)
    }

    /// Every client listening for, or wanting an auto connection to, this
    /// device, in ascending order
    pub fn interested_clients(&self, address: AddressWithType) -> Vec<ClientIf> {
        let auto_connect = self.entries.get(&address).map_or(0, |entry| entry.auto_connect_mask);
        let listen = [address, AddressWithType::EMPTY]
            .iter()
            .filter_map(|key| self.entries.get(key))
            .fold(0, |mask, entry| mask | entry.listen_mask);
        clients_in(auto_connect | listen)
    }

    /// Clear every bit belonging to a client. Returns the devices it had
    /// asked to be auto-connected to.
    pub fn remove_client(&mut self, client_if: ClientIf) -> Vec<AddressWithType> {
        let Some(bit) = client_if.mask_bit() else {
            return vec![];
        };
        let mut auto_connect = vec![];
        for entry in self.entries.values_mut() {
            if entry.auto_connect_mask & bit != 0 {
                auto_connect.push(entry.address);
            }
            entry.auto_connect_mask &= !bit;
            entry.listen_mask &= !bit;
        }
        self.entries.retain(|_, entry| !entry.is_empty());
        auto_connect.sort();
        auto_connect
    }

    /// The entry for one device
    pub fn get(&self, address: AddressWithType) -> Option<&BackgroundConnectionEntry> {
        self.entries.get(&address)
    }

    /// Number of tracked devices
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no device is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn has_bit(
        &self,
        client_if: ClientIf,
        address: AddressWithType,
        mask: impl Fn(&BackgroundConnectionEntry) -> u32,
    ) -> bool {
        self.entries.get(&address).is_some_and(|entry| client_if_in(mask(entry), client_if))
    }
}

fn client_if_in(mask: u32, client_if: ClientIf) -> bool {
    client_if.mask_bit().map(|bit| mask & bit != 0).unwrap_or(false)
}

fn clients_in(mask: u32) -> Vec<ClientIf> {
    (1..=32u8).map(ClientIf).filter(|client| client_if_in(mask, *client)).collect()
}
