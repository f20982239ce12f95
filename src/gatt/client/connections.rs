//! Link events from the transport, background (auto) connections, listen
//! registrations and cache refresh

use log::{debug, error, info, warn};

use crate::{
    core::address::AddressWithType,
    gatt::{
        callbacks::{DisconnectReason, GattClientEvent},
        ids::{ClientIf, ConnectionId},
        status::{GattClientError, GattStatus},
    },
};

use super::{clcb::ClcbId, state_machine::ClcbEvent, ClcbState, GattClientModule};

impl GattClientModule {
    /// The transport reports a link to `address` coming up or going down, as
    /// seen by one client application
    pub fn on_connection_state_changed(
        &mut self,
        client_if: ClientIf,
        address: AddressWithType,
        conn_id: ConnectionId,
        connected: bool,
        reason: DisconnectReason,
    ) {
        if connected {
            info!("{client_if:?} connected to {address} as {conn_id:?}");
            self.links.on_connected(address, conn_id);
            let id = match self.find_clcb_by_cif(client_if, address) {
                Some(id) => Some(id),
                None if self.background.is_auto_connect(client_if, address)
                    || self.background.is_listening(client_if, address) =>
                {
                    self.alloc_clcb(client_if, address)
                }
                None => None,
            };
            match id {
                Some(id) if self.is_open_on(id, conn_id) => {
                    debug!("{client_if:?} already open on {conn_id:?}")
                }
                Some(id) => self.sm_execute(id, ClcbEvent::IntConnected(conn_id)),
                None => debug!("{client_if:?} has no interest in {address}"),
            }
            self.promote_background_clients(address);
        } else {
            info!("{client_if:?} disconnected from {address} ({reason:?})");
            self.links.on_disconnected(address, conn_id);
            let id = self
                .find_clcb_by_conn_id(conn_id)
                .or_else(|| self.find_clcb_by_cif(client_if, address));
            match id {
                Some(id) => self.sm_execute(id, ClcbEvent::IntDisconnected(reason)),
                None => debug!("no clcb for {conn_id:?}"),
            }
        }
    }

    /// Track a device for automatic connection and, if the link is already
    /// up, connect right away. Failures are reported as an Open event.
    pub(super) fn init_background_connection(
        &mut self,
        client_if: ClientIf,
        address: AddressWithType,
    ) {
        let status = if !self.background.mark(client_if, address, true, false) {
            GattStatus::NoResources
        } else if !self.transport.connect(client_if, address, false) {
            error!("transport refused background connection to {address}");
            GattStatus::Error
        } else if let Some(conn_id) = self.transport.get_conn_id_if_connected(client_if, address) {
            match self
                .find_clcb_by_cif(client_if, address)
                .or_else(|| self.alloc_clcb(client_if, address))
            {
                Some(id) => {
                    if let Some(clcb) = self.clcbs.get_mut(&id) {
                        clcb.conn_id = Some(conn_id);
                    }
                    self.sm_execute(id, ClcbEvent::IntConnected(conn_id));
                    GattStatus::Success
                }
                None => GattStatus::NoResources,
            }
        } else {
            GattStatus::Success
        };

        if !status.is_success() {
            self.send_event(
                client_if,
                GattClientEvent::Open { status, client_if, address, conn_id: None },
            );
        }
    }

    pub(super) fn cancel_background_connection(
        &mut self,
        client_if: ClientIf,
        address: AddressWithType,
    ) {
        let status = if self.background.mark(client_if, address, false, false)
            && self.transport.cancel_connect(client_if, address, false)
        {
            GattStatus::Success
        } else {
            error!("cannot cancel background connection to {address}");
            GattStatus::Error
        };
        self.send_event(client_if, GattClientEvent::CancelOpen { status, client_if });
    }

    /// Start or stop listening for connections made to one device, or to any
    /// device when `address` is None. Links already up are reported to the
    /// listener immediately.
    pub fn listen(
        &mut self,
        client_if: ClientIf,
        start: bool,
        address: Option<AddressWithType>,
    ) -> Result<(), GattClientError> {
        self.check_client(client_if)?;
        let key = address.unwrap_or(AddressWithType::EMPTY);
        let status = if !self.background.mark(client_if, key, start, true) {
            error!("listen failure for {client_if:?}");
            GattStatus::Error
        } else if !self.transport.listen(client_if, start, address) {
            error!("transport refused listen for {client_if:?}");
            GattStatus::Error
        } else {
            GattStatus::Success
        };
        self.send_event(client_if, GattClientEvent::Listen { status, client_if });
        if !status.is_success() || !start {
            return Ok(());
        }

        let targets = match address {
            Some(address) if self.links.is_connected(address) => vec![address],
            Some(_) => vec![],
            None => self.links.connected_addresses(),
        };
        for address in targets {
            if self.find_clcb_by_cif(client_if, address).is_none() {
                self.init_clcb_conn(client_if, address);
            }
        }
        Ok(())
    }

    /// A link to `address` is up: every other client tracked for it, as
    /// listener or auto connection, gets a CLCB of its own on the link
    fn promote_background_clients(&mut self, address: AddressWithType) {
        for client_if in self.background.interested_clients(address) {
            if self.registrations.contains_key(&client_if)
                && self.find_clcb_by_cif(client_if, address).is_none()
            {
                self.init_clcb_conn(client_if, address);
            }
        }
    }

    fn is_open_on(&self, id: ClcbId, conn_id: ConnectionId) -> bool {
        self.clcbs.get(&id).is_some_and(|clcb| {
            clcb.conn_id == Some(conn_id)
                && matches!(clcb.state, ClcbState::Connected | ClcbState::Discovering)
        })
    }

    /// Open a CLCB on a link that is already up
    fn init_clcb_conn(&mut self, client_if: ClientIf, address: AddressWithType) {
        if self.find_clcb_by_cif(client_if, address).is_some() {
            warn!("{client_if:?} already has a connection to {address}");
            return;
        }
        if self.transport.get_conn_id_if_connected(client_if, address).is_none() {
            error!("{address} is not connected");
            return;
        }
        let Some(id) = self.alloc_clcb(client_if, address) else {
            error!("no resources to promote {address} for {client_if:?}");
            return;
        };
        self.sm_execute(id, ClcbEvent::ApiOpen);
    }

    /// Throw away the attribute table of a device. A connected device is
    /// rediscovered right away.
    pub fn refresh(&mut self, address: AddressWithType) -> Result<(), GattClientError> {
        self.check_enabled()?;
        if let Some(record) = self.servers.get(&address) {
            if record.connected && record.num_clcb != 0 {
                let first = self
                    .clcbs_for_record(address)
                    .into_iter()
                    .find(|id| self.clcbs.get(id).is_some_and(|clcb| clcb.conn_id.is_some()));
                if let Some(id) = first {
                    info!("refreshing {address} by rediscovery");
                    self.sm_execute(id, ClcbEvent::IntDiscover);
                    return Ok(());
                }
            }
        }
        if let Some(record) = self.servers.get_mut(&address) {
            record.invalidate();
        }
        self.cache_store.reset(address);
        Ok(())
    }
}
