//! Routing of values pushed by a server (notifications and indications),
//! including the service-changed indication that invalidates the cache.

use log::{debug, error, info, warn};

use crate::{
    core::address::AddressWithType,
    gatt::{
        callbacks::{GattClientEvent, Notification},
        ids::{AttHandle, ClientIf, ConnectionId},
        server::services::gatt::{GATT_SERVICE_UUID, SERVICE_CHANGE_UUID},
    },
};

use super::{clcb::ClcbId, state_machine::ClcbEvent, GattClientModule};

impl GattClientModule {
    /// The transport received a notification or indication on a connection.
    /// Indications nobody will confirm are confirmed here.
    pub fn on_indication_or_notification(
        &mut self,
        conn_id: ConnectionId,
        is_indication: bool,
        handle: AttHandle,
        value: Vec<u8>,
    ) {
        let client_if = conn_id.get_client_if();
        let Some(address) = self.transport.get_connection_info(conn_id) else {
            error!("value pushed on unknown {conn_id:?}");
            return;
        };
        if !self.registrations.contains_key(&client_if) {
            error!("value pushed for unregistered {client_if:?}");
            return;
        }

        let id = self
            .servers
            .get(&address)
            .and_then(|record| record.cache())
            .and_then(|cache| cache.handle_to_id(handle));
        let Some(id) = id else {
            warn!("value pushed from {address} on unknown {handle:?}");
            if is_indication {
                self.transport.send_handle_value_confirm(conn_id, handle);
            }
            return;
        };

        if id.characteristic.service.id.uuid == GATT_SERVICE_UUID
            && id.characteristic.characteristic.uuid == SERVICE_CHANGE_UUID
        {
            self.process_service_changed(conn_id, client_if, address, handle);
            return;
        }

        let registered = self.registrations.get(&client_if).is_some_and(|registration| {
            registration.is_registered_for(address, &id.characteristic)
        });
        if !registered {
            debug!("{client_if:?} not registered for {handle:?}");
            if is_indication {
                self.transport.send_handle_value_confirm(conn_id, handle);
            }
            return;
        }

        let clcb = match self.find_clcb_by_conn_id(conn_id) {
            Some(clcb) => Some(clcb),
            None => self.open_for_notification(client_if, address, conn_id),
        };
        if clcb.is_none() {
            error!("no resources to deliver value from {address}");
            return;
        }
        self.send_event(
            client_if,
            GattClientEvent::Notify(Notification {
                conn_id,
                address,
                id,
                value,
                is_notify: !is_indication,
            }),
        );
    }

    /// A value arrived on a link with no CLCB for this application yet
    fn open_for_notification(
        &mut self,
        client_if: ClientIf,
        address: AddressWithType,
        conn_id: ConnectionId,
    ) -> Option<ClcbId> {
        let id = self.alloc_clcb(client_if, address)?;
        if let Some(clcb) = self.clcbs.get_mut(&id) {
            clcb.conn_id = Some(conn_id);
        }
        self.sm_execute(id, ClcbEvent::IntConnected(conn_id));
        Some(id)
    }

    fn process_service_changed(
        &mut self,
        conn_id: ConnectionId,
        client_if: ClientIf,
        address: AddressWithType,
        handle: AttHandle,
    ) {
        info!("service changed on {address}");
        let num_apps = self.registrations.len();
        if let Some(registration) = self.registrations.get_mut(&client_if) {
            registration.clear_notifications(address);
        }
        let Some(record) = self.servers.get_mut(&address) else {
            return;
        };
        record.service_changed_pending = true;
        record.update_count += 1;

        if record.update_count >= num_apps {
            record.update_count = 0;
            let receiver = self.find_clcb_by_conn_id(conn_id);
            let target = match receiver {
                Some(id) if self.clcbs.get(&id).is_some_and(|clcb| clcb.pending.is_none()) => {
                    Some(id)
                }
                _ => self
                    .clcbs_for_record(address)
                    .into_iter()
                    .find(|id| self.clcbs.get(id).is_some_and(|clcb| clcb.pending.is_none()))
                    .or(receiver),
            };
            self.transport.send_handle_value_confirm(conn_id, handle);
            match target {
                Some(id) => self.sm_execute(id, ClcbEvent::IntDiscover),
                None => debug!("rediscovery of {address} deferred until next connection"),
            }
        }

        self.send_event(client_if, GattClientEvent::ServiceChanged { address });
    }
}
