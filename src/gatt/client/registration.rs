//! Client application registrations, their notification registrations, and
//! the enable/disable lifecycle of the module

use std::rc::Rc;

use log::{error, info, warn};

use crate::{
    core::{address::AddressWithType, uuid::Uuid},
    gatt::{
        callbacks::{GattClientCallbacks, GattClientEvent},
        ids::{CharacteristicId, ClientIf},
        status::{GattClientError, GattStatus},
    },
};

use super::{state_machine::ClcbEvent, GattClientModule, ModuleState};

/// One registered client application
pub(crate) struct ClientRegistration {
    pub client_if: ClientIf,
    pub app_uuid: Uuid,
    pub callbacks: Rc<dyn GattClientCallbacks>,
    /// CLCBs owned by this application
    pub num_clcb: usize,
    /// Deregistration completes once the last CLCB is closed
    pub dereg_pending: bool,
    notifications: Vec<(AddressWithType, CharacteristicId)>,
}

impl ClientRegistration {
    fn new(client_if: ClientIf, app_uuid: Uuid, callbacks: Rc<dyn GattClientCallbacks>) -> Self {
        Self {
            client_if,
            app_uuid,
            callbacks,
            num_clcb: 0,
            dereg_pending: false,
            notifications: vec![],
        }
    }

    /// Whether this application wants values pushed for a characteristic
    pub fn is_registered_for(
        &self,
        address: AddressWithType,
        characteristic: &CharacteristicId,
    ) -> bool {
        self.notifications.contains(&(address, *characteristic))
    }

    /// Forget every notification registration for a device
    pub fn clear_notifications(&mut self, address: AddressWithType) {
        self.notifications.retain(|(registered, _)| *registered != address);
    }
}

impl GattClientModule {
    /// Register a client application. The result is also reported to
    /// `callbacks` as a Register event, on failure as well as on success.
    pub fn register(
        &mut self,
        app_uuid: Uuid,
        callbacks: Rc<dyn GattClientCallbacks>,
    ) -> Result<ClientIf, GattClientError> {
        match self.state {
            ModuleState::Disabling => return Err(GattClientError::NotEnabled),
            ModuleState::Disabled => {
                info!("re-enabling GATT client");
                self.state = ModuleState::Enabled;
            }
            ModuleState::Enabled => {}
        }

        let client_if = if self.registrations.len() >= self.flags.max_client_apps {
            error!("no free registration slot for {app_uuid}");
            None
        } else {
            self.transport.register(app_uuid)
        };
        let Some(client_if) = client_if.filter(|client_if| {
            client_if.mask_bit().is_some() && !self.registrations.contains_key(client_if)
        }) else {
            callbacks.on_gatt_client_event(GattClientEvent::Register {
                status: GattStatus::NoResources,
                client_if: None,
                app_uuid,
            });
            return Err(GattClientError::NoResources);
        };

        info!("registered {app_uuid} as {client_if:?}");
        self.registrations
            .insert(client_if, ClientRegistration::new(client_if, app_uuid, callbacks.clone()));
        self.transport.start_if(client_if);
        callbacks.on_gatt_client_event(GattClientEvent::Register {
            status: GattStatus::Success,
            client_if: Some(client_if),
            app_uuid,
        });
        Ok(client_if)
    }

    /// Deregister a client application. Any CLCB it owns is closed first;
    /// the Deregister event follows the last Close event.
    pub fn deregister(&mut self, client_if: ClientIf) -> Result<(), GattClientError> {
        let Some(registration) = self.registrations.get_mut(&client_if) else {
            return Err(GattClientError::UnknownClient(client_if));
        };
        if registration.dereg_pending {
            warn!("deregistration of {client_if:?} already pending");
            return Ok(());
        }

        for address in self.background.remove_client(client_if) {
            self.transport.cancel_connect(client_if, address, false);
        }

        let owned = self.find_clcbs_by_cif(client_if);
        if owned.is_empty() {
            self.deregister_complete(client_if);
            return Ok(());
        }

        info!("closing {} connections before deregistering {client_if:?}", owned.len());
        if let Some(registration) = self.registrations.get_mut(&client_if) {
            registration.dereg_pending = true;
        }
        for id in owned {
            self.sm_execute(id, ClcbEvent::ApiClose);
        }
        Ok(())
    }

    /// Finish a deregistration once the application owns no CLCB
    pub(super) fn maybe_complete_deregistration(&mut self, client_if: ClientIf) {
        if self
            .registrations
            .get(&client_if)
            .is_some_and(|registration| registration.dereg_pending && registration.num_clcb == 0)
        {
            self.deregister_complete(client_if);
        }
    }

    fn deregister_complete(&mut self, client_if: ClientIf) {
        let Some(registration) = self.registrations.remove(&client_if) else {
            return;
        };
        info!("deregistered {client_if:?} ({})", registration.app_uuid);
        self.transport.deregister(client_if);
        registration.callbacks.on_gatt_client_event(GattClientEvent::Deregister {
            status: GattStatus::Success,
            client_if,
        });

        if self.registrations.is_empty() && self.state == ModuleState::Disabling {
            info!("GATT client disabled");
            self.state = ModuleState::Disabled;
        }
    }

    /// Deregister every application. The module is Disabled once the last
    /// one is gone.
    pub fn disable(&mut self) {
        if self.state != ModuleState::Enabled {
            warn!("disable() while {:?}", self.state);
            return;
        }
        info!("disabling GATT client");
        self.state = ModuleState::Disabling;
        let client_ifs: Vec<ClientIf> = self.registrations.keys().copied().collect();
        for client_if in client_ifs {
            if let Err(err) = self.deregister(client_if) {
                error!("failed to deregister {client_if:?}: {err}");
            }
        }
        if self.registrations.is_empty() {
            self.state = ModuleState::Disabled;
        }
    }

    /// Ask for values pushed by a device on a characteristic to be forwarded
    /// to this application. Registering twice is not an error.
    pub fn register_for_notifications(
        &mut self,
        client_if: ClientIf,
        address: AddressWithType,
        characteristic: CharacteristicId,
    ) -> Result<(), GattClientError> {
        let max = self.flags.max_notification_registrations;
        let registration = self
            .registrations
            .get_mut(&client_if)
            .ok_or(GattClientError::UnknownClient(client_if))?;
        if registration.is_registered_for(address, &characteristic) {
            return Ok(());
        }
        if registration.notifications.len() >= max {
            error!("{client_if:?} has no free notification registration");
            return Err(GattClientError::NoResources);
        }
        registration.notifications.push((address, characteristic));
        Ok(())
    }

    /// Stop forwarding a characteristic's pushed values to this application
    pub fn deregister_for_notifications(
        &mut self,
        client_if: ClientIf,
        address: AddressWithType,
        characteristic: CharacteristicId,
    ) -> Result<(), GattClientError> {
        let registration = self
            .registrations
            .get_mut(&client_if)
            .ok_or(GattClientError::UnknownClient(client_if))?;
        let before = registration.notifications.len();
        registration.notifications.retain(|entry| *entry != (address, characteristic));
        if registration.notifications.len() == before {
            return Err(GattClientError::NotFound);
        }
        Ok(())
    }
}
