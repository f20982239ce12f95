//! Translation between the symbolic ids applications use and the handles of
//! one attribute table snapshot. Results are only meaningful against the
//! snapshot they were computed from.

use crate::gatt::ids::{AttHandle, AttributeId, CharacteristicId, GattId, ServiceId};

use super::server_cache::{CachedCharacteristic, CachedService, ServerCache};

impl ServerCache {
    /// The cached service with this id
    pub fn find_service(&self, id: &ServiceId) -> Option<&CachedService> {
        self.services.iter().find(|service| service.id == *id)
    }

    /// The cached characteristic with this id
    pub fn find_characteristic(&self, id: &CharacteristicId) -> Option<&CachedCharacteristic> {
        self.find_service(&id.service)?
            .characteristics
            .iter()
            .find(|characteristic| characteristic.id == id.characteristic)
    }

    /// The handle of a characteristic value, or of one of its descriptors
    pub fn id_to_handle(
        &self,
        service: &ServiceId,
        characteristic: &GattId,
        descriptor: Option<&GattId>,
    ) -> Option<AttHandle> {
        let characteristic = self.find_characteristic(&CharacteristicId {
            service: *service,
            characteristic: *characteristic,
        })?;
        let handle = match descriptor {
            None => characteristic.handle,
            Some(descriptor) => {
                characteristic.descriptors.iter().find(|descr| descr.id == *descriptor)?.handle
            }
        };
        handle.is_valid().then_some(handle)
    }

    /// Resolve an AttributeId against this snapshot
    pub fn resolve(&self, id: &AttributeId) -> Option<AttHandle> {
        self.id_to_handle(
            &id.characteristic.service,
            &id.characteristic.characteristic,
            id.descriptor.as_ref(),
        )
    }

    /// The characteristic value or descriptor living at a handle. Service
    /// declarations have no AttributeId.
    pub fn handle_to_id(&self, handle: AttHandle) -> Option<AttributeId> {
        if !handle.is_valid() {
            return None;
        }
        let service = self
            .services
            .iter()
            .find(|service| service.start_handle <= handle && handle <= service.end_handle)?;
        for characteristic in &service.characteristics {
            let characteristic_id =
                CharacteristicId { service: service.id, characteristic: characteristic.id };
            if characteristic.handle == handle {
                return Some(AttributeId::characteristic(characteristic_id));
            }
            if let Some(descriptor) =
                characteristic.descriptors.iter().find(|descr| descr.handle == handle)
            {
                return Some(AttributeId::descriptor(characteristic_id, descriptor.id));
            }
        }
        None
    }
}
