//! The GATT service as defined in Core Spec 5.3 Vol 3G Section 7

use std::{ops::RangeInclusive, rc::Rc};

use anyhow::Result;

use crate::{
    core::uuid::Uuid,
    gatt::{
        characteristic::CharacteristicProperties,
        ids::AttHandle,
        server::gatt_database::{
            AttErrorCode, GattCharacteristicWithHandle, GattDatabase, GattDatastore,
            GattDescriptorWithHandle, GattServiceWithHandle,
        },
    },
};

struct GattService;

// Must lie in the range reserved for GATT by the native stack
const GATT_SERVICE_HANDLE: AttHandle = AttHandle(1);
/// The value handle of the Service Changed characteristic
pub const SERVICE_CHANGE_HANDLE: AttHandle = AttHandle(3);
const SERVICE_CHANGE_CCC_DESCRIPTOR_HANDLE: AttHandle = AttHandle(4);

/// The UUID used for the GATT service (Assigned Numbers 3.4.1 Services by Name)
pub const GATT_SERVICE_UUID: Uuid = Uuid::new(0x1801);
/// The UUID used for the Service Changed characteristic (Assigned Numbers 3.8.1 Characteristics by Name)
pub const SERVICE_CHANGE_UUID: Uuid = Uuid::new(0x2A05);
/// The UUID used for the Client Characteristic Configuration descriptor (Assigned Numbers 3.7 Descriptors)
pub const CLIENT_CHARACTERISTIC_CONFIGURATION_UUID: Uuid = Uuid::new(0x2902);

impl GattDatastore for GattService {
    fn read(&self, handle: AttHandle) -> Result<Vec<u8>, AttErrorCode> {
        match handle {
            // no client has subscribed
            SERVICE_CHANGE_CCC_DESCRIPTOR_HANDLE => Ok(vec![0x00, 0x00]),
            _ => Err(AttErrorCode::READ_NOT_PERMITTED),
        }
    }
}

/// The value indicated on the Service Changed characteristic: the affected
/// handle range, little-endian.
pub fn service_changed_value(range: RangeInclusive<AttHandle>) -> Vec<u8> {
    let mut value = Vec::with_capacity(4);
    value.extend_from_slice(&range.start().0.to_le_bytes());
    value.extend_from_slice(&range.end().0.to_le_bytes());
    value
}

/// Register the GATT service in the provided GATT database.
pub fn register_gatt_service(database: &mut GattDatabase) -> Result<()> {
    database.add_service_with_handles(
        // GATT Service
        GattServiceWithHandle {
            handle: GATT_SERVICE_HANDLE,
            type_: GATT_SERVICE_UUID,
            // Service Changed Characteristic
            characteristics: vec![GattCharacteristicWithHandle {
                handle: SERVICE_CHANGE_HANDLE,
                type_: SERVICE_CHANGE_UUID,
                properties: CharacteristicProperties::INDICATE,
                descriptors: vec![GattDescriptorWithHandle {
                    handle: SERVICE_CHANGE_CCC_DESCRIPTOR_HANDLE,
                    type_: CLIENT_CHARACTERISTIC_CONFIGURATION_UUID,
                }],
            }],
        },
        Rc::new(GattService),
    )
}
