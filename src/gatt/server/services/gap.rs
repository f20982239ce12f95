//! The GAP service as defined in Core Spec 5.3 Vol 3C Section 12

use std::rc::Rc;

use anyhow::Result;

use crate::{
    core::uuid::Uuid,
    gatt::{
        characteristic::CharacteristicProperties,
        ids::AttHandle,
        server::gatt_database::{
            AttErrorCode, GattCharacteristicWithHandle, GattDatabase, GattDatastore,
            GattServiceWithHandle,
        },
    },
};

struct GapService;

// Must lie in the range reserved for GAP by the native stack
const GAP_SERVICE_HANDLE: AttHandle = AttHandle(20);
const DEVICE_NAME_HANDLE: AttHandle = AttHandle(22);
const DEVICE_APPEARANCE_HANDLE: AttHandle = AttHandle(24);
const PREFERRED_CONNECTION_PARAMETERS_HANDLE: AttHandle = AttHandle(26);

/// The UUID used for the GAP service (Assigned Numbers 3.4.1 Services by Name)
pub const GAP_SERVICE_UUID: Uuid = Uuid::new(0x1800);
/// The UUID used for the Device Name characteristic (Assigned Numbers 3.8.1 Characteristics by Name)
pub const DEVICE_NAME_UUID: Uuid = Uuid::new(0x2A00);
/// The UUID used for the Device Appearance characteristic (Assigned Numbers 3.8.1 Characteristics by Name)
pub const DEVICE_APPEARANCE_UUID: Uuid = Uuid::new(0x2A01);
/// The UUID used for the Peripheral Preferred Connection Parameters characteristic
pub const PREFERRED_CONNECTION_PARAMETERS_UUID: Uuid = Uuid::new(0x2A04);

impl GattDatastore for GapService {
    fn read(&self, handle: AttHandle) -> Result<Vec<u8>, AttErrorCode> {
        match handle {
            // for non-bonded peers, don't let them read the device name
            DEVICE_NAME_HANDLE => Err(AttErrorCode::INSUFFICIENT_AUTHENTICATION),
            // 0x0000 from AssignedNumbers => "Unknown"
            DEVICE_APPEARANCE_HANDLE => Ok(vec![0x00, 0x00]),
            // every field 0xFFFF => no specific preference
            PREFERRED_CONNECTION_PARAMETERS_HANDLE => Ok(vec![0xFF; 8]),
            _ => Err(AttErrorCode::READ_NOT_PERMITTED),
        }
    }
}

/// Register the GAP service in the provided GATT database.
pub fn register_gap_service(database: &mut GattDatabase) -> Result<()> {
    database.add_service_with_handles(
        // GAP Service
        GattServiceWithHandle {
            handle: GAP_SERVICE_HANDLE,
            type_: GAP_SERVICE_UUID,
            characteristics: vec![
                // Device Name
                GattCharacteristicWithHandle {
                    handle: DEVICE_NAME_HANDLE,
                    type_: DEVICE_NAME_UUID,
                    properties: CharacteristicProperties::READ,
                    descriptors: vec![],
                },
                // Appearance
                GattCharacteristicWithHandle {
                    handle: DEVICE_APPEARANCE_HANDLE,
                    type_: DEVICE_APPEARANCE_UUID,
                    properties: CharacteristicProperties::READ,
                    descriptors: vec![],
                },
                // Peripheral Preferred Connection Parameters
                GattCharacteristicWithHandle {
                    handle: PREFERRED_CONNECTION_PARAMETERS_HANDLE,
                    type_: PREFERRED_CONNECTION_PARAMETERS_UUID,
                    properties: CharacteristicProperties::READ,
                    descriptors: vec![],
                },
            ],
        },
        Rc::new(GapService),
    )
}
