//! These are strongly-typed identifiers representing the various objects
//! interacted with by the GATT client

use crate::core::uuid::Uuid;

/// The handle of a given ATT attribute. Handle 0 is never a valid attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttHandle(pub u16);

impl AttHandle {
    /// The reserved, invalid handle
    pub const INVALID: AttHandle = AttHandle(0);

    /// Whether this handle may refer to an attribute
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// The interface id of a registered client application, in 1..=32
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientIf(pub u8);

impl ClientIf {
    /// The bit representing this client in a 32-bit interface mask, or None
    /// if the id is out of range
    pub fn mask_bit(self) -> Option<u32> {
        match self.0 {
            1..=32 => Some(1u32 << (self.0 - 1)),
            _ => None,
        }
    }
}

/// The index of a live link, assigned by the transport
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportIndex(pub u8);

/// One client application's view of one link. Two applications connected
/// to the same peer hold different connection ids on the same transport index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u16);

impl ConnectionId {
    /// Create a ConnectionId from a TransportIndex and ClientIf
    pub const fn new(tcb_idx: TransportIndex, client_if: ClientIf) -> ConnectionId {
        ConnectionId(((tcb_idx.0 as u16) << 8) + (client_if.0 as u16))
    }

    /// Extract the TransportIndex from a ConnectionId (upper 8 bits)
    pub fn get_tcb_idx(&self) -> TransportIndex {
        TransportIndex((self.0 >> 8) as u8)
    }

    /// Extract the ClientIf from a ConnectionId (lower 8 bits)
    pub fn get_client_if(&self) -> ClientIf {
        ClientIf(self.0 as u8)
    }
}

/// A UUID plus the instance id that disambiguates siblings sharing it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GattId {
    pub uuid: Uuid,
    pub inst_id: u8,
}

impl GattId {
    /// Constructor
    pub const fn new(uuid: Uuid, inst_id: u8) -> Self {
        Self { uuid, inst_id }
    }
}

/// Identifies a service in a peer's attribute table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId {
    pub id: GattId,
    pub is_primary: bool,
}

impl ServiceId {
    /// A primary service
    pub const fn primary(uuid: Uuid, inst_id: u8) -> Self {
        Self { id: GattId::new(uuid, inst_id), is_primary: true }
    }
}

/// Identifies a characteristic within a service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicId {
    pub service: ServiceId,
    pub characteristic: GattId,
}

/// Identifies a characteristic value, or one of its descriptors
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeId {
    pub characteristic: CharacteristicId,
    pub descriptor: Option<GattId>,
}

impl AttributeId {
    /// The value of a characteristic
    pub const fn characteristic(characteristic: CharacteristicId) -> Self {
        Self { characteristic, descriptor: None }
    }

    /// A descriptor of a characteristic
    pub const fn descriptor(characteristic: CharacteristicId, descriptor: GattId) -> Self {
        Self { characteristic, descriptor: Some(descriptor) }
    }
}
