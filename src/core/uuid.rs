//! A UUID (See Core Spec 5.3 Vol 1E 2.9.1. Basic Types)

use std::fmt;

/// A UUID (See Core Spec 5.3 Vol 1E 2.9.1. Basic Types)
///
/// Note that the underlying storage is BIG-ENDIAN! All converters should act
/// as though the backing storage is LITTLE-ENDIAN, which is how UUIDs travel
/// through the transport and the persisted cache.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Uuid([u8; 16]);

const BASE_UUID: u128 = 0x00000000_0000_1000_8000_0080_5F9B_34FB;

impl Uuid {
    /// Constructor from a u32.
    pub const fn new(val: u32) -> Self {
        Self((BASE_UUID + ((val as u128) << 96)).to_be_bytes())
    }

    /// Constructor from the full 128-bit value
    pub const fn from_u128(val: u128) -> Self {
        Self(val.to_be_bytes())
    }

    fn new_from_le_bytes(mut bytes: [u8; 16]) -> Self {
        bytes.reverse();
        Self(bytes)
    }

    /// Parse a 16, 32 or 128-bit UUID in little-endian byte order. Returns
    /// None for any other length.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            2 => Some(Self::new(u16::from_le_bytes([bytes[0], bytes[1]]) as u32)),
            4 => Some(Self::new(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))),
            16 => Some(Self::new_from_le_bytes(bytes.try_into().ok()?)),
            _ => None,
        }
    }

    /// The little-endian representation
    pub fn le_bytes(&self) -> [u8; 16] {
        let mut out = self.0;
        out.reverse();
        out
    }

    /// The 16-bit short form, if this UUID is derived from the base UUID
    pub fn as_u16(&self) -> Option<u16> {
        let backing = u128::from_be_bytes(self.0);
        if backing & ((1u128 << 96) - 1) == BASE_UUID {
            u16::try_from(backing >> 96).ok()
        } else {
            None
        }
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(short) = self.as_u16() {
            return write!(f, "{short:#06x}");
        }
        let b = self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9]
        )?;
        b[10..].iter().try_for_each(|byte| write!(f, "{byte:02x}"))
    }
}
