//! An address with type (public / random)

use std::fmt;

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(C)]
/// The type of an LE address (see: 5.3 Vol 6B 1.3 Device Address)
pub enum AddressType {
    /// A public address
    Public = 0x0,
    /// A random address (either random static or private)
    Random = 0x1,
}

/// An LE address
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(C)]
pub struct AddressWithType {
    /// The 6 address bytes stored in little-endian format
    pub address: [u8; 6],
    /// The address type, either public or random
    pub address_type: AddressType,
}

impl AddressWithType {
    /// An empty/invalid address. The background tracker uses it as the
    /// wildcard key for "listen to every device".
    pub const EMPTY: Self = Self { address: [0, 0, 0, 0, 0, 0], address_type: AddressType::Public };

    /// Constructor
    pub const fn new(address: [u8; 6], address_type: AddressType) -> Self {
        Self { address, address_type }
    }

    /// Whether this is the empty address
    pub fn is_empty(&self) -> bool {
        self.address == Self::EMPTY.address
    }
}

impl fmt::Display for AddressWithType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.address;
        let kind = match self.address_type {
            AddressType::Public => "public",
            AddressType::Random => "random",
        };
        write!(f, "{g:02x}:{e:02x}:{d:02x}:{c:02x}:{b:02x}:{a:02x} ({kind})")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_display_is_most_significant_byte_first() {
        let address = AddressWithType::new([1, 2, 3, 4, 5, 6], AddressType::Random);
        assert_eq!(address.to_string(), "06:05:04:03:02:01 (random)");
    }

    #[test]
    fn test_empty() {
        assert!(AddressWithType::EMPTY.is_empty());
        assert!(!AddressWithType::new([1, 0, 0, 0, 0, 0], AddressType::Public).is_empty());
    }
}
