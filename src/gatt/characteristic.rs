//! Characteristic properties (Core Spec 5.3 Vol 3G 3.3.1.1)

use bitflags::bitflags;

bitflags! {
    /// The properties octet of a characteristic declaration
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CharacteristicProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}
