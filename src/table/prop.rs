use bitflags::bitflags;

bitflags! {
    /// Characteristic properties ([Vol 3] Part G, Section 3.3.1.1).
    #[derive(
        Clone, Copy, Debug, Default, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize,
    )]
    #[repr(transparent)]
    #[serde(transparent)]
    pub struct Prop: u8 {
        /// Permits broadcasts of the Characteristic Value using Server
        /// Characteristic Configuration Descriptor.
        const BROADCAST = 0x01;
        /// Permits reads of the Characteristic Value.
        const READ = 0x02;
        /// Permits writes of the Characteristic Value without response.
        const WRITE_CMD = 0x04;
        /// Permits writes of the Characteristic Value with response.
        const WRITE = 0x08;
        /// Permits notifications of a Characteristic Value without
        /// acknowledgment.
        const NOTIFY = 0x10;
        /// Permits indications of a Characteristic Value with acknowledgment.
        const INDICATE = 0x20;
        /// Permits signed writes to the Characteristic Value.
        const SIGNED_WRITE_CMD = 0x40;
        /// Additional characteristic properties are defined in the
        /// Characteristic Extended Properties Descriptor.
        const EXT_PROPS = 0x80;
    }
}

impl Prop {
    /// Returns whether the characteristic can be observed by clients.
    #[inline]
    #[must_use]
    pub const fn is_observable(self) -> bool {
        self.intersects(Self::NOTIFY.union(Self::INDICATE))
    }
}

bitflags! {
    /// Attribute access permissions, as reported to and by the stack.
    #[derive(
        Clone, Copy, Debug, Default, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize,
    )]
    #[repr(transparent)]
    #[serde(transparent)]
    pub struct Perm: u16 {
        const READ = 0x0001;
        const READ_ENCRYPTED = 0x0002;
        const READ_ENCRYPTED_MITM = 0x0004;
        const WRITE = 0x0010;
        const WRITE_ENCRYPTED = 0x0020;
        const WRITE_ENCRYPTED_MITM = 0x0040;
        const WRITE_SIGNED = 0x0080;
        const WRITE_SIGNED_MITM = 0x0100;
    }
}
