//! Protocol version and negotiated configuration.
//!
//! Both peers exchange a [`FullVersion`] once per connection. It packs the configuration
//! bitset in the high half and the protocol version number in the low half, and peers only
//! talk to each other when the two values are identical.
use std::fmt;

pub const MAJOR_NUMBER: u32 = 1;
pub const MINOR_NUMBER: u32 = 0;
pub const PATCH_NUMBER: u32 = 0;

/// Monotonically increasing protocol version number.
pub const PROTOCOL_VERSION: u32 = (MAJOR_NUMBER << 24) | (MINOR_NUMBER << 8) | PATCH_NUMBER;

/// Capability flags negotiated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigurationFlags(u32);

impl ConfigurationFlags {
    /// Object references are compressed on the compiling side.
    pub const COMPRESSED_REFS: u32 = 1 << 0;

    const SPEC_VERSION_SHIFT: u32 = 8;
    const SPEC_VERSION_MASK: u32 = 0xFF << Self::SPEC_VERSION_SHIFT;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn compressed_refs(self) -> bool {
        self.0 & Self::COMPRESSED_REFS != 0
    }

    pub const fn with_compressed_refs(self, enabled: bool) -> Self {
        if enabled {
            Self(self.0 | Self::COMPRESSED_REFS)
        } else {
            Self(self.0 & !Self::COMPRESSED_REFS)
        }
    }

    /// Platform version tag carried in bits 8..16.
    pub const fn spec_version(self) -> u8 {
        ((self.0 & Self::SPEC_VERSION_MASK) >> Self::SPEC_VERSION_SHIFT) as u8
    }

    pub const fn with_spec_version(self, tag: u8) -> Self {
        Self((self.0 & !Self::SPEC_VERSION_MASK) | ((tag as u32) << Self::SPEC_VERSION_SHIFT))
    }
}

impl Default for ConfigurationFlags {
    /// Tags the configuration with the pointer width, since handles travel as raw addresses.
    fn default() -> Self {
        Self::empty().with_spec_version(usize::BITS as u8)
    }
}

/// Configuration bitset and protocol version exchanged in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FullVersion {
    pub config: ConfigurationFlags,
    pub version: u32,
}

impl FullVersion {
    /// The version spoken by this build with the given configuration.
    pub const fn current(config: ConfigurationFlags) -> Self {
        Self {
            config,
            version: PROTOCOL_VERSION,
        }
    }

    pub const fn from_parts(config: u32, version: u32) -> Self {
        Self {
            config: ConfigurationFlags::from_raw(config),
            version,
        }
    }

    pub const fn from_u64(value: u64) -> Self {
        Self::from_parts((value >> 32) as u32, value as u32)
    }

    pub const fn as_u64(self) -> u64 {
        ((self.config.raw() as u64) << 32) | self.version as u64
    }
}

impl Default for FullVersion {
    fn default() -> Self {
        Self::current(ConfigurationFlags::default())
    }
}

impl fmt::Display for FullVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{} (config {:#x})",
            self.version >> 24,
            (self.version >> 8) & 0xFFFF,
            self.version & 0xFF,
            self.config.raw()
        )
    }
}
