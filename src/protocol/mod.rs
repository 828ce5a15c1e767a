//! The wire-protocol layer: framing, descriptors, codecs, session state,
//! and the message types exchanged with the server.

pub mod buffer;
pub mod codec;
pub mod descriptor;
pub mod message;
pub mod state;

pub use buffer::{BufferReader, BufferWriter};
pub use descriptor::{Descriptor, DescriptorCache, DescriptorId};
pub use message::{Message, MessageType};

use bitflags::bitflags;
use enum_primitive_derive::Primitive;

/// A protocol version, as `{major, minor}`, with total ordering (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        ProtocolVersion { major, minor }
    }

    /// True if this version is at least `other`.
    pub fn at_least(&self, other: ProtocolVersion) -> bool {
        *self >= other
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Threshold constants gating protocol-dependent logic (spec §3).
pub const V0_X: ProtocolVersion = ProtocolVersion::new(0, 0);
pub const V1_0: ProtocolVersion = ProtocolVersion::new(1, 0);
pub const V2_0: ProtocolVersion = ProtocolVersion::new(2, 0);
pub const V3_0: ProtocolVersion = ProtocolVersion::new(3, 0);

/// The minimum protocol version this client will speak to.
pub const MIN_SUPPORTED_VERSION: ProtocolVersion = V0_X;

/// The maximum protocol version this client advertises during handshake.
pub const MAX_SUPPORTED_VERSION: ProtocolVersion = V3_0;

/// Expected result cardinality of a query, and the cardinality the server
/// reports back in a `CommandDescription` (spec §3).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Primitive)]
pub enum Cardinality {
    NoResult = 0x6e,
    AtMostOne = 0x6f,
    One = 0x41,
    Many = 0x6d,
    AtLeastOne = 0x4d,
}

bitflags! {
    /// Capabilities bitmask sent with every Parse/Execute (spec §3, §9).
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u64 {
        const MODIFICATIONS       = 0b0000_0001;
        const SESSION_CONFIG      = 0b0000_0010;
        const TRANSACTION         = 0b0000_0100;
        const DDL                 = 0b0000_1000;
        const PERSISTENT_CONFIG   = 0b0001_0000;

        const ALL = Self::MODIFICATIONS.bits()
            | Self::SESSION_CONFIG.bits()
            | Self::TRANSACTION.bits()
            | Self::DDL.bits()
            | Self::PERSISTENT_CONFIG.bits();
    }

    /// Flags negotiated at Parse time describing how the command should be
    /// compiled.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct CompilationFlags: u64 {
        const INJECT_OUTPUT_TYPE_IDS  = 0b0001;
        const INJECT_OUTPUT_TYPE_NAMES = 0b0010;
        const INJECT_OUTPUT_OBJECT_IDS = 0b0100;
    }
}

impl Capabilities {
    /// Read-only queries are the only ones a transaction retries
    /// unconditionally (spec §4.8); everything else needs a conflict
    /// classification on top.
    pub fn is_read_only(&self) -> bool {
        self.bits() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        assert!(V2_0 > V1_0);
        assert!(V1_0 > V0_X);
        assert!(ProtocolVersion::new(2, 1) > V2_0);
    }

    #[test]
    fn at_least_checks_threshold() {
        let v = ProtocolVersion::new(2, 5);
        assert!(v.at_least(V2_0));
        assert!(!v.at_least(V3_0));
    }

    #[test]
    fn read_only_capabilities_are_empty() {
        assert!(Capabilities::empty().is_read_only());
        assert!(!Capabilities::MODIFICATIONS.is_read_only());
    }
}
