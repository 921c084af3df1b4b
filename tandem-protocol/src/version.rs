//! Protocol versions and the version capability table.
//!
//! Each protocol generation is described by one [`VersionEntry`]: the
//! features a session negotiated at that version may use, and the
//! serialization quirks the codec applies at that version. The table is
//! static and shared by every session in the process.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A negotiated or offered protocol version.
///
/// Versions are single unsigned bytes. `0` is reserved as the
/// "unsupported" sentinel and can never be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ProtocolVersion(u8);

impl ProtocolVersion {
    pub const V1: Self = Self(1);
    pub const V2: Self = Self(2);
    pub const V3: Self = Self(3);
    pub const V4: Self = Self(4);
    pub const V5: Self = Self(5);

    /// Oldest version this implementation speaks.
    pub const MIN: Self = Self::V1;
    /// Newest version this implementation speaks.
    pub const MAX: Self = Self::V5;

    /// Creates a version from its wire byte. Returns `None` for the reserved `0`.
    pub const fn new(value: u8) -> Option<Self> {
        if value == 0 {
            None
        } else {
            Some(Self(value))
        }
    }

    /// Returns the wire byte.
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Returns the capability table entry for this version, if it is known.
    pub fn entry(self) -> Option<&'static VersionEntry> {
        VersionEntry::lookup(self)
    }

    /// Returns the capabilities of this version (empty for unknown versions).
    pub fn capabilities(self) -> Capabilities {
        self.entry()
            .map(|e| e.capabilities)
            .unwrap_or(Capabilities::NONE)
    }

    /// Returns the serialization quirks of this version.
    pub fn quirks(self) -> Quirks {
        self.entry().map(|e| e.quirks).unwrap_or(Quirks::NONE)
    }

    /// Returns whether this version is present in the capability table.
    pub fn is_known(self) -> bool {
        self.entry().is_some()
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(ProtocolError::UnsupportedVersion(value))
    }
}

impl From<ProtocolVersion> for u8 {
    fn from(version: ProtocolVersion) -> Self {
        version.0
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Feature flags gated by protocol version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Self = Self(0);
    /// The server may issue requests to the client.
    pub const BIDIRECTIONAL_RPC: Self = Self(1 << 0);
    /// The StartTls sub-handshake runs after Accept.
    pub const TLS_UPGRADE: Self = Self(1 << 1);
    /// Requests carry the caller's remaining time budget.
    pub const TIME_CONSTRAINTS: Self = Self(1 << 2);
    /// Correlation ids are (origin uuid, sequence) pairs.
    pub const COMPOUND_UUID: Self = Self(1 << 3);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns the names of the flags set, in table order.
    pub fn names(self) -> Vec<&'static str> {
        [
            (Self::BIDIRECTIONAL_RPC, "bidirectional-rpc"),
            (Self::TLS_UPGRADE, "tls-upgrade"),
            (Self::TIME_CONSTRAINTS, "time-constraints"),
            (Self::COMPOUND_UUID, "compound-uuid"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect()
    }
}

/// Serialization quirks active at a given version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Quirks(u8);

impl Quirks {
    pub const NONE: Self = Self(0);
    /// Enum fields are written as length-prefixed upper-case strings.
    pub const ENUMS_AS_STRINGS: Self = Self(1 << 0);
    /// Payload lengths are `u16` instead of `u32`.
    pub const NARROW_PAYLOAD_LENGTH: Self = Self(1 << 1);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn names(self) -> Vec<&'static str> {
        [
            (Self::ENUMS_AS_STRINGS, "enums-as-strings"),
            (Self::NARROW_PAYLOAD_LENGTH, "narrow-payload-length"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect()
    }
}

/// One row of the version capability table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionEntry {
    pub version: ProtocolVersion,
    pub capabilities: Capabilities,
    pub quirks: Quirks,
}

/// The capability table, ordered by ascending version.
pub static VERSION_TABLE: [VersionEntry; 5] = [
    VersionEntry {
        version: ProtocolVersion::V1,
        capabilities: Capabilities::NONE,
        quirks: Quirks::NARROW_PAYLOAD_LENGTH,
    },
    VersionEntry {
        version: ProtocolVersion::V2,
        capabilities: Capabilities::BIDIRECTIONAL_RPC,
        quirks: Quirks::NONE,
    },
    VersionEntry {
        version: ProtocolVersion::V3,
        capabilities: Capabilities::BIDIRECTIONAL_RPC.union(Capabilities::TLS_UPGRADE),
        quirks: Quirks::ENUMS_AS_STRINGS,
    },
    VersionEntry {
        version: ProtocolVersion::V4,
        capabilities: Capabilities::BIDIRECTIONAL_RPC
            .union(Capabilities::TLS_UPGRADE)
            .union(Capabilities::TIME_CONSTRAINTS),
        quirks: Quirks::NONE,
    },
    VersionEntry {
        version: ProtocolVersion::V5,
        capabilities: Capabilities::BIDIRECTIONAL_RPC
            .union(Capabilities::TLS_UPGRADE)
            .union(Capabilities::TIME_CONSTRAINTS)
            .union(Capabilities::COMPOUND_UUID),
        quirks: Quirks::NONE,
    },
];

impl VersionEntry {
    /// Looks up the table entry for `version`.
    pub fn lookup(version: ProtocolVersion) -> Option<&'static VersionEntry> {
        VERSION_TABLE.iter().find(|e| e.version == version)
    }

    pub fn supports(&self, capability: Capabilities) -> bool {
        self.capabilities.contains(capability)
    }
}
