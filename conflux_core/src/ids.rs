//! Tagged 32-bit identifiers for the entities of a federation.
//!
//! Each identifier is a distinct newtype so that a federate id can never be
//! assigned where a handle is expected. Arenas index by these ids directly;
//! there is no pointer graph between federates, cores and interfaces.

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$attr:meta])* $vis:vis struct $name:ident, $tag:literal) => {
        $(#[$attr])*
        #[derive(Serialize, Deserialize)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        $vis struct $name(u32);

        impl Default for $name {
            fn default() -> Self {
                Self::INVALID
            }
        }

        impl $name {
            /// Sentinel for "no id assigned".
            pub const INVALID: Self = Self(u32::MAX);

            pub const fn new(id: u32) -> Self {
                Self(id)
            }

            pub const fn raw(self) -> u32 {
                self.0
            }

            pub const fn is_valid(self) -> bool {
                self.0 != u32::MAX
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                if self.is_valid() {
                    write!(f, concat!($tag, "{}"), self.0)
                } else {
                    write!(f, concat!($tag, "invalid"))
                }
            }
        }
    };
}

id_type! {
    /// Federation-unique federate id, assigned by the root broker on
    /// registration. Shares the id space with [`GlobalBrokerId`]: broker ids
    /// are allocated below [`GlobalFederateId::BASE`], federate ids at or
    /// above it, so a frame source slot can carry either.
    pub struct GlobalFederateId, "fed"
}

id_type! {
    /// Index of a federate inside its owning core; 1-based.
    pub struct LocalFederateId, "lfed"
}

id_type! {
    /// Per-core unique handle for a publication / input / endpoint / filter /
    /// translator. Monotonic within the core that created it.
    pub struct InterfaceHandle, "hnd"
}

id_type! {
    /// Federation-unique id for a broker or core, assigned by the root.
    pub struct GlobalBrokerId, "brk"
}

id_type! {
    /// Per-node key for "how to reach this neighbor".
    pub struct RouteId, "rt"
}

impl GlobalFederateId {
    /// First id handed out to federates; everything below is a broker/core id.
    pub const BASE: u32 = 0x0001_0000;

    /// Whether this id actually names a broker or core rather than a federate.
    pub const fn is_broker(self) -> bool {
        self.0 < Self::BASE && self.0 != u32::MAX
    }
}

impl GlobalBrokerId {
    /// The root broker always takes the first id.
    pub const ROOT: Self = Self(1);

    /// View this broker id as a frame source/destination federate slot.
    pub const fn as_federate(self) -> GlobalFederateId {
        GlobalFederateId(self.0)
    }
}

impl RouteId {
    /// The default route towards the parent broker.
    pub const PARENT: Self = Self(0);
}

/// Fully-qualified interface identity: the owning federate plus the
/// per-core interface handle.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalHandle {
    pub federate: GlobalFederateId,
    pub handle: InterfaceHandle,
}

impl GlobalHandle {
    pub const INVALID: Self = Self {
        federate: GlobalFederateId::INVALID,
        handle: InterfaceHandle::INVALID,
    };

    pub const fn new(federate: GlobalFederateId, handle: InterfaceHandle) -> Self {
        Self { federate, handle }
    }

    pub const fn is_valid(self) -> bool {
        self.federate.is_valid() && self.handle.is_valid()
    }
}

impl std::fmt::Display for GlobalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.federate, self.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_sentinels() {
        assert!(!GlobalFederateId::INVALID.is_valid());
        assert!(!GlobalHandle::INVALID.is_valid());
        assert!(GlobalFederateId::new(0).is_valid());
    }

    #[test]
    fn broker_and_federate_id_spaces_are_disjoint() {
        let broker = GlobalBrokerId::ROOT.as_federate();
        assert!(broker.is_broker());
        let fed = GlobalFederateId::new(GlobalFederateId::BASE + 3);
        assert!(!fed.is_broker());
    }
}
