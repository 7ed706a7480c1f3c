use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::state::TypeId;

use super::World;

/// A connected peer that can own input authority over entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Meta slot plus generation. A reused slot gets a new generation, so an
/// id held from before the reuse no longer matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkId {
    index: u32,
    generation: u32,
}

impl NetworkId {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub const fn index(self) -> u32 {
        self.index
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }

    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Generation zero never names a live entity, so a zero raw value is
    /// "no entity".
    pub const fn from_raw(raw: u64) -> Option<Self> {
        let generation = (raw >> 32) as u32;
        if generation == 0 {
            return None;
        }
        Some(Self {
            index: raw as u32,
            generation,
        })
    }

    pub(crate) fn next_generation(generation: u32) -> u32 {
        match generation.wrapping_add(1) {
            0 => 1,
            g => g,
        }
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MetaFlags: u8 {
        const EXISTS = 1 << 0;
        const DESTROYED = 1 << 1;
    }
}

/// Per-entity bookkeeping stored alongside pool memory and copied into every
/// snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    pub id: NetworkId,
    pub type_id: TypeId,
    pub slot: u32,
    pub flags: MetaFlags,
    pub input_authority: Option<ClientId>,
}

impl ObjectMeta {
    pub(crate) fn vacant(index: u32) -> Self {
        Self {
            id: NetworkId::new(index, 0),
            type_id: TypeId(0),
            slot: 0,
            flags: MetaFlags::empty(),
            input_authority: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.flags.contains(MetaFlags::EXISTS)
    }

    pub fn is_destroyed(&self) -> bool {
        self.flags.contains(MetaFlags::DESTROYED)
    }

    /// True only when this slot currently holds exactly `id`.
    pub fn holds(&self, id: NetworkId) -> bool {
        self.is_alive() && self.id == id
    }
}

/// Comparable, serialisable reference to an entity. Fits in a `u64`
/// networked field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NetworkObjectRef(u64);

impl NetworkObjectRef {
    pub const NONE: Self = Self(0);

    pub fn to(id: NetworkId) -> Self {
        Self(id.to_raw())
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn id(self) -> Option<NetworkId> {
        NetworkId::from_raw(self.0)
    }

    /// Resolves against `world`; a stale generation yields `None`, never the
    /// slot's new occupant.
    pub fn resolve(self, world: &World) -> Option<NetworkId> {
        self.id().filter(|id| world.contains(*id))
    }
}

impl From<NetworkId> for NetworkObjectRef {
    fn from(id: NetworkId) -> Self {
        Self::to(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_roundtrip() {
        let id = NetworkId::new(17, 3);
        assert_eq!(NetworkId::from_raw(id.to_raw()), Some(id));
        assert_eq!(NetworkId::from_raw(0), None);
        assert_eq!(NetworkId::from_raw(5), None);
    }

    #[test]
    fn generation_skips_zero() {
        assert_eq!(NetworkId::next_generation(u32::MAX), 1);
        assert_eq!(NetworkId::next_generation(4), 5);
    }

    #[test]
    fn none_ref() {
        assert!(NetworkObjectRef::NONE.is_none());
        assert_eq!(NetworkObjectRef::NONE.id(), None);
    }
}
