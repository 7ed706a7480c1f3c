//! Live entity storage: one [`Pool`] per registered type plus the meta table
//! that gives every entity its identity.

mod entity;
mod pool;

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{ConfigError, ProtocolError};
use crate::snapshot::Snapshot;
use crate::state::{Networked, StateView, StateViewMut, TypeId, TypeRegistry};

pub use entity::{ClientId, MetaFlags, NetworkId, NetworkObjectRef, ObjectMeta};
pub use pool::Pool;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[derive(Debug, Clone)]
pub struct World {
    registry: Arc<TypeRegistry>,
    pools: Vec<Pool>,
    metas: Vec<ObjectMeta>,
    free_metas: BTreeSet<u32>,
}

impl World {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        let pools = registry
            .iter()
            .map(|t| {
                Pool::new(
                    t.id,
                    t.table.type_name(),
                    t.table.block_size(),
                    t.config.max_objects,
                )
            })
            .collect();
        let meta_count = registry.total_capacity() as u32;
        Self {
            registry,
            pools,
            metas: (0..meta_count).map(ObjectMeta::vacant).collect(),
            free_metas: (0..meta_count).collect(),
        }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn spawn(
        &mut self,
        type_id: TypeId,
        authority: Option<ClientId>,
    ) -> Result<NetworkId, ConfigError> {
        let pool = self
            .pools
            .get_mut(type_id.index())
            .ok_or_else(|| ConfigError::UnknownType(format!("{type_id:?}")))?;
        let slot = pool.allocate()?;

        let Some(index) = self.free_metas.pop_first() else {
            pool.free(slot);
            return Err(ConfigError::PoolExhausted {
                type_name: "entity meta table".into(),
                capacity: self.metas.len() as u32,
            });
        };

        let meta = &mut self.metas[index as usize];
        let id = NetworkId::new(index, NetworkId::next_generation(meta.id.generation()));
        *meta = ObjectMeta {
            id,
            type_id,
            slot,
            flags: MetaFlags::EXISTS,
            input_authority: authority,
        };
        log::debug!("spawned {} ({:?}, slot {})", id, type_id, slot);
        Ok(id)
    }

    pub fn spawn_as<T: Networked>(
        &mut self,
        authority: Option<ClientId>,
    ) -> Result<NetworkId, ConfigError> {
        let type_id = self
            .registry
            .id_of(T::TYPE_NAME)
            .ok_or_else(|| ConfigError::UnknownType(T::TYPE_NAME.to_string()))?;
        self.spawn(type_id, authority)
    }

    /// Frees the pool slot and marks the meta destroyed. The id and type
    /// stay in the meta so older references keep failing to resolve.
    pub fn despawn(&mut self, id: NetworkId) -> bool {
        let Some(meta) = self.metas.get_mut(id.index() as usize) else {
            return false;
        };
        if !meta.holds(id) {
            return false;
        }
        meta.flags = MetaFlags::DESTROYED;
        meta.input_authority = None;
        let (type_id, slot) = (meta.type_id, meta.slot);
        if let Some(pool) = self.pools.get_mut(type_id.index()) {
            pool.free(slot);
        }
        self.free_metas.insert(id.index());
        log::debug!("despawned {}", id);
        true
    }

    pub fn contains(&self, id: NetworkId) -> bool {
        self.meta(id).is_some()
    }

    pub fn meta(&self, id: NetworkId) -> Option<&ObjectMeta> {
        self.metas
            .get(id.index() as usize)
            .filter(|meta| meta.holds(id))
    }

    pub fn meta_at(&self, index: u32) -> Option<&ObjectMeta> {
        self.metas.get(index as usize)
    }

    pub fn metas(&self) -> &[ObjectMeta] {
        &self.metas
    }

    /// Alive entities in meta-index order, the order every tick runs in.
    pub fn iter(&self) -> impl Iterator<Item = &ObjectMeta> {
        self.metas.iter().filter(|meta| meta.is_alive())
    }

    pub fn ids(&self) -> Vec<NetworkId> {
        self.iter().map(|meta| meta.id).collect()
    }

    pub fn ids_of(&self, type_id: TypeId) -> Vec<NetworkId> {
        self.iter()
            .filter(|meta| meta.type_id == type_id)
            .map(|meta| meta.id)
            .collect()
    }

    pub fn entity_count(&self) -> usize {
        self.metas.len() - self.free_metas.len()
    }

    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }

    pub fn block(&self, id: NetworkId) -> Option<&[u8]> {
        let meta = self.meta(id)?;
        self.pools.get(meta.type_id.index())?.block(meta.slot)
    }

    pub fn view(&self, id: NetworkId) -> Option<StateView<'_>> {
        self.block(id).map(StateView::new)
    }

    pub fn view_mut(&mut self, id: NetworkId) -> Option<StateViewMut<'_>> {
        let meta = *self.meta(id)?;
        self.pools
            .get_mut(meta.type_id.index())?
            .block_mut(meta.slot)
            .map(StateViewMut::new)
    }

    pub fn input_authority(&self, id: NetworkId) -> Option<ClientId> {
        self.meta(id).and_then(|meta| meta.input_authority)
    }

    pub fn set_input_authority(&mut self, id: NetworkId, authority: Option<ClientId>) -> bool {
        match self.metas.get_mut(id.index() as usize) {
            Some(meta) if meta.holds(id) => {
                meta.input_authority = authority;
                true
            }
            _ => false,
        }
    }

    pub fn find_by_authority(&self, client: ClientId) -> Vec<NetworkId> {
        self.iter()
            .filter(|meta| meta.input_authority == Some(client))
            .map(|meta| meta.id)
            .collect()
    }

    /// Overwrites all pools and metas with a captured snapshot.
    pub fn restore_from(&mut self, snapshot: &Snapshot) {
        for (pool, bytes) in self.pools.iter_mut().zip(snapshot.pools()) {
            pool.load_bytes(bytes);
        }
        self.metas.clear();
        self.metas.extend_from_slice(snapshot.metas());
        self.rebuild_free_lists();
    }

    pub fn copy_from(&mut self, other: &World) {
        for (pool, source) in self.pools.iter_mut().zip(&other.pools) {
            pool.load_bytes(source.bytes());
        }
        self.metas.clear();
        self.metas.extend_from_slice(&other.metas);
        self.rebuild_free_lists();
    }

    fn rebuild_free_lists(&mut self) {
        self.free_metas = self
            .metas
            .iter()
            .enumerate()
            .filter(|(_, meta)| !meta.is_alive())
            .map(|(index, _)| index as u32)
            .collect();
        for pool in &mut self.pools {
            let type_id = pool.type_id();
            let used = self
                .metas
                .iter()
                .filter(|meta| meta.is_alive() && meta.type_id == type_id)
                .map(|meta| meta.slot);
            pool.rebuild_free(used);
        }
    }

    /// Puts replicated state for `id` in place, evicting whatever else the
    /// meta slot held. Only called with fully validated payloads.
    pub(crate) fn place(
        &mut self,
        id: NetworkId,
        type_id: TypeId,
        authority: Option<ClientId>,
        block: &[u8],
    ) -> Result<(), ProtocolError> {
        let index = id.index() as usize;
        let capacity = self.metas.len();
        let current = *self
            .metas
            .get(index)
            .ok_or(ProtocolError::EntityIndexOutOfRange {
                index: id.index(),
                capacity,
            })?;

        let slot = if current.holds(id) && current.type_id == type_id {
            current.slot
        } else {
            if current.is_alive() {
                self.despawn(current.id);
            }
            let pool = self
                .pools
                .get_mut(type_id.index())
                .ok_or(ProtocolError::UnknownTypeId(type_id.0))?;
            let slot = pool.allocate()?;
            self.free_metas.remove(&id.index());
            slot
        };

        self.metas[index] = ObjectMeta {
            id,
            type_id,
            slot,
            flags: MetaFlags::EXISTS,
            input_authority: authority,
        };
        let target = self.pools[type_id.index()]
            .block_mut(slot)
            .ok_or(ProtocolError::BlockSizeMismatch {
                type_id: type_id.0,
                got: block.len(),
                expected: 0,
            })?;
        if target.len() != block.len() {
            return Err(ProtocolError::BlockSizeMismatch {
                type_id: type_id.0,
                got: block.len(),
                expected: target.len(),
            });
        }
        target.copy_from_slice(block);
        Ok(())
    }

    /// Removes exactly `id`; a newer occupant of the same meta slot is left
    /// alone.
    pub(crate) fn remove_exact(&mut self, id: NetworkId) -> bool {
        self.despawn(id)
    }

    /// FNV-1a over every alive entity's identity and state. Independent of
    /// pool slot assignment, so a replica and its source agree once synced.
    pub fn checksum(&self) -> u64 {
        let mut hash = FNV_OFFSET;
        let mut feed = |bytes: &[u8]| {
            for byte in bytes {
                hash ^= *byte as u64;
                hash = hash.wrapping_mul(FNV_PRIME);
            }
        };
        for meta in self.iter() {
            feed(&meta.id.to_raw().to_le_bytes());
            feed(&meta.type_id.0.to_le_bytes());
            feed(&meta.input_authority.map_or(u32::MAX, |c| c.0).to_le_bytes());
            if let Some(block) = self
                .pools
                .get(meta.type_id.index())
                .and_then(|pool| pool.block(meta.slot))
            {
                feed(block);
            }
        }
        hash
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::config::TypeConfig;

    crate::networked! {
        struct Marker {
            position: Vec3,
            charge: i32,
        }
    }

    fn world(capacity: u32) -> World {
        let registry = TypeRegistry::builder()
            .register::<Marker>(TypeConfig::with_capacity(capacity))
            .unwrap()
            .build();
        World::new(registry)
    }

    #[test]
    fn spawn_writes_through_views() {
        let mut world = world(4);
        let marker = world.registry().bind::<Marker>().unwrap();
        let id = world.spawn_as::<Marker>(Some(ClientId(1))).unwrap();

        world.view_mut(id).unwrap().set(marker.charge, 42);
        assert_eq!(world.view(id).unwrap().get(marker.charge), 42);
        assert_eq!(world.input_authority(id), Some(ClientId(1)));
        assert_eq!(world.find_by_authority(ClientId(1)), vec![id]);
    }

    #[test]
    fn reused_slot_bumps_generation_and_stales_refs() {
        let mut world = world(2);
        let first = world.spawn_as::<Marker>(None).unwrap();
        let reference = NetworkObjectRef::to(first);
        assert!(world.despawn(first));
        assert!(!world.despawn(first));

        let second = world.spawn_as::<Marker>(None).unwrap();
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert_eq!(reference.resolve(&world), None);
        assert_eq!(NetworkObjectRef::to(second).resolve(&world), Some(second));
    }

    #[test]
    fn exhaustion_fails_spawn() {
        let mut world = world(1);
        world.spawn_as::<Marker>(None).unwrap();
        assert!(matches!(
            world.spawn_as::<Marker>(None),
            Err(ConfigError::PoolExhausted { .. })
        ));
        assert_eq!(world.entity_count(), 1);
    }

    #[test]
    fn copy_from_rebuilds_free_lists() {
        let mut source = world(3);
        let marker = source.registry().bind::<Marker>().unwrap();
        let a = source.spawn_as::<Marker>(None).unwrap();
        let b = source.spawn_as::<Marker>(None).unwrap();
        source.view_mut(b).unwrap().set(marker.position, Vec3::X);
        source.despawn(a);

        let mut copy = world(3);
        copy.copy_from(&source);
        assert_eq!(copy.checksum(), source.checksum());
        assert_eq!(copy.ids(), vec![b]);

        let c = copy.spawn_as::<Marker>(None).unwrap();
        assert_eq!(c.index(), a.index());
        assert_ne!(copy.meta(c).unwrap().slot, copy.meta(b).unwrap().slot);
    }

    #[test]
    fn place_evicts_previous_occupant() {
        let mut world = world(2);
        let old = world.spawn_as::<Marker>(None).unwrap();
        let newer = NetworkId::new(old.index(), old.generation() + 1);
        let block = vec![1u8; 16];

        world.place(newer, TypeId(0), None, &block).unwrap();
        assert!(!world.contains(old));
        assert_eq!(world.block(newer), Some(&block[..]));
        assert_eq!(world.entity_count(), 1);
    }
}
