mod history;

pub use history::WorldHistory;

use crate::state::{StateView, TypeRegistry};
use crate::world::{NetworkId, ObjectMeta, World};

/// Full copy of every pool plus the meta table at the end of one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    tick: u32,
    pools: Vec<Vec<u8>>,
    metas: Vec<ObjectMeta>,
}

impl Snapshot {
    pub fn capture(tick: u32, world: &World) -> Self {
        let mut snapshot = Self::default();
        snapshot.capture_into(tick, world);
        snapshot
    }

    /// Overwrites this snapshot in place, keeping its allocations.
    pub fn capture_into(&mut self, tick: u32, world: &World) {
        self.tick = tick;
        self.pools.resize_with(world.pools().len(), Vec::new);
        for (target, pool) in self.pools.iter_mut().zip(world.pools()) {
            target.clear();
            target.extend_from_slice(pool.bytes());
        }
        self.metas.clear();
        self.metas.extend_from_slice(world.metas());
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn pools(&self) -> &[Vec<u8>] {
        &self.pools
    }

    pub fn metas(&self) -> &[ObjectMeta] {
        &self.metas
    }

    pub fn world_object_meta(&self, meta_index: u32) -> Option<&ObjectMeta> {
        self.metas.get(meta_index as usize)
    }

    pub fn contains(&self, id: NetworkId) -> bool {
        self.world_object_meta(id.index())
            .is_some_and(|meta| meta.holds(id))
    }

    /// Historical bytes for `id`. Slots get reused, so the stored network id
    /// has to match before the bytes are trusted.
    pub fn block(&self, registry: &TypeRegistry, id: NetworkId) -> Option<&[u8]> {
        let meta = self.world_object_meta(id.index()).filter(|m| m.holds(id))?;
        let size = registry.table(meta.type_id)?.block_size();
        let start = meta.slot as usize * size;
        self.pools.get(meta.type_id.index())?.get(start..start + size)
    }

    pub fn view(&self, registry: &TypeRegistry, id: NetworkId) -> Option<StateView<'_>> {
        self.block(registry, id).map(StateView::new)
    }

    pub fn ids(&self) -> impl Iterator<Item = NetworkId> + '_ {
        self.metas
            .iter()
            .filter(|meta| meta.is_alive())
            .map(|meta| meta.id)
    }
}
