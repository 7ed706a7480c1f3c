use std::collections::BTreeSet;

use crate::error::ConfigError;
use crate::state::TypeId;

/// Fixed-capacity block storage for one networked type.
///
/// Slot `n` lives at byte `n * block_size`; blocks never move. Freeing a slot
/// leaves its bytes untouched, the entity meta is what marks it dead.
#[derive(Debug, Clone)]
pub struct Pool {
    type_id: TypeId,
    type_name: String,
    block_size: usize,
    capacity: u32,
    data: Vec<u8>,
    free: BTreeSet<u32>,
}

impl Pool {
    pub fn new(type_id: TypeId, type_name: &str, block_size: usize, capacity: u32) -> Self {
        Self {
            type_id,
            type_name: type_name.to_string(),
            block_size,
            capacity,
            data: vec![0; block_size * capacity as usize],
            free: (0..capacity).collect(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity as usize - self.free.len()
    }

    /// Hands out the lowest free slot so that identical histories allocate
    /// identically. The returned block is zeroed.
    pub fn allocate(&mut self) -> Result<u32, ConfigError> {
        let slot = self.free.pop_first().ok_or_else(|| ConfigError::PoolExhausted {
            type_name: self.type_name.clone(),
            capacity: self.capacity,
        })?;
        let range = self.range(slot);
        self.data[range].fill(0);
        Ok(slot)
    }

    pub fn free(&mut self, slot: u32) -> bool {
        slot < self.capacity && self.free.insert(slot)
    }

    pub fn is_allocated(&self, slot: u32) -> bool {
        slot < self.capacity && !self.free.contains(&slot)
    }

    fn range(&self, slot: u32) -> std::ops::Range<usize> {
        let start = slot as usize * self.block_size;
        start..start + self.block_size
    }

    pub fn block(&self, slot: u32) -> Option<&[u8]> {
        self.data.get(self.range(slot))
    }

    pub fn block_mut(&mut self, slot: u32) -> Option<&mut [u8]> {
        let range = self.range(slot);
        self.data.get_mut(range)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn load_bytes(&mut self, bytes: &[u8]) {
        if bytes.len() == self.data.len() {
            self.data.copy_from_slice(bytes);
        } else {
            self.data.clear();
            self.data.extend_from_slice(bytes);
        }
    }

    pub(crate) fn rebuild_free(&mut self, used: impl IntoIterator<Item = u32>) {
        self.free = (0..self.capacity).collect();
        for slot in used {
            self.free.remove(&slot);
        }
    }

    pub(crate) fn claim(&mut self, slot: u32) -> bool {
        self.free.remove(&slot)
    }
}
