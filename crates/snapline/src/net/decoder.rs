use std::collections::BTreeMap;

use crate::buffer::NetBuffer;
use crate::error::ProtocolError;
use crate::state::{TypeId, TypeRegistry};
use crate::world::{ClientId, NetworkId, World};

use super::encoder::{NO_AUTHORITY, NO_BASELINE};
use super::protocol::{Fragment, MAX_PAYLOAD_SIZE};

/// Partial ticks kept waiting for their missing fragments.
const DEFAULT_MAX_PENDING: usize = 8;

#[derive(Debug)]
struct Pending {
    total_len: usize,
    count: u16,
    received: Vec<bool>,
    remaining: u16,
    buffer: NetBuffer,
}

/// Reassembles fragments into whole ticks.
///
/// A tick is handed out only once every one of its fragments arrived.
/// Completing a tick discards every older partial tick, so a tick that
/// lost a fragment is never applied at all.
#[derive(Debug)]
pub struct FragmentAssembler {
    pending: BTreeMap<u32, Pending>,
    last_applied: Option<u32>,
    max_pending: usize,
    discarded: u64,
}

impl Default for FragmentAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::with_max_pending(DEFAULT_MAX_PENDING)
    }

    pub fn with_max_pending(max_pending: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            last_applied: None,
            max_pending: max_pending.max(1),
            discarded: 0,
        }
    }

    /// Newest tick applied in full; what the receiver acknowledges.
    pub fn last_applied_tick(&self) -> Option<u32> {
        self.last_applied
    }

    pub fn mark_applied(&mut self, tick: u32) {
        if self.last_applied.is_none_or(|last| tick > last) {
            self.last_applied = Some(tick);
        }
        self.pending = self.pending.split_off(&tick.saturating_add(1));
    }

    pub fn pending_ticks(&self) -> usize {
        self.pending.len()
    }

    /// Ticks dropped incomplete so far.
    pub fn discarded_ticks(&self) -> u64 {
        self.discarded
    }

    fn check_shape(fragment: &Fragment) -> Result<(), ProtocolError> {
        let offset = fragment.offset as usize;
        let end = offset + fragment.bytes.len();
        let total = fragment.total_len as usize;
        if fragment.count == 0
            || fragment.index >= fragment.count
            || end > total
            || total > MAX_PAYLOAD_SIZE
            || (fragment.bytes.is_empty() && total > 0)
        {
            return Err(ProtocolError::FragmentOutOfRange {
                tick: fragment.tick,
                index: fragment.index,
                count: fragment.count,
                offset,
                end,
                total,
            });
        }
        Ok(())
    }

    /// Files one fragment. Returns the reassembled payload when this
    /// fragment completed its tick.
    pub fn insert(&mut self, fragment: Fragment) -> Result<Option<(u32, NetBuffer)>, ProtocolError> {
        let tick = fragment.tick;
        if self.last_applied.is_some_and(|last| tick <= last) {
            return Ok(None);
        }
        Self::check_shape(&fragment)?;

        let total_len = fragment.total_len as usize;
        if !self.pending.contains_key(&tick) && self.pending.len() >= self.max_pending {
            if let Some((oldest, _)) = self.pending.pop_first() {
                self.discarded += 1;
                log::debug!("dropped incomplete tick {} to make room for {}", oldest, tick);
            }
        }
        let pending = self.pending.entry(tick).or_insert_with(|| Pending {
            total_len,
            count: fragment.count,
            received: vec![false; fragment.count as usize],
            remaining: fragment.count,
            buffer: NetBuffer::zeroed(total_len),
        });
        if pending.total_len != total_len || pending.count != fragment.count {
            return Err(ProtocolError::FragmentMismatch { tick });
        }
        let index = fragment.index as usize;
        if pending.received[index] {
            return Ok(None);
        }

        let mut source = NetBuffer::from_bytes(&fragment.bytes);
        source.copy_to(&mut pending.buffer, fragment.offset as usize, fragment.bytes.len())?;
        pending.received[index] = true;
        pending.remaining -= 1;
        if pending.remaining > 0 {
            return Ok(None);
        }

        let Some(complete) = self.pending.remove(&tick) else {
            return Ok(None);
        };
        let newer = self.pending.split_off(&tick);
        for stale in self.pending.keys() {
            log::debug!("discarding incomplete tick {} superseded by {}", stale, tick);
        }
        self.discarded += self.pending.len() as u64;
        self.pending = newer;
        Ok(Some((tick, complete.buffer)))
    }

    /// Forgets all state, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.last_applied = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub id: NetworkId,
    pub type_id: TypeId,
    pub authority: Option<ClientId>,
    pub block: Vec<u8>,
}

/// A fully validated tick payload, ready to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTick {
    pub tick: u32,
    /// Tick the sender assumed the receiver already held.
    pub baseline: Option<u32>,
    pub removals: Vec<NetworkId>,
    pub entities: Vec<EntityRecord>,
}

fn read_id(buffer: &mut NetBuffer, capacity: usize) -> Result<NetworkId, ProtocolError> {
    let raw = buffer.get_u64()?;
    let id = NetworkId::from_raw(raw).ok_or(ProtocolError::InvalidNetworkId(raw))?;
    if id.index() as usize >= capacity {
        return Err(ProtocolError::EntityIndexOutOfRange {
            index: id.index(),
            capacity,
        });
    }
    Ok(id)
}

impl DecodedTick {
    /// Parses and checks a whole payload without touching any world.
    ///
    /// `meta_capacity` is the receiver's meta table size; every id, type
    /// and block size is checked against it and `registry`.
    pub fn decode(
        tick: u32,
        payload: &mut NetBuffer,
        registry: &TypeRegistry,
        meta_capacity: usize,
    ) -> Result<Self, ProtocolError> {
        payload.reset_read();
        let announced = payload.get_u32()?;
        if announced != tick {
            return Err(ProtocolError::TickMismatch { tick, announced });
        }
        let baseline = match payload.get_u32()? {
            NO_BASELINE => None,
            baseline => Some(baseline),
        };
        let entity_count = payload.get_u16()? as usize;
        let removal_count = payload.get_u16()? as usize;

        let removals = (0..removal_count)
            .map(|_| read_id(payload, meta_capacity))
            .collect::<Result<Vec<_>, _>>()?;

        let mut entities = Vec::with_capacity(entity_count);
        for _ in 0..entity_count {
            let id = read_id(payload, meta_capacity)?;
            let type_id = TypeId(payload.get_u16()?);
            let authority = match payload.get_u32()? {
                NO_AUTHORITY => None,
                client => Some(ClientId(client)),
            };
            let len = payload.get_u16()? as usize;
            let table = registry
                .table(type_id)
                .ok_or(ProtocolError::UnknownTypeId(type_id.0))?;
            if len != table.block_size() {
                return Err(ProtocolError::BlockSizeMismatch {
                    type_id: type_id.0,
                    got: len,
                    expected: table.block_size(),
                });
            }
            let block = payload.get_bytes(len)?.to_vec();
            entities.push(EntityRecord {
                id,
                type_id,
                authority,
                block,
            });
        }

        if payload.remaining() > 0 {
            return Err(ProtocolError::TrailingBytes(payload.remaining()));
        }
        Ok(Self {
            tick,
            baseline,
            removals,
            entities,
        })
    }

    /// Applies removals, then updates. All or nothing: on error `world` is
    /// left exactly as it was.
    pub fn apply(&self, world: &mut World) -> Result<(), ProtocolError> {
        let mut staged = world.clone();
        for id in &self.removals {
            staged.remove_exact(*id);
        }
        for record in &self.entities {
            staged.place(record.id, record.type_id, record.authority, &record.block)?;
        }
        *world = staged;
        Ok(())
    }
}
