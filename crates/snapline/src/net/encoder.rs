use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::buffer::NetBuffer;
use crate::snapshot::{Snapshot, WorldHistory};
use crate::world::{ClientId, NetworkId, ObjectMeta, World};

use super::priority::{Candidate, PriorityPolicy, schedule};
use super::protocol::{
    ENTITY_HEADER_SIZE, Fragment, MAX_PAYLOAD_SIZE, PAYLOAD_HEADER_SIZE, REMOVAL_SIZE,
};

/// Wire value for "no input authority".
pub(crate) const NO_AUTHORITY: u32 = u32::MAX;
/// Wire value for "no acknowledged baseline".
pub(crate) const NO_BASELINE: u32 = u32::MAX;
/// Unacknowledged ticks remembered per receiver.
const MAX_IN_FLIGHT: usize = 256;
/// Removals carried by one payload; the rest wait for a later tick.
const MAX_REMOVALS: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, Default)]
struct EntityStatus {
    acked_tick: Option<u32>,
    last_sent_tick: Option<u32>,
}

#[derive(Debug, Clone, Default)]
struct InFlight {
    updated: Vec<NetworkId>,
    removed: Vec<NetworkId>,
}

/// What one call to [`ReplicationSender::build`] put on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedTick {
    pub tick: u32,
    pub payload: Vec<u8>,
    pub sent: Vec<NetworkId>,
    pub removed: Vec<NetworkId>,
    /// Changed entities left for a later tick by budget or cooldown.
    pub deferred: usize,
}

/// Per-receiver delta encoder.
///
/// Each tick it sends the entities whose state differs from what the
/// receiver last acknowledged, plus removals the receiver has not yet
/// confirmed, in priority order until `max_bytes_per_tick` is used up.
/// Entities sent but not yet acknowledged stay candidates so a lost tick
/// is repaired by the next one.
#[derive(Debug)]
pub struct ReplicationSender {
    receiver: ClientId,
    max_bytes_per_tick: usize,
    entities: HashMap<NetworkId, EntityStatus>,
    /// Ids the receiver may hold: sent at least once, removal unconfirmed.
    known: BTreeSet<NetworkId>,
    in_flight: BTreeMap<u32, InFlight>,
    acked_tick: Option<u32>,
}

impl ReplicationSender {
    pub fn new(receiver: ClientId, max_bytes_per_tick: usize) -> Self {
        Self {
            receiver,
            max_bytes_per_tick: max_bytes_per_tick.max(PAYLOAD_HEADER_SIZE + 1),
            entities: HashMap::new(),
            known: BTreeSet::new(),
            in_flight: BTreeMap::new(),
            acked_tick: None,
        }
    }

    pub fn receiver(&self) -> ClientId {
        self.receiver
    }

    /// Newest tick the receiver confirmed applying.
    pub fn acked_tick(&self) -> Option<u32> {
        self.acked_tick
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn differs(meta: &ObjectMeta, block: &[u8], baseline: Option<&Snapshot>, world: &World) -> bool {
        let Some(baseline) = baseline else {
            return true;
        };
        match baseline.world_object_meta(meta.id.index()) {
            Some(old) if old.holds(meta.id) => {
                old.input_authority != meta.input_authority
                    || baseline.block(world.registry(), meta.id) != Some(block)
            }
            _ => true,
        }
    }

    fn candidates(
        &self,
        tick: u32,
        world: &World,
        history: &WorldHistory,
        policy: &dyn PriorityPolicy,
    ) -> Vec<Candidate> {
        let registry = world.registry();
        let mut candidates = Vec::new();
        for meta in world.iter() {
            let status = self.entities.get(&meta.id).copied().unwrap_or_default();
            let unconfirmed = match (status.last_sent_tick, status.acked_tick) {
                (Some(sent), Some(acked)) => sent > acked,
                (Some(_), None) => true,
                (None, _) => false,
            };
            let Some(block) = world.block(meta.id) else {
                continue;
            };
            let baseline = status
                .acked_tick
                .and_then(|acked| history.by_tick(acked).ok());
            if !unconfirmed && !Self::differs(meta, block, baseline, world) {
                continue;
            }
            let Some(registered) = registry.get(meta.type_id) else {
                continue;
            };
            candidates.push(Candidate {
                id: meta.id,
                type_id: meta.type_id,
                priority: policy.priority(
                    world,
                    self.receiver,
                    meta.id,
                    registered.config.priority,
                ),
                ticks_waiting: status
                    .last_sent_tick
                    .map_or(u32::MAX, |sent| tick.saturating_sub(sent)),
                cooldown_ticks: registered.config.cooldown_ticks,
                cooldown_exempt: registered.config.cooldown_exempt,
            });
        }
        candidates
    }

    /// Encodes this receiver's payload for `tick` from the live `world`.
    ///
    /// Removals go out ahead of entities and are not charged to the budget,
    /// up to `u16::MAX` per payload. Entities are packed greedily: one that
    /// does not fit the remaining budget is skipped in favour of smaller ones
    /// behind it, except that the first entity is always taken so an
    /// oversized block cannot starve forever. Nothing is ever packed past
    /// [`MAX_PAYLOAD_SIZE`], which the receiver refuses.
    pub fn build(
        &mut self,
        tick: u32,
        world: &World,
        history: &WorldHistory,
        policy: &mut dyn PriorityPolicy,
    ) -> EncodedTick {
        policy.prepare(world, self.receiver);
        let removed: Vec<NetworkId> = self
            .known
            .iter()
            .copied()
            .filter(|id| !world.contains(*id))
            .take(MAX_REMOVALS)
            .collect();

        let mut candidates = self.candidates(tick, world, history, &*policy);
        let changed = candidates.len();
        schedule(&mut candidates);

        let mut used = PAYLOAD_HEADER_SIZE + removed.len() * REMOVAL_SIZE;
        let mut sent = Vec::new();
        for candidate in &candidates {
            let Some(block) = world.block(candidate.id) else {
                continue;
            };
            let size = ENTITY_HEADER_SIZE + block.len();
            if used + size > MAX_PAYLOAD_SIZE {
                continue;
            }
            if !sent.is_empty() && used + size > self.max_bytes_per_tick {
                continue;
            }
            used += size;
            sent.push(candidate.id);
        }

        let mut buffer = NetBuffer::with_capacity(used);
        buffer.add_u32(tick);
        buffer.add_u32(self.acked_tick.unwrap_or(NO_BASELINE));
        buffer.add_u16(sent.len() as u16);
        buffer.add_u16(removed.len() as u16);
        for id in &removed {
            buffer.add_u64(id.to_raw());
        }
        for id in &sent {
            let (Some(meta), Some(block)) = (world.meta(*id), world.block(*id)) else {
                continue;
            };
            buffer.add_u64(id.to_raw());
            buffer.add_u16(meta.type_id.0);
            buffer.add_u32(meta.input_authority.map_or(NO_AUTHORITY, |c| c.0));
            buffer.add_u16(block.len() as u16);
            buffer.add_bytes(block);
        }

        for id in &sent {
            self.entities.entry(*id).or_default().last_sent_tick = Some(tick);
            self.known.insert(*id);
        }
        self.in_flight.insert(
            tick,
            InFlight {
                updated: sent.clone(),
                removed: removed.clone(),
            },
        );
        while self.in_flight.len() > MAX_IN_FLIGHT {
            self.in_flight.pop_first();
        }

        log::trace!(
            "{} tick {}: {} entities, {} removals, {} bytes",
            self.receiver,
            tick,
            sent.len(),
            removed.len(),
            buffer.len()
        );
        EncodedTick {
            tick,
            deferred: changed.saturating_sub(sent.len()),
            payload: buffer.into_vec(),
            sent,
            removed,
        }
    }

    /// The receiver applied `tick` in full: everything that tick carried
    /// becomes the new per-entity baseline.
    pub fn acknowledge(&mut self, tick: u32) {
        if self.acked_tick.is_some_and(|acked| tick <= acked) {
            return;
        }
        let Some(carried) = self.in_flight.remove(&tick) else {
            return;
        };
        self.acked_tick = Some(tick);
        for id in carried.updated {
            let status = self.entities.entry(id).or_default();
            if status.acked_tick.is_none_or(|acked| acked < tick) {
                status.acked_tick = Some(tick);
            }
        }
        for id in carried.removed {
            self.known.remove(&id);
            self.entities.remove(&id);
        }
        self.in_flight = self.in_flight.split_off(&tick.saturating_add(1));
    }

    /// Forgets everything the receiver was believed to hold, so the next
    /// tick resends the world from scratch.
    pub fn reset(&mut self) {
        self.entities.clear();
        self.known.clear();
        self.in_flight.clear();
        self.acked_tick = None;
    }
}

/// Splits `payload` into fragments of at most `fragment_size` bytes.
///
/// Validated configs keep `payload.len() / fragment_size` within the `u16`
/// fragment count.
pub fn fragment(tick: u32, payload: &[u8], fragment_size: usize) -> Vec<Fragment> {
    let size = fragment_size.max(1);
    let count = payload.len().div_ceil(size).max(1);
    debug_assert!(count <= u16::MAX as usize, "{} fragments", count);
    let total_len = payload.len() as u32;
    (0..count)
        .map(|index| {
            let start = index * size;
            let end = (start + size).min(payload.len());
            Fragment {
                tick,
                total_len,
                offset: start as u32,
                index: index as u16,
                count: count as u16,
                bytes: payload[start..end].to_vec(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::config::TypeConfig;
    use crate::net::priority::DeclaredPriority;
    use crate::state::TypeRegistry;

    crate::networked! {
        struct Crate {
            position: Vec3,
            weight: f32,
        }
    }

    fn setup(capacity: u32) -> (World, WorldHistory, Crate) {
        let registry = TypeRegistry::builder()
            .register::<Crate>(TypeConfig::with_capacity(capacity))
            .unwrap()
            .build();
        let handle = registry.bind::<Crate>().unwrap();
        (World::new(registry), WorldHistory::new(16), handle)
    }

    #[test]
    fn thousand_bytes_split_into_four() {
        let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let fragments = fragment(3, &payload, 300);
        assert_eq!(fragments.len(), 4);
        assert_eq!(fragments[3].bytes.len(), 100);
        assert!(fragments.iter().all(|f| f.count == 4 && f.total_len == 1000));
        let joined: Vec<u8> = fragments.iter().flat_map(|f| f.bytes.clone()).collect();
        assert_eq!(joined, payload);
    }

    #[test]
    fn unchanged_entities_stop_once_acknowledged() {
        let (mut world, mut history, _) = setup(4);
        let id = world.spawn_as::<Crate>(None).unwrap();
        let mut sender = ReplicationSender::new(ClientId(1), 4096);

        history.capture(1, &world);
        let first = sender.build(1, &world, &history, &mut DeclaredPriority);
        assert_eq!(first.sent, vec![id]);

        history.capture(2, &world);
        let resent = sender.build(2, &world, &history, &mut DeclaredPriority);
        assert_eq!(resent.sent, vec![id]);

        sender.acknowledge(2);
        assert_eq!(sender.in_flight(), 0);
        history.capture(3, &world);
        let quiet = sender.build(3, &world, &history, &mut DeclaredPriority);
        assert!(quiet.sent.is_empty());
        assert_eq!(quiet.payload.len(), PAYLOAD_HEADER_SIZE);
    }

    #[test]
    fn changes_after_ack_are_resent() {
        let (mut world, mut history, handle) = setup(4);
        let id = world.spawn_as::<Crate>(None).unwrap();
        let mut sender = ReplicationSender::new(ClientId(1), 4096);
        history.capture(1, &world);
        sender.build(1, &world, &history, &mut DeclaredPriority);
        sender.acknowledge(1);

        world.view_mut(id).unwrap().set(handle.weight, 2.0);
        history.capture(2, &world);
        assert_eq!(sender.build(2, &world, &history, &mut DeclaredPriority).sent, vec![id]);
    }

    #[test]
    fn removals_repeat_until_acknowledged() {
        let (mut world, mut history, _) = setup(4);
        let id = world.spawn_as::<Crate>(None).unwrap();
        let mut sender = ReplicationSender::new(ClientId(1), 4096);
        history.capture(1, &world);
        sender.build(1, &world, &history, &mut DeclaredPriority);
        sender.acknowledge(1);

        world.despawn(id);
        history.capture(2, &world);
        assert_eq!(sender.build(2, &world, &history, &mut DeclaredPriority).removed, vec![id]);
        history.capture(3, &world);
        assert_eq!(sender.build(3, &world, &history, &mut DeclaredPriority).removed, vec![id]);

        sender.acknowledge(3);
        history.capture(4, &world);
        assert!(sender.build(4, &world, &history, &mut DeclaredPriority).removed.is_empty());
    }

    #[test]
    fn budget_defers_lower_priority_but_takes_the_first() {
        let (mut world, mut history, _) = setup(4);
        for _ in 0..3 {
            world.spawn_as::<Crate>(None).unwrap();
        }
        history.capture(1, &world);
        let per_entity = ENTITY_HEADER_SIZE + 16;

        let mut sender = ReplicationSender::new(ClientId(1), PAYLOAD_HEADER_SIZE + 2 * per_entity);
        let tick = sender.build(1, &world, &history, &mut DeclaredPriority);
        assert_eq!(tick.sent.len(), 2);
        assert_eq!(tick.deferred, 1);

        let mut tiny = ReplicationSender::new(ClientId(2), PAYLOAD_HEADER_SIZE + 1);
        let tick = tiny.build(1, &world, &history, &mut DeclaredPriority);
        assert_eq!(tick.sent.len(), 1);
    }

    #[test]
    fn removals_ride_along_without_eating_the_budget() {
        let (mut world, mut history, _) = setup(8);
        let doomed: Vec<_> = (0..4).map(|_| world.spawn_as::<Crate>(None).unwrap()).collect();
        let per_entity = ENTITY_HEADER_SIZE + 16;
        let mut sender = ReplicationSender::new(ClientId(1), PAYLOAD_HEADER_SIZE + per_entity);
        for tick in 1..=4 {
            history.capture(tick, &world);
            sender.build(tick, &world, &history, &mut DeclaredPriority);
            sender.acknowledge(tick);
        }

        for id in &doomed {
            world.despawn(*id);
        }
        let fresh = world.spawn_as::<Crate>(None).unwrap();
        history.capture(5, &world);
        let tick = sender.build(5, &world, &history, &mut DeclaredPriority);
        assert_eq!(tick.removed.len(), 4);
        assert_eq!(tick.sent, vec![fresh]);
        assert_eq!(
            tick.payload.len(),
            PAYLOAD_HEADER_SIZE + 4 * REMOVAL_SIZE + per_entity
        );
    }
}
