//! Which entities go out first when a tick's budget cannot carry them all.

use std::cmp::Reverse;

use glam::Vec3;

use crate::state::{Field, TypeId, TypeRegistry};
use crate::world::{ClientId, NetworkId, World};

/// An entity competing for space in one receiver's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub id: NetworkId,
    pub type_id: TypeId,
    /// Declared priority, or the policy's override.
    pub priority: i32,
    /// Ticks since this entity was last sent to the receiver; `u32::MAX`
    /// when it never was.
    pub ticks_waiting: u32,
    pub cooldown_ticks: u32,
    pub cooldown_exempt: bool,
}

impl Candidate {
    /// Cooldown-exempt entities are always eligible; the rest only once
    /// their cooldown has run out.
    pub fn is_eligible(&self) -> bool {
        self.cooldown_exempt || self.ticks_waiting >= self.cooldown_ticks
    }
}

/// Drops candidates still in cooldown and orders the rest: highest
/// priority first, then whoever has waited longest, then by id so equal
/// candidates always come out the same way.
pub fn schedule(candidates: &mut Vec<Candidate>) {
    candidates.retain(Candidate::is_eligible);
    candidates.sort_by_key(|c| (Reverse(c.priority), Reverse(c.ticks_waiting), c.id));
}

/// Per-receiver relevance hook layered over declared priorities.
pub trait PriorityPolicy {
    /// Called once per receiver per tick before any `priority` query.
    fn prepare(&mut self, _world: &World, _receiver: ClientId) {}

    fn priority(&self, world: &World, receiver: ClientId, id: NetworkId, declared: i32) -> i32;
}

/// Leaves declared priorities untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclaredPriority;

impl PriorityPolicy for DeclaredPriority {
    fn priority(&self, _world: &World, _receiver: ClientId, _id: NetworkId, declared: i32) -> i32 {
        declared
    }
}

/// Boosts entities near whatever the receiver controls.
///
/// The receiver's focus is the position of the first entity it holds input
/// authority over. Within `radius` of it an entity gains up to `bonus`,
/// falling off linearly with distance. Types without the position field,
/// and receivers controlling nothing, keep their declared priority.
#[derive(Debug, Clone)]
pub struct DistancePriority {
    fields: Vec<Option<Field<Vec3>>>,
    radius: f32,
    bonus: i32,
    focus: Option<Vec3>,
}

impl DistancePriority {
    pub fn new(registry: &TypeRegistry, position: &str, radius: f32, bonus: i32) -> Self {
        Self {
            fields: registry
                .iter()
                .map(|t| t.table.try_field::<Vec3>(position))
                .collect(),
            radius: radius.max(f32::EPSILON),
            bonus,
            focus: None,
        }
    }

    fn position(&self, world: &World, id: NetworkId) -> Option<Vec3> {
        let meta = world.meta(id)?;
        let field = self.fields.get(meta.type_id.index()).copied().flatten()?;
        world.view(id)?.try_get(field).ok()
    }
}

impl PriorityPolicy for DistancePriority {
    fn prepare(&mut self, world: &World, receiver: ClientId) {
        self.focus = world
            .find_by_authority(receiver)
            .into_iter()
            .find_map(|id| self.position(world, id));
    }

    fn priority(&self, world: &World, _receiver: ClientId, id: NetworkId, declared: i32) -> i32 {
        let (Some(focus), Some(position)) = (self.focus, self.position(world, id)) else {
            return declared;
        };
        let closeness = 1.0 - (position.distance(focus) / self.radius).min(1.0);
        declared.saturating_add((self.bonus as f32 * closeness).round() as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TypeConfig;

    fn candidate(index: u32, priority: i32, ticks_waiting: u32) -> Candidate {
        Candidate {
            id: NetworkId::new(index, 1),
            type_id: TypeId(0),
            priority,
            ticks_waiting,
            cooldown_ticks: 0,
            cooldown_exempt: false,
        }
    }

    #[test]
    fn longer_wait_wins_at_equal_priority() {
        let a = candidate(0, 10, 5);
        let b = candidate(1, 10, 1);
        let mut order = vec![b, a];
        schedule(&mut order);
        assert_eq!(order, vec![a, b]);
    }

    #[test]
    fn higher_priority_always_first() {
        let a = candidate(0, 10, 5);
        let c = candidate(2, 11, 0);
        let never_sent = candidate(3, 10, u32::MAX);
        let mut order = vec![a, never_sent, c];
        schedule(&mut order);
        assert_eq!(order, vec![c, never_sent, a]);
    }

    #[test]
    fn cooldown_filters_unless_exempt() {
        let mut cooling = candidate(0, 50, 2);
        cooling.cooldown_ticks = 4;
        let mut exempt = cooling;
        exempt.id = NetworkId::new(1, 1);
        exempt.cooldown_exempt = true;
        let ready = candidate(2, 0, 9);

        let mut order = vec![cooling, exempt, ready];
        schedule(&mut order);
        assert_eq!(order, vec![exempt, ready]);
    }

    crate::networked! {
        struct Beacon {
            position: Vec3,
        }
    }

    #[test]
    fn distance_policy_favours_nearby_entities() {
        let registry = TypeRegistry::builder()
            .register::<Beacon>(TypeConfig::with_capacity(4))
            .unwrap()
            .build();
        let beacon = registry.bind::<Beacon>().unwrap();
        let mut world = World::new(registry.clone());
        let mine = world.spawn_as::<Beacon>(Some(ClientId(1))).unwrap();
        let near = world.spawn_as::<Beacon>(None).unwrap();
        let far = world.spawn_as::<Beacon>(None).unwrap();
        world.view_mut(near).unwrap().set(beacon.position, Vec3::new(2.5, 0.0, 0.0));
        world.view_mut(far).unwrap().set(beacon.position, Vec3::new(50.0, 0.0, 0.0));

        let mut policy = DistancePriority::new(&registry, "position", 10.0, 20);
        policy.prepare(&world, ClientId(1));
        assert_eq!(policy.priority(&world, ClientId(1), mine, 0), 20);
        assert_eq!(policy.priority(&world, ClientId(1), near, 0), 15);
        assert_eq!(policy.priority(&world, ClientId(1), far, 3), 3);

        policy.prepare(&world, ClientId(9));
        assert_eq!(policy.priority(&world, ClientId(9), near, 3), 3);
    }
}
