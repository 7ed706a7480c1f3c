use std::collections::HashMap;

use glam::Vec3;

use crate::state::Field;
use crate::world::{NetworkId, World};

use super::RollbackObserver;

const ERROR_CORRECTION_SPEED: f32 = 20.0;
const ERROR_THRESHOLD: f32 = 0.0001;
const SNAP_THRESHOLD: f32 = 1.0;

/// Hides rollback corrections by carrying the difference between where an
/// entity was drawn and where resimulation put it, then decaying it.
#[derive(Debug, Clone)]
pub struct VisualSmoother {
    position: Field<Vec3>,
    before: HashMap<NetworkId, Vec3>,
    errors: HashMap<NetworkId, Vec3>,
    snap_threshold: f32,
}

impl VisualSmoother {
    pub fn new(position: Field<Vec3>) -> Self {
        Self {
            position,
            before: HashMap::new(),
            errors: HashMap::new(),
            snap_threshold: SNAP_THRESHOLD,
        }
    }

    pub fn with_snap_threshold(mut self, threshold: f32) -> Self {
        self.snap_threshold = threshold;
        self
    }

    /// Exponential decay of every outstanding error.
    pub fn update(&mut self, dt: f32) {
        let decay = (-ERROR_CORRECTION_SPEED * dt).exp();
        self.errors.retain(|_, error| {
            *error *= decay;
            error.length_squared() > ERROR_THRESHOLD * ERROR_THRESHOLD
        });
    }

    pub fn offset(&self, id: NetworkId) -> Vec3 {
        self.errors.get(&id).copied().unwrap_or(Vec3::ZERO)
    }

    pub fn visual_position(&self, world: &World, id: NetworkId) -> Option<Vec3> {
        let position = world.view(id)?.try_get(self.position).ok()?;
        Some(position + self.offset(id))
    }

    pub fn clear(&mut self) {
        self.before.clear();
        self.errors.clear();
    }

    fn position_of(&self, world: &World, id: NetworkId) -> Option<Vec3> {
        world.view(id)?.try_get(self.position).ok()
    }
}

impl RollbackObserver for VisualSmoother {
    fn on_pre_rollback(&mut self, world: &World, _tick: u32) {
        self.before.clear();
        for id in world.ids() {
            if let Some(position) = self.position_of(world, id) {
                self.before.insert(id, position + self.offset(id));
            }
        }
    }

    fn on_post_resimulation(&mut self, world: &World, _tick: u32) {
        let before = std::mem::take(&mut self.before);
        self.errors.retain(|id, _| world.contains(*id));
        for (id, drawn) in before {
            let Some(corrected) = self.position_of(world, id) else {
                continue;
            };
            let error = drawn - corrected;
            if error.length() > self.snap_threshold || error.length() < ERROR_THRESHOLD {
                self.errors.remove(&id);
            } else {
                self.errors.insert(id, error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TypeConfig;
    use crate::state::TypeRegistry;

    crate::networked! {
        struct Puck {
            position: Vec3,
        }
    }

    fn setup() -> (World, Puck, NetworkId) {
        let registry = TypeRegistry::builder()
            .register::<Puck>(TypeConfig::with_capacity(2))
            .unwrap()
            .build();
        let puck = registry.bind::<Puck>().unwrap();
        let mut world = World::new(registry);
        let id = world.spawn_as::<Puck>(None).unwrap();
        (world, puck, id)
    }

    #[test]
    fn correction_keeps_visual_continuous_then_decays() {
        let (mut world, puck, id) = setup();
        let mut smoother = VisualSmoother::new(puck.position);

        world.view_mut(id).unwrap().set(puck.position, Vec3::new(1.0, 0.0, 0.0));
        smoother.on_pre_rollback(&world, 10);
        world.view_mut(id).unwrap().set(puck.position, Vec3::new(1.5, 0.0, 0.0));
        smoother.on_post_resimulation(&world, 12);

        let drawn = smoother.visual_position(&world, id).unwrap();
        assert!((drawn.x - 1.0).abs() < 1e-5);

        smoother.update(0.1);
        let later = smoother.visual_position(&world, id).unwrap();
        assert!(later.x > 1.4 && later.x < 1.5);
    }

    #[test]
    fn large_corrections_snap() {
        let (mut world, puck, id) = setup();
        let mut smoother = VisualSmoother::new(puck.position);

        smoother.on_pre_rollback(&world, 1);
        world.view_mut(id).unwrap().set(puck.position, Vec3::new(5.0, 0.0, 0.0));
        smoother.on_post_resimulation(&world, 2);

        assert_eq!(smoother.offset(id), Vec3::ZERO);
    }
}
