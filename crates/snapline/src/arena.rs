//! A small shooter used by the demo, the server binary and the session
//! tests: avatars walk on the XZ plane and fire lag-compensated hitscan.

use std::sync::Arc;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::config::TypeConfig;
use crate::error::ConfigError;
use crate::lagcomp::{HitScene, LagCompensator, Shot, SphereScene, Transform};
use crate::simulation::{Buttons, HitContext, Simulation, SimulationInput, TickContext};
use crate::state::{Networked, TypeId, TypeRegistry};
use crate::world::{ClientId, NetworkId, World};

crate::networked! {
    /// One player-controlled body. `cooldown` counts down to the next shot
    /// while alive and to the respawn while dead.
    pub struct Avatar {
        position: Vec3,
        velocity: Vec3,
        rotation: Quat,
        health: i32,
        alive: bool,
        cooldown: i32,
    }
}

pub const MAX_HEALTH: i32 = 100;
const SPAWN_COLUMNS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaSettings {
    pub move_speed: f32,
    pub acceleration: f32,

    pub fire_range: f32,
    pub damage: i32,
    pub fire_cooldown_ticks: i32,
    pub respawn_ticks: i32,

    pub avatar_radius: f32,
    pub spawn_spacing: f32,
}

impl Default for ArenaSettings {
    fn default() -> Self {
        Self {
            move_speed: 6.0,
            acceleration: 12.0,

            fire_range: 100.0,
            damage: 25,
            fire_cooldown_ticks: 10,
            respawn_ticks: 120,

            avatar_radius: 0.5,
            spawn_spacing: 4.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitReport {
    pub tick: u32,
    pub shooter: NetworkId,
    pub target: NetworkId,
    pub distance: f32,
    pub killed: bool,
}

pub struct Arena {
    avatar: Avatar,
    avatar_type: TypeId,
    settings: ArenaSettings,
    compensator: LagCompensator,
    scene: SphereScene,
    hits: Vec<HitReport>,
}

impl Arena {
    /// Registry holding the single `Avatar` type with room for `capacity`.
    pub fn registry(capacity: u32) -> Result<Arc<TypeRegistry>, ConfigError> {
        Ok(TypeRegistry::builder()
            .register::<Avatar>(TypeConfig::with_capacity(capacity).priority(10))?
            .build())
    }

    pub fn new(registry: &TypeRegistry, settings: ArenaSettings) -> Result<Self, ConfigError> {
        let avatar = registry.bind::<Avatar>()?;
        let avatar_type = registry
            .id_of(Avatar::TYPE_NAME)
            .ok_or_else(|| ConfigError::UnknownType(Avatar::TYPE_NAME.to_string()))?;
        Ok(Self {
            avatar,
            avatar_type,
            settings,
            compensator: LagCompensator::new(registry, "position", "rotation"),
            // A second of running is as far as a target can drift from
            // where the shooter saw it.
            scene: SphereScene::new(settings.move_speed),
            hits: Vec::new(),
        })
    }

    pub fn avatar(&self) -> Avatar {
        self.avatar
    }

    pub fn settings(&self) -> &ArenaSettings {
        &self.settings
    }

    pub fn hits(&self) -> &[HitReport] {
        &self.hits
    }

    pub fn take_hits(&mut self) -> Vec<HitReport> {
        std::mem::take(&mut self.hits)
    }

    /// Spawn positions form a grid keyed by meta index, so every peer
    /// places the same entity in the same spot.
    pub fn spawn_point(&self, id: NetworkId) -> Vec3 {
        let column = id.index() % SPAWN_COLUMNS;
        let row = id.index() / SPAWN_COLUMNS;
        Vec3::new(column as f32, 0.0, row as f32) * self.settings.spawn_spacing
    }

    pub fn spawn_avatar(&self, world: &mut World, client: ClientId) -> Result<NetworkId, ConfigError> {
        let id = world.spawn_as::<Avatar>(Some(client))?;
        let spawn = self.spawn_point(id);
        if let Some(mut view) = world.view_mut(id) {
            let a = self.avatar;
            view.set(a.position, spawn);
            view.set(a.velocity, Vec3::ZERO);
            view.set(a.rotation, Quat::IDENTITY);
            view.set(a.health, MAX_HEALTH);
            view.set(a.alive, true);
            view.set(a.cooldown, 0);
        }
        Ok(id)
    }

    fn respawn(&self, world: &mut World, id: NetworkId) {
        let spawn = self.spawn_point(id);
        if let Some(mut view) = world.view_mut(id) {
            let a = self.avatar;
            view.set(a.position, spawn);
            view.set(a.velocity, Vec3::ZERO);
            view.set(a.health, MAX_HEALTH);
            view.set(a.alive, true);
            view.set(a.cooldown, 0);
        }
        log::debug!("{} respawned", id);
    }

    fn live_transforms(&self, world: &World) -> Vec<(NetworkId, Transform)> {
        let a = self.avatar;
        world
            .ids_of(self.avatar_type)
            .into_iter()
            .filter_map(|id| {
                let view = world.view(id)?;
                view.get(a.alive).then(|| {
                    (
                        id,
                        Transform {
                            position: view.get(a.position),
                            rotation: view.get(a.rotation),
                        },
                    )
                })
            })
            .collect()
    }

    fn can_fire(&self, world: &World, id: NetworkId) -> Option<Vec3> {
        let view = world.view(id)?;
        let a = self.avatar;
        (view.get(a.alive) && view.get(a.cooldown) <= 0).then(|| view.get(a.position))
    }

    fn damage(&mut self, world: &mut World, tick: u32, shooter: NetworkId, target: NetworkId, distance: f32) {
        let a = self.avatar;
        let Some(mut view) = world.view_mut(target) else {
            return;
        };
        if !view.get(a.alive) {
            return;
        }
        let health = view.get(a.health) - self.settings.damage;
        let killed = health <= 0;
        if killed {
            view.set(a.health, 0);
            view.set(a.alive, false);
            view.set(a.velocity, Vec3::ZERO);
            view.set(a.cooldown, self.settings.respawn_ticks);
        } else {
            view.set(a.health, health);
        }
        log::debug!(
            "tick {}: {} hit {} at {:.1}m{}",
            tick,
            shooter,
            target,
            distance,
            if killed { ", killed" } else { "" }
        );
        self.hits.push(HitReport {
            tick,
            shooter,
            target,
            distance,
            killed,
        });
    }
}

impl Simulation for Arena {
    fn fixed_update(&mut self, ctx: &mut TickContext<'_>, id: NetworkId) {
        if ctx.world.meta(id).is_none_or(|meta| meta.type_id != self.avatar_type) {
            return;
        }
        let input = ctx.input_for(id).copied();
        let a = self.avatar;
        let settings = self.settings;
        let dt = ctx.dt;

        let Some(mut view) = ctx.world.view_mut(id) else {
            return;
        };

        if !view.get(a.alive) {
            let remaining = view.get(a.cooldown) - 1;
            if remaining > 0 {
                view.set(a.cooldown, remaining);
            } else {
                self.respawn(ctx.world, id);
            }
            return;
        }

        let wish = input.map_or(Vec3::ZERO, |input| input.world_movement() * settings.move_speed);
        let blend = (settings.acceleration * dt).min(1.0);
        let velocity = view.get(a.velocity).lerp(wish, blend);
        view.set(a.velocity, velocity);
        view.update(a.position, |position| position + velocity * dt);

        if let Some(input) = input {
            view.set(a.rotation, Quat::from_rotation_y(input.yaw));
        }

        let cooldown = view.get(a.cooldown);
        if cooldown > 0 {
            view.set(a.cooldown, cooldown - 1);
        } else if input.is_some_and(|input| input.pressed(Buttons::FIRE)) {
            view.set(a.cooldown, settings.fire_cooldown_ticks);
        }
    }

    fn resolve_hits(&mut self, ctx: &mut HitContext<'_>) {
        let shooters: Vec<(ClientId, SimulationInput)> = ctx
            .shooters()
            .filter(|(_, input)| input.pressed(Buttons::FIRE))
            .map(|(client, input)| (client, *input))
            .collect();
        if shooters.is_empty() {
            return;
        }

        let live = self.live_transforms(ctx.world);
        self.scene.sync(live, self.settings.avatar_radius);

        for (client, input) in shooters {
            for shooter in ctx.world.find_by_authority(client) {
                let Some(origin) = self.can_fire(ctx.world, shooter) else {
                    continue;
                };
                let shot = Shot::from_input(shooter, origin, &input, self.settings.fire_range);
                let hit = match self.compensator.raycast(
                    &mut self.scene,
                    ctx.history,
                    ctx.world.registry(),
                    &shot,
                ) {
                    Ok(hit) => hit,
                    Err(error) => {
                        log::debug!("{} fired without rewind: {}", client, error);
                        self.scene.raycast(&shot.ray, shot.shooter)
                    }
                };
                if let Some(hit) = hit {
                    self.damage(ctx.world, ctx.tick, shooter, hit.id, hit.distance);
                }
            }
        }
    }

    fn on_client_connected(&mut self, world: &mut World, client: ClientId) -> Result<(), ConfigError> {
        let id = self.spawn_avatar(world, client)?;
        log::info!("{} controls {}", client, id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec2;

    use super::*;
    use crate::simulation::{Role, Simulator, TickInputs};

    const DT: f32 = 1.0 / 60.0;

    fn simulator(role: Role) -> (Simulator<Arena>, NetworkId, NetworkId) {
        let registry = Arena::registry(8).unwrap();
        let arena = Arena::new(&registry, ArenaSettings::default()).unwrap();
        let mut world = World::new(registry);
        let shooter = arena.spawn_avatar(&mut world, ClientId(1)).unwrap();
        let target = arena.spawn_avatar(&mut world, ClientId(2)).unwrap();
        let position = arena.avatar().position;
        world
            .view_mut(target)
            .unwrap()
            .set(position, Vec3::new(0.0, 0.0, -10.0));

        let mut sim = Simulator::new(arena, world, 64, DT, role);
        sim.capture_baseline(0);
        (sim, shooter, target)
    }

    fn strafe(tick: u32) -> SimulationInput {
        SimulationInput {
            movement: Vec2::new(1.0, 0.0),
            ..SimulationInput::new(tick)
        }
    }

    fn fire(tick: u32, remote_from_tick: u32) -> SimulationInput {
        SimulationInput {
            buttons: Buttons::FIRE,
            remote_from_tick,
            ..SimulationInput::new(tick)
        }
    }

    fn health(sim: &Simulator<Arena>, id: NetworkId) -> i32 {
        let a = sim.simulation().avatar();
        sim.world().view(id).unwrap().get(a.health)
    }

    #[test]
    fn movement_is_deterministic() {
        let (mut left, shooter, _) = simulator(Role::Client);
        let (mut right, _, _) = simulator(Role::Client);

        for tick in 1..=90 {
            let mut inputs = TickInputs::new();
            let mut input = SimulationInput::new(tick);
            input.movement = Vec2::new(0.3, 1.0);
            input.yaw = tick as f32 * 0.01;
            inputs.insert(ClientId(1), input);
            left.step(&inputs);
            right.step(&inputs);
        }

        assert_eq!(left.world().checksum(), right.world().checksum());
        let a = left.simulation().avatar();
        let position = left.world().view(shooter).unwrap().get(a.position);
        assert!(position.z < -5.0, "walked forward, got {position}");
    }

    #[test]
    fn hit_uses_the_time_the_shooter_saw() {
        let (mut sim, shooter, target) = simulator(Role::Server);
        for tick in 1..=30 {
            let mut inputs = TickInputs::new();
            inputs.insert(ClientId(2), strafe(tick));
            sim.step(&inputs);
        }
        let a = sim.simulation().avatar();
        let live = sim.world().view(target).unwrap().get(a.position);
        assert!(live.x > 1.0, "target moved out of the line of fire");

        // Aimed at where the target was at tick 0.
        let mut inputs = TickInputs::new();
        inputs.insert(ClientId(1), fire(31, 0));
        inputs.insert(ClientId(2), strafe(31));
        sim.step(&inputs);

        assert_eq!(health(&sim, target), MAX_HEALTH - 25);
        let hits = sim.simulation_mut().take_hits();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].shooter, shooter);
        assert_eq!(hits[0].target, target);
    }

    #[test]
    fn shot_at_current_time_misses_moved_target() {
        let (mut sim, _, target) = simulator(Role::Server);
        for tick in 1..=30 {
            let mut inputs = TickInputs::new();
            inputs.insert(ClientId(2), strafe(tick));
            sim.step(&inputs);
        }

        let mut inputs = TickInputs::new();
        inputs.insert(ClientId(1), fire(31, 30));
        sim.step(&inputs);

        assert_eq!(health(&sim, target), MAX_HEALTH);
        assert!(sim.simulation().hits().is_empty());
    }

    #[test]
    fn clients_never_resolve_hits() {
        let (mut sim, _, target) = simulator(Role::Client);
        let mut inputs = TickInputs::new();
        inputs.insert(ClientId(1), fire(1, 0));
        sim.step(&inputs);
        assert_eq!(health(&sim, target), MAX_HEALTH);
    }

    #[test]
    fn killed_avatar_respawns_at_its_spawn_point() {
        let (mut sim, _, target) = simulator(Role::Server);
        let a = sim.simulation().avatar();
        sim.world_mut().view_mut(target).unwrap().set(a.health, 25);

        let mut inputs = TickInputs::new();
        inputs.insert(ClientId(1), fire(1, 0));
        sim.step(&inputs);
        assert!(!sim.world().view(target).unwrap().get(a.alive));
        assert!(sim.simulation().hits()[0].killed);

        let respawn_ticks = sim.simulation().settings().respawn_ticks;
        for _ in 0..respawn_ticks {
            sim.step(&TickInputs::new());
        }

        let view = sim.world().view(target).unwrap();
        assert!(view.get(a.alive));
        assert_eq!(view.get(a.health), MAX_HEALTH);
        assert_eq!(view.get(a.position), sim.simulation().spawn_point(target));
    }

    #[test]
    fn fire_cooldown_limits_rate() {
        let (mut sim, _, target) = simulator(Role::Server);
        for tick in 1..=5 {
            let mut inputs = TickInputs::new();
            inputs.insert(ClientId(1), fire(tick, tick - 1));
            sim.step(&inputs);
        }
        assert_eq!(health(&sim, target), MAX_HEALTH - 25);
    }
}
