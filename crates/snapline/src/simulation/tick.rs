use crate::error::ConfigError;
use crate::snapshot::{Snapshot, WorldHistory};
use crate::world::{ClientId, NetworkId, World};

use super::input::{SimulationInput, TickInputs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Authoritative peer; runs hit resolution.
    Server,
    /// Predicting peer.
    Client,
}

/// Everything an entity update may touch during one tick.
pub struct TickContext<'a> {
    pub world: &'a mut World,
    pub tick: u32,
    pub dt: f32,
    pub inputs: &'a TickInputs,
    pub role: Role,
    pub resimulating: bool,
}

impl TickContext<'_> {
    /// The input of whichever client holds input authority over `id`.
    pub fn input_for(&self, id: NetworkId) -> Option<&SimulationInput> {
        let owner = self.world.input_authority(id)?;
        self.inputs.get(&owner)
    }
}

/// Server-only hook run before entity updates, with access to history for
/// lag-compensated queries.
pub struct HitContext<'a> {
    pub world: &'a mut World,
    pub history: &'a WorldHistory,
    pub tick: u32,
    pub inputs: &'a TickInputs,
}

impl HitContext<'_> {
    pub fn shooters(&self) -> impl Iterator<Item = (ClientId, &SimulationInput)> {
        self.inputs.iter().map(|(client, input)| (*client, input))
    }
}

/// Game logic plugged into the tick loop. Must be deterministic: the same
/// world and inputs always produce the same bytes.
pub trait Simulation {
    fn fixed_update(&mut self, ctx: &mut TickContext<'_>, id: NetworkId);

    fn resolve_hits(&mut self, _ctx: &mut HitContext<'_>) {}

    /// Server only. Spawns whatever a newly connected client controls; an
    /// error refuses the connection.
    fn on_client_connected(
        &mut self,
        _world: &mut World,
        _client: ClientId,
    ) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// Runs ticks over one world and records each result in history.
pub struct Simulator<S> {
    simulation: S,
    world: World,
    history: WorldHistory,
    role: Role,
    tick: u32,
    dt: f32,
}

impl<S: Simulation> Simulator<S> {
    pub fn new(simulation: S, world: World, history_depth: usize, dt: f32, role: Role) -> Self {
        Self {
            simulation,
            world,
            history: WorldHistory::new(history_depth),
            role,
            tick: 0,
            dt,
        }
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn dt(&self) -> f32 {
        self.dt
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn history(&self) -> &WorldHistory {
        &self.history
    }

    pub fn simulation(&self) -> &S {
        &self.simulation
    }

    pub fn simulation_mut(&mut self) -> &mut S {
        &mut self.simulation
    }

    /// Lets the simulation set up whatever a newly connected client controls.
    pub fn connect_client(&mut self, client: ClientId) -> Result<(), ConfigError> {
        self.simulation.on_client_connected(&mut self.world, client)
    }

    /// Runs tick `self.tick() + 1` and returns it.
    ///
    /// Order is fixed: bind inputs, resolve hits (server), update every
    /// entity alive at the start of the tick once in meta-index order, then
    /// capture. Entities spawned during the tick first update on the next.
    pub fn step(&mut self, inputs: &TickInputs) -> u32 {
        self.run_tick(inputs, false)
    }

    pub(crate) fn resimulate(&mut self, inputs: &TickInputs) -> u32 {
        self.run_tick(inputs, true)
    }

    fn run_tick(&mut self, inputs: &TickInputs, resimulating: bool) -> u32 {
        let tick = self.tick.wrapping_add(1);

        if self.role == Role::Server {
            let mut hits = HitContext {
                world: &mut self.world,
                history: &self.history,
                tick,
                inputs,
            };
            self.simulation.resolve_hits(&mut hits);
        }

        let ids = self.world.ids();
        let mut ctx = TickContext {
            world: &mut self.world,
            tick,
            dt: self.dt,
            inputs,
            role: self.role,
            resimulating,
        };
        for id in ids {
            if ctx.world.contains(id) {
                self.simulation.fixed_update(&mut ctx, id);
            }
        }

        self.history.capture(tick, &self.world);
        self.tick = tick;
        tick
    }

    /// Captures the current world as `tick` without simulating. Used to
    /// seed history at startup.
    pub fn capture_baseline(&mut self, tick: u32) {
        self.tick = tick;
        self.history.discard_after(tick);
        if self.history.latest().is_some_and(|s| s.tick() == tick) {
            self.history.drop_latest();
        }
        self.history.capture(tick, &self.world);
    }

    /// Replaces the world with `snapshot` and makes it the newest history
    /// entry, dropping every capture after it.
    pub fn rewind_to(&mut self, snapshot: &Snapshot) {
        self.world.restore_from(snapshot);
        self.capture_baseline(snapshot.tick());
    }

    /// Adopts `world` as the state at `tick`, forgetting all history.
    pub fn reset_to(&mut self, world: &World, tick: u32) {
        self.world.copy_from(world);
        self.history.clear();
        self.capture_baseline(tick);
    }
}
