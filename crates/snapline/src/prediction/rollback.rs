use crate::error::ResimError;
use crate::simulation::{Simulation, SimulationInput, Simulator, TickInputs};
use crate::snapshot::Snapshot;
use crate::world::{ClientId, World};

use super::InputLog;

/// Notified around every rollback, e.g. to blend the visual jump.
pub trait RollbackObserver {
    /// Called with the predicted world before it is overwritten.
    fn on_pre_rollback(&mut self, world: &World, tick: u32);

    /// Called once replay has finished, or stopped on a desync.
    fn on_post_resimulation(&mut self, world: &World, tick: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionState {
    /// No authoritative state received yet.
    Idle,
    Predicting { tick: u32 },
    Resimulating { from: u32, to: u32 },
    /// Replay hit a tick with no recorded input. Cleared by the next
    /// successful reconciliation.
    Desynced { tick: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictOutcome {
    Predicted(u32),
    /// Predicting further would run past `confirmed + max_predicted_ticks`.
    Stalled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub confirmed_tick: u32,
    pub resimulated_ticks: u32,
    /// True when the authoritative tick was already behind the latest
    /// confirmed tick and was ignored.
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PredictionStats {
    pub predicted_ticks: u64,
    pub rollbacks: u64,
    pub resimulated_ticks: u64,
    pub stalls: u64,
    pub desyncs: u64,
}

/// Client-side prediction state machine. Owns the log of local inputs it
/// needs for replay.
#[derive(Debug, Clone)]
pub struct PredictionEngine {
    local: ClientId,
    max_predicted_ticks: u32,
    state: PredictionState,
    confirmed_tick: Option<u32>,
    log: InputLog,
    stats: PredictionStats,
}

impl PredictionEngine {
    pub fn new(local: ClientId, max_predicted_ticks: u32, log_capacity: usize) -> Self {
        Self {
            local,
            max_predicted_ticks,
            state: PredictionState::Idle,
            confirmed_tick: None,
            log: InputLog::new(log_capacity),
            stats: PredictionStats::default(),
        }
    }

    pub fn state(&self) -> PredictionState {
        self.state
    }

    pub fn confirmed_tick(&self) -> Option<u32> {
        self.confirmed_tick
    }

    pub fn input_log(&self) -> &InputLog {
        &self.log
    }

    pub fn stats(&self) -> PredictionStats {
        self.stats
    }

    pub fn max_predicted_ticks(&self) -> u32 {
        self.max_predicted_ticks
    }

    /// Highest tick prediction may reach right now, if any.
    pub fn prediction_limit(&self) -> Option<u32> {
        self.confirmed_tick
            .map(|confirmed| confirmed.saturating_add(self.max_predicted_ticks))
    }

    pub fn can_predict(&self, tick: u32) -> bool {
        self.prediction_limit().is_some_and(|limit| tick <= limit)
    }

    /// Predicts one tick with `input`, stamped to the next tick. The input is
    /// kept for replay.
    pub fn predict<S: Simulation>(
        &mut self,
        simulator: &mut Simulator<S>,
        mut input: SimulationInput,
    ) -> PredictOutcome {
        let tick = simulator.tick().wrapping_add(1);
        if !self.can_predict(tick) {
            self.stats.stalls += 1;
            log::debug!(
                "{} stalled at tick {} (limit {:?})",
                self.local,
                tick,
                self.prediction_limit()
            );
            return PredictOutcome::Stalled;
        }

        input.tick = tick;
        self.log.record(input);
        let mut inputs = TickInputs::new();
        inputs.insert(self.local, input);
        simulator.step(&inputs);

        self.stats.predicted_ticks += 1;
        if !matches!(self.state, PredictionState::Desynced { .. }) {
            self.state = PredictionState::Predicting { tick };
        }
        PredictOutcome::Predicted(tick)
    }

    /// Replaces predicted state at `authoritative.tick()` with the server's
    /// and replays every later predicted tick with the recorded inputs.
    ///
    /// A missing input stops the replay at that tick; the world is left at
    /// the last tick that could be reproduced.
    pub fn reconcile<S: Simulation>(
        &mut self,
        simulator: &mut Simulator<S>,
        authoritative: &Snapshot,
        observers: &mut [&mut dyn RollbackObserver],
    ) -> Result<ReconcileReport, ResimError> {
        let confirmed = authoritative.tick();
        if self.confirmed_tick.is_some_and(|current| confirmed <= current) {
            return Ok(ReconcileReport {
                confirmed_tick: confirmed,
                resimulated_ticks: 0,
                stale: true,
            });
        }
        self.confirmed_tick = Some(confirmed);
        self.log.acknowledge(confirmed);

        let predicted = simulator.tick();
        if self.state == PredictionState::Idle || predicted <= confirmed {
            // Nothing predicted past the server yet: adopt its state as is.
            simulator.rewind_to(authoritative);
            self.state = PredictionState::Predicting { tick: confirmed };
            return Ok(ReconcileReport {
                confirmed_tick: confirmed,
                resimulated_ticks: 0,
                stale: false,
            });
        }

        for observer in observers.iter_mut() {
            observer.on_pre_rollback(simulator.world(), predicted);
        }
        self.state = PredictionState::Resimulating {
            from: confirmed,
            to: predicted,
        };
        self.stats.rollbacks += 1;
        simulator.rewind_to(authoritative);

        let mut replayed = 0;
        let mut outcome = Ok(());
        for tick in confirmed + 1..=predicted {
            let Some(input) = self.log.get(tick).copied() else {
                outcome = Err(ResimError::MissingInput { tick });
                break;
            };
            let mut inputs = TickInputs::new();
            inputs.insert(self.local, input);
            simulator.resimulate(&inputs);
            replayed += 1;
        }
        self.stats.resimulated_ticks += replayed as u64;

        for observer in observers.iter_mut() {
            observer.on_post_resimulation(simulator.world(), simulator.tick());
        }

        match outcome {
            Ok(()) => {
                log::debug!(
                    "rolled back to {} and resimulated {} ticks",
                    confirmed,
                    replayed
                );
                self.state = PredictionState::Predicting { tick: predicted };
                Ok(ReconcileReport {
                    confirmed_tick: confirmed,
                    resimulated_ticks: replayed,
                    stale: false,
                })
            }
            Err(ResimError::MissingInput { tick }) => {
                log::warn!("{} desynced: no input recorded for tick {}", self.local, tick);
                self.stats.desyncs += 1;
                self.state = PredictionState::Desynced { tick };
                Err(ResimError::MissingInput { tick })
            }
        }
    }

    /// Forgets every in-flight prediction. Used on disconnect.
    pub fn clear(&mut self) {
        self.state = PredictionState::Idle;
        self.confirmed_tick = None;
        self.log.clear();
    }
}
