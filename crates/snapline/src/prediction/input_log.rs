use std::collections::BTreeMap;

use crate::simulation::SimulationInput;

/// Local inputs per predicted tick, kept until the server confirms a tick at
/// or after them. Bounded; the oldest entry goes first.
#[derive(Debug, Clone)]
pub struct InputLog {
    inputs: BTreeMap<u32, SimulationInput>,
    capacity: usize,
}

impl InputLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inputs: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, input: SimulationInput) {
        self.inputs.insert(input.tick, input);
        while self.inputs.len() > self.capacity {
            self.inputs.pop_first();
        }
    }

    pub fn get(&self, tick: u32) -> Option<&SimulationInput> {
        self.inputs.get(&tick)
    }

    /// Drops everything up to and including `tick`.
    pub fn acknowledge(&mut self, tick: u32) {
        self.inputs = self.inputs.split_off(&tick.saturating_add(1));
    }

    /// The newest `count` inputs, oldest first.
    pub fn recent(&self, count: usize) -> Vec<SimulationInput> {
        let mut recent: Vec<_> = self.inputs.values().rev().take(count).copied().collect();
        recent.reverse();
        recent
    }

    pub fn oldest_tick(&self) -> Option<u32> {
        self.inputs.keys().next().copied()
    }

    pub fn newest_tick(&self) -> Option<u32> {
        self.inputs.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn clear(&mut self) {
        self.inputs.clear();
    }
}
