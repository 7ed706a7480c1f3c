use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::net::{
    FRAGMENT_OVERHEAD, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE, MIN_FRAGMENT_SIZE, PAYLOAD_HEADER_SIZE,
};

pub const DEFAULT_TICK_RATE: u32 = 60;
pub const DEFAULT_PORT: u16 = 27015;

/// Engine-wide knobs. Validated once before anything runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tick_rate: u32,
    /// How far the client may run ahead of its last confirmed server tick.
    pub max_predicted_ticks: u32,
    pub history_depth: usize,
    pub max_bytes_per_tick: usize,
    pub fragment_size: usize,
    /// Previous inputs repeated in every input packet to ride out loss.
    pub input_redundancy: usize,
    pub interpolation_delay_ticks: f32,
    pub max_clients: usize,
    pub connection_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            max_predicted_ticks: 8,
            history_depth: 64,
            max_bytes_per_tick: 4096,
            fragment_size: 1024,
            input_redundancy: 3,
            interpolation_delay_ticks: 2.0,
            max_clients: 32,
            connection_timeout_secs: 10,
        }
    }
}

impl EngineConfig {
    pub fn tick_dt(&self) -> f32 {
        1.0 / self.tick_rate as f32
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 || self.tick_rate > 1000 {
            return Err(ConfigError::InvalidTickRate(self.tick_rate));
        }
        if self.history_depth == 0 || self.history_depth < self.max_predicted_ticks as usize {
            return Err(ConfigError::HistoryTooShallow {
                history_depth: self.history_depth,
                max_predicted_ticks: self.max_predicted_ticks,
            });
        }
        let max_fragment = MAX_PACKET_SIZE - FRAGMENT_OVERHEAD;
        if !(MIN_FRAGMENT_SIZE..=max_fragment).contains(&self.fragment_size) {
            return Err(ConfigError::InvalidFragmentSize {
                size: self.fragment_size,
                min: MIN_FRAGMENT_SIZE,
                max: max_fragment,
            });
        }
        if self.max_bytes_per_tick <= PAYLOAD_HEADER_SIZE {
            return Err(ConfigError::BudgetTooSmall {
                budget: self.max_bytes_per_tick,
                min: PAYLOAD_HEADER_SIZE + 1,
            });
        }
        if self.max_bytes_per_tick > MAX_PAYLOAD_SIZE {
            return Err(ConfigError::BudgetTooLarge {
                budget: self.max_bytes_per_tick,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(())
    }
}

/// Per networked type settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeConfig {
    /// Pool capacity; spawning more than this is a configuration error.
    pub max_objects: u32,
    /// Higher values are sent first.
    pub priority: i32,
    /// Minimum ticks between two sends of the same entity.
    pub cooldown_ticks: u32,
    pub cooldown_exempt: bool,
}

impl Default for TypeConfig {
    fn default() -> Self {
        Self {
            max_objects: 64,
            priority: 0,
            cooldown_ticks: 0,
            cooldown_exempt: false,
        }
    }
}

impl TypeConfig {
    pub fn with_capacity(max_objects: u32) -> Self {
        Self {
            max_objects,
            ..Default::default()
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn cooldown(mut self, ticks: u32) -> Self {
        self.cooldown_ticks = ticks;
        self
    }

    pub fn exempt_from_cooldown(mut self) -> Self {
        self.cooldown_exempt = true;
        self
    }
}
