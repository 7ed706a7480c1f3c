use std::time::Duration;

use snapline::arena::ArenaSettings;
use snapline::{EngineConfig, PacketLossSimulation};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub engine: EngineConfig,
    pub arena: ArenaSettings,
    /// Avatars per type pool; also caps how many clients can play.
    pub avatar_capacity: u32,
    pub stats_interval: Duration,
    pub global_packet_loss: Option<PacketLossSimulation>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            bind_addr: format!("0.0.0.0:{}", snapline::DEFAULT_PORT),
            avatar_capacity: engine.max_clients as u32,
            engine,
            arena: ArenaSettings::default(),
            stats_interval: Duration::from_secs(5),
            global_packet_loss: None,
        }
    }
}
