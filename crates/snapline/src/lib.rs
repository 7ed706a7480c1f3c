pub mod arena;
pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod interpolation;
pub mod lagcomp;
pub mod net;
pub mod prediction;
pub mod server;
pub mod simulation;
pub mod snapshot;
pub mod state;
pub mod world;

pub use buffer::NetBuffer;
pub use client::{ClientEngine, ClientEvent, ClientStats};
pub use config::{DEFAULT_PORT, DEFAULT_TICK_RATE, EngineConfig, TypeConfig};
pub use error::{
    BufferError, ConfigError, Error, HistoryError, LagCompError, ProtocolError, ResimError, Result,
};
pub use interpolation::{InterpolatedView, RenderClock};
pub use lagcomp::{HitScene, LagCompensator, Shot, SphereScene};
pub use net::{
    ConnectionState, MemoryNetwork, MemoryTransport, Packet, PacketLossSimulation, PacketType,
    Transport, UdpTransport,
};
pub use prediction::{PredictionEngine, RollbackObserver, VisualSmoother};
pub use server::{DisconnectReason, ServerEngine, ServerEvent, ServerStats};
pub use simulation::{
    Buttons, Role, Simulation, SimulationClock, SimulationInput, Simulator, TickContext,
    TickInputs,
};
pub use snapshot::{Snapshot, WorldHistory};
pub use state::{Field, Networked, TypeRegistry};
pub use world::{ClientId, NetworkId, NetworkObjectRef, World};
