//! Authoritative side of a session: runs the simulation at a fixed rate and
//! replicates it to every connected client.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::ConfigError;
use crate::net::{
    ConnectionManager, ConnectionState, DeclaredPriority, Packet, PacketHeader, PacketType,
    PriorityPolicy, ReplicationSender, Transport, fragment,
};
use crate::simulation::{
    InputQueue, Role, Simulation, SimulationClock, SimulationInput, Simulator, TickInputs,
};
use crate::snapshot::WorldHistory;
use crate::world::{ClientId, World};

#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientConnected {
        client_id: ClientId,
        addr: SocketAddr,
    },
    ClientDisconnected {
        client_id: ClientId,
        reason: DisconnectReason,
    },
    ConnectionDenied {
        addr: SocketAddr,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Kicked,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Kicked => "kicked",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ServerStats {
    pub tick: u32,
    pub client_count: usize,
    pub entity_count: usize,
    pub fragments_sent: u64,
    pub payload_bytes_sent: u64,
    /// Changed entities pushed to a later tick by budget or cooldown.
    pub deferred_entities: u64,
    pub inputs_rejected: u64,
}

struct Peer {
    inputs: InputQueue,
    sender: ReplicationSender,
}

pub struct ServerEngine<S> {
    config: EngineConfig,
    clock: SimulationClock,
    simulator: Simulator<S>,
    connections: ConnectionManager,
    peers: BTreeMap<ClientId, Peer>,
    policy: Box<dyn PriorityPolicy + Send>,
    outgoing: Vec<(Packet, SocketAddr)>,
    pending_events: VecDeque<ServerEvent>,
    elapsed: Duration,
    stats: ServerStats,
}

impl<S: Simulation> ServerEngine<S> {
    /// Validates `config`, seeds history with `world` as tick 0 and starts
    /// the clock.
    pub fn new(config: EngineConfig, simulation: S, world: World) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut simulator = Simulator::new(
            simulation,
            world,
            config.history_depth,
            config.tick_dt(),
            Role::Server,
        );
        simulator.capture_baseline(0);

        let mut clock = SimulationClock::new(config.tick_rate);
        clock.start();

        log::info!(
            "server engine started at {} Hz, history {} ticks, {} bytes per tick",
            config.tick_rate,
            config.history_depth,
            config.max_bytes_per_tick
        );

        Ok(Self {
            connections: ConnectionManager::with_timeout(
                config.max_clients,
                config.connection_timeout_secs,
            ),
            clock,
            simulator,
            peers: BTreeMap::new(),
            policy: Box::new(DeclaredPriority),
            outgoing: Vec::new(),
            pending_events: VecDeque::new(),
            elapsed: Duration::ZERO,
            stats: ServerStats::default(),
            config,
        })
    }

    pub fn with_policy(mut self, policy: impl PriorityPolicy + Send + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tick(&self) -> u32 {
        self.simulator.tick()
    }

    pub fn world(&self) -> &World {
        self.simulator.world()
    }

    pub fn world_mut(&mut self) -> &mut World {
        self.simulator.world_mut()
    }

    pub fn history(&self) -> &WorldHistory {
        self.simulator.history()
    }

    pub fn simulation(&self) -> &S {
        self.simulator.simulation()
    }

    pub fn simulation_mut(&mut self) -> &mut S {
        self.simulator.simulation_mut()
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            tick: self.simulator.tick(),
            client_count: self.connections.connected_count(),
            entity_count: self.simulator.world().entity_count(),
            ..self.stats
        }
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn drain_outgoing(&mut self) -> Vec<(Packet, SocketAddr)> {
        std::mem::take(&mut self.outgoing)
    }

    /// Admits a client. A repeated request from an address that is already
    /// connected just repeats the acceptance, in case it was lost.
    pub fn connect(&mut self, addr: SocketAddr, client_salt: u64) -> Result<ClientId, String> {
        let now = self.elapsed;
        let (connection, created) = match self.connections.get_or_create(addr, client_salt, now) {
            Ok(found) => found,
            Err(reason) => {
                self.deny(addr, reason.to_string());
                return Err(reason.to_string());
            }
        };
        let client_id = connection.client_id;
        connection.touch(now);

        if created {
            if let Err(error) = self.simulator.connect_client(client_id) {
                self.connections.remove(client_id);
                self.deny(addr, error.to_string());
                return Err(error.to_string());
            }
            if let Some(connection) = self.connections.get_mut(client_id) {
                connection.state = ConnectionState::Connected;
            }
            self.peers.insert(
                client_id,
                Peer {
                    inputs: InputQueue::new(self.config.history_depth),
                    sender: ReplicationSender::new(client_id, self.config.max_bytes_per_tick),
                },
            );
            log::info!("{} connected from {}", client_id, addr);
            self.pending_events
                .push_back(ServerEvent::ClientConnected { client_id, addr });
        }

        let accepted = PacketType::ConnectionAccepted {
            client_id: client_id.0,
            tick: self.simulator.tick(),
            tick_rate: self.config.tick_rate,
        };
        self.send(client_id, accepted);
        Ok(client_id)
    }

    /// Drops a client and despawns every entity it held input authority
    /// over. Returns false for unknown clients.
    pub fn disconnect(&mut self, client_id: ClientId, reason: DisconnectReason) -> bool {
        if reason != DisconnectReason::Graceful {
            self.send(client_id, PacketType::Disconnect);
        }
        if self.connections.remove(client_id).is_none() {
            return false;
        }
        self.release(client_id, reason);
        true
    }

    pub fn kick_client(&mut self, client_id: ClientId) -> bool {
        self.disconnect(client_id, DisconnectReason::Kicked)
    }

    pub fn shutdown_connections(&mut self) {
        for client_id in self.connections.ids() {
            self.kick_client(client_id);
        }
    }

    pub fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        if !packet.header.is_valid() {
            return;
        }
        if let PacketType::ConnectionRequest { client_salt } = packet.payload {
            // Refusals are already reported through events.
            let _ = self.connect(addr, client_salt);
            return;
        }

        let now = self.elapsed;
        let Some(connection) = self.connections.get_by_addr_mut(&addr) else {
            log::trace!("ignoring packet from unknown peer {}", addr);
            return;
        };
        connection.touch(now);
        let client_id = connection.client_id;

        match packet.payload {
            PacketType::Input { inputs } => self.receive_inputs(client_id, &inputs),
            PacketType::Ack { tick } => {
                if let Some(peer) = self.peers.get_mut(&client_id) {
                    peer.sender.acknowledge(tick);
                }
            }
            PacketType::Ping { timestamp } => self.send(client_id, PacketType::Pong { timestamp }),
            PacketType::Disconnect => {
                self.disconnect(client_id, DisconnectReason::Graceful);
            }
            _ => {}
        }
    }

    /// Advances the clock by `dt` seconds and runs every tick that became
    /// due. Returns how many ran.
    pub fn update(&mut self, dt: f32) -> u32 {
        self.elapsed += Duration::from_secs_f32(dt.max(0.0));
        let due = self.clock.advance(dt);
        for _ in 0..due {
            self.step();
        }

        for connection in self.connections.cleanup_timed_out(self.elapsed) {
            self.release(connection.client_id, DisconnectReason::Timeout);
        }
        due
    }

    /// Runs exactly one tick and queues its replication, regardless of the
    /// clock.
    pub fn step(&mut self) -> u32 {
        let tick = self.simulator.tick().wrapping_add(1);
        let mut inputs = TickInputs::new();
        for (client_id, peer) in &mut self.peers {
            if let Some(input) = peer.inputs.take(tick) {
                inputs.insert(*client_id, input);
            }
        }
        self.simulator.step(&inputs);
        self.replicate(tick);
        tick
    }

    /// Receives everything waiting on `transport` and handles it.
    pub fn poll<T: Transport + ?Sized>(&mut self, transport: &mut T) -> io::Result<usize> {
        let packets = transport.receive()?;
        let count = packets.len();
        for (packet, addr) in packets {
            self.handle_packet(packet, addr);
        }
        Ok(count)
    }

    /// Sends every queued packet through `transport`.
    pub fn flush<T: Transport + ?Sized>(&mut self, transport: &mut T) -> io::Result<()> {
        for (packet, addr) in self.outgoing.drain(..) {
            transport.send_to(&packet, addr)?;
        }
        Ok(())
    }

    /// Tears down everything but the connection entry, which the caller
    /// has already removed.
    fn release(&mut self, client_id: ClientId, reason: DisconnectReason) {
        self.peers.remove(&client_id);
        let world = self.simulator.world_mut();
        for id in world.find_by_authority(client_id) {
            world.despawn(id);
        }
        log::info!("{} {}", client_id, reason.as_str());
        self.pending_events
            .push_back(ServerEvent::ClientDisconnected { client_id, reason });
    }

    fn receive_inputs(&mut self, client_id: ClientId, bytes: &[u8]) {
        let Some(peer) = self.peers.get_mut(&client_id) else {
            return;
        };
        let batch: Vec<SimulationInput> = match SimulationInput::decode_batch(bytes) {
            Ok(batch) => batch,
            Err(error) => {
                log::debug!("{} sent malformed inputs: {}", client_id, error);
                self.stats.inputs_rejected += 1;
                return;
            }
        };
        for input in batch {
            // Redundant copies of inputs already queued or consumed are
            // expected; only the newest in each batch is usually fresh.
            peer.inputs.push(input);
        }
    }

    fn replicate(&mut self, tick: u32) {
        let world = self.simulator.world();
        let history = self.simulator.history();
        for (client_id, peer) in &mut self.peers {
            let Some(connection) = self.connections.get_mut(*client_id) else {
                continue;
            };
            let encoded = peer
                .sender
                .build(tick, world, history, self.policy.as_mut());
            self.stats.payload_bytes_sent += encoded.payload.len() as u64;
            self.stats.deferred_entities += encoded.deferred as u64;

            for piece in fragment(tick, &encoded.payload, self.config.fragment_size) {
                let header = PacketHeader::new(connection.next_sequence());
                self.outgoing.push((
                    Packet::new(header, PacketType::SnapshotFragment(piece)),
                    connection.addr,
                ));
                self.stats.fragments_sent += 1;
            }
        }
    }

    fn send(&mut self, client_id: ClientId, payload: PacketType) {
        let Some(connection) = self.connections.get_mut(client_id) else {
            return;
        };
        let header = PacketHeader::new(connection.next_sequence());
        self.outgoing
            .push((Packet::new(header, payload), connection.addr));
    }

    fn deny(&mut self, addr: SocketAddr, reason: String) {
        log::warn!("denied connection from {}: {}", addr, reason);
        self.outgoing.push((
            Packet::new(
                PacketHeader::new(0),
                PacketType::ConnectionDenied {
                    reason: reason.clone(),
                },
            ),
            addr,
        ));
        self.pending_events
            .push_back(ServerEvent::ConnectionDenied { addr, reason });
    }
}
