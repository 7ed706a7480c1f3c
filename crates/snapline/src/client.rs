//! Predicting side of a session.
//!
//! The client keeps three views of the world: a replica that only ever
//! holds what the server sent, a history of those replica states for
//! interpolation, and a predicted world that runs ahead on local input and
//! is rolled back whenever a newer server tick arrives.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use glam::Vec3;

use crate::config::EngineConfig;
use crate::error::{ConfigError, ProtocolError};
use crate::interpolation::{InterpolatedView, RenderClock};
use crate::net::{
    ConnectionState, DecodedTick, Fragment, FragmentAssembler, Packet, PacketHeader, PacketType,
    Transport,
};
use crate::prediction::{PredictOutcome, PredictionEngine, RollbackObserver, VisualSmoother};
use crate::server::DisconnectReason;
use crate::simulation::{Role, Simulation, SimulationClock, SimulationInput, Simulator};
use crate::snapshot::WorldHistory;
use crate::state::Field;
use crate::world::{ClientId, NetworkId, World};

const CONNECT_RETRY: Duration = Duration::from_millis(500);
const PING_INTERVAL: Duration = Duration::from_secs(1);
/// Extra ticks a frame may predict to climb back to its lead after a stall
/// or a large rollback.
const MAX_CATCH_UP_TICKS: u32 = 4;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected { client_id: ClientId, tick: u32 },
    Denied { reason: String },
    Disconnected { reason: DisconnectReason },
    /// Replay stopped early; prediction resumes from the next server tick.
    Desynced { tick: u32 },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClientStats {
    pub applied_ticks: u64,
    pub rejected_ticks: u64,
    pub rejected_fragments: u64,
    pub discarded_ticks: u64,
    pub rollbacks: u64,
    pub resimulated_ticks: u64,
    pub stalls: u64,
    pub desyncs: u64,
    pub rtt_ms: Option<f32>,
}

pub struct ClientEngine<S> {
    config: EngineConfig,
    server: SocketAddr,
    state: ConnectionState,
    client_id: Option<ClientId>,
    client_salt: u64,
    sequence: u32,
    clock: SimulationClock,
    predicted: Simulator<S>,
    replica: World,
    remote: WorldHistory,
    assembler: FragmentAssembler,
    prediction: Option<PredictionEngine>,
    render_clock: RenderClock,
    smoother: Option<VisualSmoother>,
    outgoing: Vec<(Packet, SocketAddr)>,
    pending_events: VecDeque<ClientEvent>,
    elapsed: Duration,
    last_receive: Duration,
    last_request: Option<Duration>,
    last_ping: Option<Duration>,
    stats: ClientStats,
}

impl<S: Simulation> ClientEngine<S> {
    /// `world` must be empty and built from the same registry as the
    /// server's; everything in it arrives by replication.
    pub fn new(
        config: EngineConfig,
        simulation: S,
        world: World,
        server: SocketAddr,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let replica = World::new(Arc::clone(world.registry()));
        let predicted = Simulator::new(
            simulation,
            world,
            config.history_depth,
            config.tick_dt(),
            Role::Client,
        );

        Ok(Self {
            server,
            state: ConnectionState::Disconnected,
            client_id: None,
            client_salt: rand::random(),
            sequence: 0,
            clock: SimulationClock::new(config.tick_rate),
            predicted,
            replica,
            remote: WorldHistory::new(config.history_depth),
            assembler: FragmentAssembler::new(),
            prediction: None,
            render_clock: RenderClock::new(config.tick_rate, config.interpolation_delay_ticks),
            smoother: None,
            outgoing: Vec::new(),
            pending_events: VecDeque::new(),
            elapsed: Duration::ZERO,
            last_receive: Duration::ZERO,
            last_request: None,
            last_ping: None,
            stats: ClientStats::default(),
            config,
        })
    }

    /// Blends rollback corrections of `position` out over a few frames.
    pub fn with_smoothing(mut self, position: Field<Vec3>) -> Self {
        self.smoother = Some(VisualSmoother::new(position));
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    /// Newest predicted tick.
    pub fn tick(&self) -> u32 {
        self.predicted.tick()
    }

    pub fn confirmed_tick(&self) -> Option<u32> {
        self.prediction.as_ref().and_then(PredictionEngine::confirmed_tick)
    }

    pub fn predicted_world(&self) -> &World {
        self.predicted.world()
    }

    pub fn predicted_history(&self) -> &WorldHistory {
        self.predicted.history()
    }

    /// Server state as last received, never touched by prediction.
    pub fn replica(&self) -> &World {
        &self.replica
    }

    pub fn remote_history(&self) -> &WorldHistory {
        &self.remote
    }

    pub fn render_clock(&self) -> &RenderClock {
        &self.render_clock
    }

    /// Remote entities as they should be drawn this frame.
    pub fn interpolated(&self) -> Option<InterpolatedView<'_>> {
        self.render_clock.view(&self.remote, self.replica.registry())
    }

    pub fn smoother(&self) -> Option<&VisualSmoother> {
        self.smoother.as_ref()
    }

    pub fn prediction(&self) -> Option<&PredictionEngine> {
        self.prediction.as_ref()
    }

    pub fn simulation(&self) -> &S {
        self.predicted.simulation()
    }

    /// Entities this client holds input authority over, in the predicted
    /// world.
    pub fn local_entities(&self) -> Vec<NetworkId> {
        match self.client_id {
            Some(client_id) => self.predicted.world().find_by_authority(client_id),
            None => Vec::new(),
        }
    }

    pub fn stats(&self) -> ClientStats {
        let mut stats = ClientStats {
            discarded_ticks: self.assembler.discarded_ticks(),
            ..self.stats
        };
        if let Some(prediction) = &self.prediction {
            let predicted = prediction.stats();
            stats.rollbacks = predicted.rollbacks;
            stats.resimulated_ticks = predicted.resimulated_ticks;
            stats.stalls = predicted.stalls;
            stats.desyncs = predicted.desyncs;
        }
        stats
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ClientEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn drain_outgoing(&mut self) -> Vec<(Packet, SocketAddr)> {
        std::mem::take(&mut self.outgoing)
    }

    /// Starts the handshake. Requests repeat until answered.
    pub fn connect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Connecting;
        self.last_receive = self.elapsed;
        self.last_request = None;
        log::info!("connecting to {}", self.server);
        self.request_connection();
    }

    /// Says goodbye and forgets all session state: replicated and predicted
    /// worlds, recorded inputs and partially received ticks.
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.send(PacketType::Disconnect);
        self.end_session(DisconnectReason::Graceful);
    }

    pub fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        if addr != self.server || !packet.header.is_valid() {
            return;
        }
        self.last_receive = self.elapsed;

        match packet.payload {
            PacketType::ConnectionAccepted {
                client_id,
                tick,
                tick_rate,
            } => self.on_accepted(ClientId(client_id), tick, tick_rate),
            PacketType::ConnectionDenied { reason } => {
                if self.state == ConnectionState::Connecting {
                    log::warn!("connection denied: {}", reason);
                    self.state = ConnectionState::Disconnected;
                    self.pending_events.push_back(ClientEvent::Denied { reason });
                }
            }
            PacketType::SnapshotFragment(fragment) => {
                if self.state == ConnectionState::Connected {
                    self.receive_fragment(fragment);
                }
            }
            PacketType::Pong { timestamp } => {
                let now = self.elapsed.as_millis() as u64;
                self.stats.rtt_ms = Some(now.saturating_sub(timestamp) as f32);
            }
            PacketType::Disconnect => {
                if self.state != ConnectionState::Disconnected {
                    self.end_session(DisconnectReason::Kicked);
                }
            }
            _ => {}
        }
    }

    /// Advances local time by `dt` seconds and predicts every tick that
    /// became due using `input`. Returns how many ticks were predicted.
    ///
    /// The input's tick and lag-compensation stamp are filled in here.
    pub fn update(&mut self, dt: f32, input: SimulationInput) -> u32 {
        self.elapsed += Duration::from_secs_f32(dt.max(0.0));
        self.render_clock.update(dt);
        if let Some(smoother) = &mut self.smoother {
            smoother.update(dt);
        }

        match self.state {
            ConnectionState::Disconnected => return 0,
            ConnectionState::Connecting => {
                if self.timed_out() {
                    log::warn!("no answer from {}", self.server);
                    self.end_session(DisconnectReason::Timeout);
                } else if self
                    .last_request
                    .is_none_or(|at| self.elapsed.saturating_sub(at) >= CONNECT_RETRY)
                {
                    self.request_connection();
                }
                return 0;
            }
            ConnectionState::Connected => {}
        }

        if self.timed_out() {
            log::warn!("server {} went silent", self.server);
            self.end_session(DisconnectReason::Timeout);
            return 0;
        }

        let due = self.clock.advance(dt);
        let predicted = self.predict(due, input);
        if predicted > 0 {
            self.send_inputs();
        }

        if self
            .last_ping
            .is_none_or(|at| self.elapsed.saturating_sub(at) >= PING_INTERVAL)
        {
            self.last_ping = Some(self.elapsed);
            let timestamp = self.elapsed.as_millis() as u64;
            self.send(PacketType::Ping { timestamp });
        }
        predicted
    }

    pub fn poll<T: Transport + ?Sized>(&mut self, transport: &mut T) -> io::Result<usize> {
        let packets = transport.receive()?;
        let count = packets.len();
        for (packet, addr) in packets {
            self.handle_packet(packet, addr);
        }
        Ok(count)
    }

    pub fn flush<T: Transport + ?Sized>(&mut self, transport: &mut T) -> io::Result<()> {
        for (packet, addr) in self.outgoing.drain(..) {
            transport.send_to(&packet, addr)?;
        }
        Ok(())
    }

    fn timed_out(&self) -> bool {
        let timeout = Duration::from_secs(self.config.connection_timeout_secs);
        self.elapsed.saturating_sub(self.last_receive) > timeout
    }

    fn request_connection(&mut self) {
        self.last_request = Some(self.elapsed);
        self.send(PacketType::ConnectionRequest {
            client_salt: self.client_salt,
        });
    }

    fn on_accepted(&mut self, client_id: ClientId, tick: u32, tick_rate: u32) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        if tick_rate != self.config.tick_rate {
            log::warn!(
                "server ticks at {} Hz, configured for {} Hz",
                tick_rate,
                self.config.tick_rate
            );
        }
        self.state = ConnectionState::Connected;
        self.client_id = Some(client_id);
        self.prediction = Some(PredictionEngine::new(
            client_id,
            self.config.max_predicted_ticks,
            self.config.history_depth,
        ));
        self.clock.start();
        log::info!("connected as {} at server tick {}", client_id, tick);
        self.pending_events
            .push_back(ClientEvent::Connected { client_id, tick });
    }

    /// Keeps the predicted tick about half the prediction window ahead of
    /// the last confirmed one, catching up a little faster after falling
    /// behind.
    fn predict(&mut self, due: u32, input: SimulationInput) -> u32 {
        let Some(prediction) = self.prediction.as_mut() else {
            return 0;
        };
        let Some(confirmed) = prediction.confirmed_tick() else {
            return 0;
        };

        let lead = (self.config.max_predicted_ticks / 2).max(1);
        let target = confirmed.saturating_add(lead);
        let current = self.predicted.tick();
        let mut budget = due;
        if current.saturating_add(due) < target {
            budget = (target - current).min(due + MAX_CATCH_UP_TICKS);
        }

        let (remote_from_tick, alpha) = self.render_clock.stamp();
        let mut ran = 0;
        for _ in 0..budget {
            let stamped = SimulationInput {
                remote_from_tick,
                alpha,
                ..input
            };
            match prediction.predict(&mut self.predicted, stamped) {
                PredictOutcome::Predicted(_) => ran += 1,
                PredictOutcome::Stalled => break,
            }
        }
        ran
    }

    fn send_inputs(&mut self) {
        let Some(prediction) = &self.prediction else {
            return;
        };
        let recent = prediction
            .input_log()
            .recent(self.config.input_redundancy + 1);
        if recent.is_empty() {
            return;
        }
        self.send(PacketType::Input {
            inputs: SimulationInput::encode_batch(&recent),
        });
    }

    fn receive_fragment(&mut self, fragment: Fragment) {
        let (tick, mut payload) = match self.assembler.insert(fragment) {
            Ok(Some(complete)) => complete,
            Ok(None) => return,
            Err(error) => {
                log::debug!("dropped fragment: {}", error);
                self.stats.rejected_fragments += 1;
                return;
            }
        };
        if let Err(error) = self.apply_tick(tick, &mut payload) {
            // Not acknowledged, so the server keeps resending the same
            // changes in later ticks.
            log::debug!("discarding tick {}: {}", tick, error);
            self.stats.rejected_ticks += 1;
        }
    }

    fn apply_tick(
        &mut self,
        tick: u32,
        payload: &mut crate::buffer::NetBuffer,
    ) -> Result<(), ProtocolError> {
        let decoded = DecodedTick::decode(
            tick,
            payload,
            self.replica.registry(),
            self.replica.metas().len(),
        )?;
        decoded.apply(&mut self.replica)?;
        self.assembler.mark_applied(tick);
        self.stats.applied_ticks += 1;
        self.render_clock.on_tick_received(tick);

        let authoritative = self.remote.capture(tick, &self.replica);
        if let Some(prediction) = self.prediction.as_mut() {
            let mut observers: Vec<&mut dyn RollbackObserver> = Vec::new();
            if let Some(smoother) = self.smoother.as_mut() {
                observers.push(smoother);
            }
            if let Err(error) = prediction.reconcile(&mut self.predicted, authoritative, &mut observers)
            {
                log::debug!("{}", error);
                self.pending_events
                    .push_back(ClientEvent::Desynced { tick });
            }
        }

        self.send(PacketType::Ack { tick });
        Ok(())
    }

    fn end_session(&mut self, reason: DisconnectReason) {
        log::info!("session with {} ended: {}", self.server, reason.as_str());
        self.state = ConnectionState::Disconnected;
        self.client_id = None;
        if let Some(prediction) = self.prediction.as_mut() {
            prediction.clear();
        }
        self.prediction = None;
        self.assembler.reset();
        // A later session starts from nothing; the server never removes
        // what it does not know this client still holds.
        self.replica = World::new(Arc::clone(self.replica.registry()));
        self.predicted.reset_to(&self.replica, 0);
        self.remote.clear();
        self.render_clock.reset();
        self.clock.stop();
        if let Some(smoother) = &mut self.smoother {
            smoother.clear();
        }
        self.pending_events
            .push_back(ClientEvent::Disconnected { reason });
    }

    fn send(&mut self, payload: PacketType) {
        let header = PacketHeader::new(self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        self.outgoing
            .push((Packet::new(header, payload), self.server));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{Arena, ArenaSettings};
    use crate::server::ServerEngine;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn pair() -> (ServerEngine<Arena>, ClientEngine<Arena>) {
        let config = EngineConfig::default();
        let registry = Arena::registry(4).unwrap();
        let server = ServerEngine::new(
            config.clone(),
            Arena::new(&registry, ArenaSettings::default()).unwrap(),
            World::new(Arc::clone(&registry)),
        )
        .unwrap();
        let client = ClientEngine::new(
            config,
            Arena::new(&registry, ArenaSettings::default()).unwrap(),
            World::new(registry),
            addr(1),
        )
        .unwrap();
        (server, client)
    }

    /// Perfect link: everything sent is handled before the next frame.
    fn exchange(server: &mut ServerEngine<Arena>, client: &mut ClientEngine<Arena>) {
        for (packet, _) in client.drain_outgoing() {
            server.handle_packet(packet, addr(2));
        }
        for (packet, _) in server.drain_outgoing() {
            client.handle_packet(packet, addr(1));
        }
    }

    #[test]
    fn handshake_then_replication() {
        let (mut server, mut client) = pair();
        client.connect();
        exchange(&mut server, &mut client);
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.client_id(), Some(ClientId(1)));

        for _ in 0..10 {
            server.update(1.0 / 60.0);
            client.update(1.0 / 60.0, SimulationInput::default());
            exchange(&mut server, &mut client);
        }

        assert!(client.confirmed_tick().is_some());
        assert_eq!(client.replica().checksum(), server.world().checksum());
        assert_eq!(client.local_entities().len(), 1);
    }

    #[test]
    fn prediction_stays_within_window() {
        let (mut server, mut client) = pair();
        client.connect();
        exchange(&mut server, &mut client);
        server.update(1.0 / 60.0);
        exchange(&mut server, &mut client);
        let confirmed = client.confirmed_tick().unwrap();

        // Server stops talking; the client may only run the window ahead.
        for _ in 0..60 {
            client.update(1.0 / 60.0, SimulationInput::default());
        }
        assert_eq!(client.tick(), confirmed + client.config.max_predicted_ticks);
        assert!(client.stats().stalls > 0);
    }

    #[test]
    fn denied_client_reports_reason() {
        let (_, mut client) = pair();
        client.connect();
        let denied = Packet::new(
            PacketHeader::new(0),
            PacketType::ConnectionDenied {
                reason: "server full".into(),
            },
        );
        client.handle_packet(denied, addr(1));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(
            client.drain_events().last(),
            Some(ClientEvent::Denied { .. })
        ));
    }

    #[test]
    fn disconnect_forgets_session() {
        let (mut server, mut client) = pair();
        client.connect();
        exchange(&mut server, &mut client);
        for _ in 0..5 {
            server.update(1.0 / 60.0);
            client.update(1.0 / 60.0, SimulationInput::default());
            exchange(&mut server, &mut client);
        }

        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.prediction().is_none());
        assert!(client.remote_history().is_empty());
        exchange(&mut server, &mut client);
        assert_eq!(server.connections().total_count(), 0);
        assert_eq!(server.world().entity_count(), 0);
    }

    /// Like `exchange`, for several clients at distinct addresses.
    fn exchange_all(
        server: &mut ServerEngine<Arena>,
        clients: &mut [(&mut ClientEngine<Arena>, SocketAddr)],
    ) {
        for (client, from) in clients.iter_mut() {
            for (packet, _) in client.drain_outgoing() {
                server.handle_packet(packet, *from);
            }
        }
        for (packet, to) in server.drain_outgoing() {
            if let Some((client, _)) = clients.iter_mut().find(|(_, at)| *at == to) {
                client.handle_packet(packet, addr(1));
            }
        }
    }

    #[test]
    fn reconnect_starts_from_an_empty_replica() {
        let (mut server, mut first) = pair();
        let registry = Arc::clone(server.world().registry());
        let mut second = ClientEngine::new(
            EngineConfig::default(),
            Arena::new(&registry, ArenaSettings::default()).unwrap(),
            World::new(registry),
            addr(1),
        )
        .unwrap();

        first.connect();
        second.connect();
        for _ in 0..10 {
            server.update(1.0 / 60.0);
            first.update(1.0 / 60.0, SimulationInput::default());
            second.update(1.0 / 60.0, SimulationInput::default());
            exchange_all(
                &mut server,
                &mut [(&mut first, addr(2)), (&mut second, addr(3))],
            );
        }
        assert_eq!(first.replica().entity_count(), 2);

        first.disconnect();
        exchange_all(&mut server, &mut [(&mut first, addr(2))]);
        assert_eq!(first.replica().entity_count(), 0);
        assert_eq!(first.predicted_world().entity_count(), 0);
        assert_eq!(first.tick(), 0);

        // The second avatar dies while the first client is away.
        second.disconnect();
        exchange_all(&mut server, &mut [(&mut second, addr(3))]);
        assert_eq!(server.world().entity_count(), 0);

        first.connect();
        for _ in 0..30 {
            server.update(1.0 / 60.0);
            first.update(1.0 / 60.0, SimulationInput::default());
            exchange_all(&mut server, &mut [(&mut first, addr(2))]);
        }

        assert_eq!(first.state(), ConnectionState::Connected);
        assert_eq!(first.replica().ids(), server.world().ids());
        assert_eq!(first.replica().checksum(), server.world().checksum());
        assert_eq!(first.local_entities().len(), 1);
    }

    #[test]
    fn packets_from_strangers_are_ignored() {
        let (_, mut client) = pair();
        client.connect();
        let accepted = Packet::new(
            PacketHeader::new(0),
            PacketType::ConnectionAccepted {
                client_id: 9,
                tick: 0,
                tick_rate: 60,
            },
        );
        client.handle_packet(accepted, addr(99));
        assert_eq!(client.state(), ConnectionState::Connecting);
    }
}
