use std::sync::Arc;
use std::time::Duration;

use glam::Vec2;
use snapline::arena::{Arena, ArenaSettings};
use snapline::net::ConnectionState;
use snapline::{
    Buttons, ClientEngine, EngineConfig, MemoryNetwork, MemoryTransport, PacketLossSimulation,
    ServerEngine, SimulationInput, Transport, TypeRegistry, World,
};

const DT: f32 = 1.0 / 60.0;

struct Session {
    network: MemoryNetwork,
    registry: Arc<TypeRegistry>,
    server: ServerEngine<Arena>,
    server_link: MemoryTransport,
    clients: Vec<(ClientEngine<Arena>, MemoryTransport)>,
}

impl Session {
    fn new(seed: u64, clients: usize) -> Self {
        let network = MemoryNetwork::new(seed);
        let config = EngineConfig::default();
        let registry = Arena::registry(8).unwrap();
        let server_link = network.endpoint();
        let server = ServerEngine::new(
            config.clone(),
            Arena::new(&registry, ArenaSettings::default()).unwrap(),
            World::new(Arc::clone(&registry)),
        )
        .unwrap();

        let clients = (0..clients)
            .map(|_| {
                let arena = Arena::new(&registry, ArenaSettings::default()).unwrap();
                let position = arena.avatar().position;
                let mut client = ClientEngine::new(
                    config.clone(),
                    arena,
                    World::new(Arc::clone(&registry)),
                    server_link.local_addr(),
                )
                .unwrap()
                .with_smoothing(position);
                client.connect();
                (client, network.endpoint())
            })
            .collect();

        Self {
            network,
            registry,
            server,
            server_link,
            clients,
        }
    }

    fn set_conditions(&self, conditions: PacketLossSimulation) {
        self.network
            .set_conditions(self.server_link.local_addr(), conditions);
        for (_, link) in &self.clients {
            self.network.set_conditions(link.local_addr(), conditions);
        }
    }

    fn frame(&mut self, input: impl Fn(usize) -> SimulationInput) {
        self.network.advance(Duration::from_secs_f32(DT));
        self.server.poll(&mut self.server_link).unwrap();
        self.server.update(DT);
        self.server.flush(&mut self.server_link).unwrap();

        for (index, (client, link)) in self.clients.iter_mut().enumerate() {
            client.poll(link).unwrap();
            client.update(DT, input(index));
            client.flush(link).unwrap();
        }
    }

    fn checksum_of(&self, snapshot: &snapline::Snapshot) -> u64 {
        let mut scratch = World::new(Arc::clone(&self.registry));
        scratch.restore_from(snapshot);
        scratch.checksum()
    }
}

fn wander(frame: u32) -> impl Fn(usize) -> SimulationInput {
    move |index| {
        let phase = frame as f32 * 0.02 + index as f32;
        let firing = (frame + index as u32 * 7) % 45 == 0;
        SimulationInput {
            movement: Vec2::new(phase.sin(), 1.0),
            yaw: phase,
            buttons: if firing { Buttons::FIRE } else { Buttons::empty() },
            ..SimulationInput::default()
        }
    }
}

fn idle(_: usize) -> SimulationInput {
    SimulationInput::default()
}

#[test]
fn clients_converge_after_a_lossy_stretch() {
    let mut session = Session::new(42, 2);
    session.set_conditions(PacketLossSimulation::lossy(0.1, 20, 40));

    for frame in 0..600 {
        session.frame(wander(frame));
    }
    for (client, _) in &session.clients {
        assert_eq!(client.state(), ConnectionState::Connected);
        assert!(client.stats().rollbacks > 0);
    }

    // Heal the link and stop moving; velocities need a while to decay.
    session.set_conditions(PacketLossSimulation::default());
    for _ in 0..600 {
        session.frame(idle);
    }

    let server_checksum = session.server.world().checksum();
    for (client, _) in &session.clients {
        assert_eq!(client.replica().checksum(), server_checksum);
        assert_eq!(client.confirmed_tick(), Some(session.server.tick()));
        assert_eq!(client.local_entities().len(), 1);
    }
}

#[test]
fn idle_prediction_matches_the_server() {
    let mut session = Session::new(3, 1);
    for _ in 0..120 {
        session.frame(idle);
    }

    // Let the server catch up with what the client already predicted,
    // without telling the client anything new.
    let predicted_tick = session.clients[0].0.tick();
    session.server.poll(&mut session.server_link).unwrap();
    while session.server.tick() < predicted_tick {
        session.server.step();
    }

    let client = &session.clients[0].0;
    let predicted = client.predicted_history().by_tick(predicted_tick).unwrap();
    let authoritative = session.server.history().by_tick(predicted_tick).unwrap();
    assert_eq!(
        session.checksum_of(predicted),
        session.checksum_of(authoritative)
    );
}

#[test]
fn same_seed_same_session() {
    let run = || {
        let mut session = Session::new(11, 2);
        session.set_conditions(PacketLossSimulation::lossy(0.2, 10, 50));
        for frame in 0..300 {
            session.frame(wander(frame));
        }
        session.server.world().checksum()
    };
    assert_eq!(run(), run());
}
