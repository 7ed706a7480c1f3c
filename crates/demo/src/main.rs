use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use glam::Vec2;
use snapline::arena::{Arena, ArenaSettings};
use snapline::{
    Buttons, ClientEngine, ClientEvent, EngineConfig, MemoryNetwork, MemoryTransport,
    PacketLossSimulation, ServerEngine, ServerEvent, SimulationInput, Transport, World,
};

#[derive(Parser)]
#[command(name = "snapline-demo")]
#[command(about = "In-process arena session over a simulated lossy link")]
struct Args {
    #[arg(long, default_value_t = 7, help = "Seed for the simulated network")]
    seed: u64,

    #[arg(short, long, default_value_t = 2)]
    clients: usize,

    #[arg(short, long, default_value_t = 20, help = "Simulated seconds of play")]
    seconds: u32,

    #[arg(long, default_value_t = 5.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 30, help = "Minimum one-way latency in ms")]
    min_latency: u32,

    #[arg(long, default_value_t = 80, help = "Maximum one-way latency in ms")]
    max_latency: u32,

    #[arg(long, default_value_t = 120, help = "Render frames per simulated second")]
    fps: u32,

    #[arg(long, default_value_t = 5, help = "Simulated seconds between reports")]
    report_every: u32,
}

struct Player {
    engine: ClientEngine<Arena>,
    link: MemoryTransport,
}

/// Scripted input: each player circles at its own phase and fires now and
/// then.
fn script(player: usize, frame: u64) -> SimulationInput {
    let phase = frame as f32 * 0.01 + player as f32 * 1.7;
    let firing = (frame + player as u64 * 13) % 90 == 0;
    SimulationInput {
        movement: Vec2::new(phase.cos(), phase.sin()),
        yaw: phase + std::f32::consts::FRAC_PI_2,
        buttons: if firing { Buttons::FIRE } else { Buttons::empty() },
        ..SimulationInput::default()
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = EngineConfig::default();
    if let Err(e) = config.validate() {
        log::error!("invalid configuration: {}", e);
        return Err(e.into());
    }

    let network = MemoryNetwork::new(args.seed);
    let registry = Arena::registry(args.clients.max(1) as u32)?;
    let mut server_link = network.endpoint();
    let mut server = ServerEngine::new(
        config.clone(),
        Arena::new(&registry, ArenaSettings::default())?,
        World::new(Arc::clone(&registry)),
    )?;

    let mut players = Vec::with_capacity(args.clients);
    for _ in 0..args.clients {
        let arena = Arena::new(&registry, ArenaSettings::default())?;
        let position = arena.avatar().position;
        let mut engine = ClientEngine::new(
            config.clone(),
            arena,
            World::new(Arc::clone(&registry)),
            server_link.local_addr(),
        )?
        .with_smoothing(position);
        engine.connect();
        players.push(Player {
            engine,
            link: network.endpoint(),
        });
    }

    let conditions = PacketLossSimulation::lossy(
        (args.loss_percent / 100.0).clamp(0.0, 1.0),
        args.min_latency,
        args.max_latency,
    );
    network.set_conditions(server_link.local_addr(), conditions);
    for player in &players {
        network.set_conditions(player.link.local_addr(), conditions);
    }
    log::info!(
        "{} clients, {:.1}% loss, {}-{} ms latency, seed {}",
        args.clients,
        args.loss_percent,
        args.min_latency,
        args.max_latency,
        args.seed
    );

    let fps = args.fps.max(1);
    let dt = 1.0 / fps as f32;
    let play_frames = u64::from(args.seconds) * u64::from(fps);
    let report_frames = u64::from(args.report_every.max(1)) * u64::from(fps);
    let idle_frames = 3 * u64::from(fps);

    for frame in 0..play_frames + idle_frames {
        if frame == play_frames {
            log::info!("healing the link and letting everyone stand still");
            network.set_conditions(server_link.local_addr(), PacketLossSimulation::default());
            for player in &players {
                network.set_conditions(player.link.local_addr(), PacketLossSimulation::default());
            }
        }

        network.advance(Duration::from_secs_f32(dt));
        server.poll(&mut server_link)?;
        server.update(dt);
        server.flush(&mut server_link)?;
        for event in server.drain_events() {
            match event {
                ServerEvent::ClientConnected { client_id, addr } => {
                    log::info!("server: {} joined from {}", client_id, addr)
                }
                ServerEvent::ClientDisconnected { client_id, reason } => {
                    log::info!("server: {} {}", client_id, reason.as_str())
                }
                ServerEvent::ConnectionDenied { addr, reason } => {
                    log::warn!("server: denied {}: {}", addr, reason)
                }
            }
        }
        for hit in server.simulation_mut().take_hits() {
            log::info!(
                "tick {}: {} hit {} from {:.1}m{}",
                hit.tick,
                hit.shooter,
                hit.target,
                hit.distance,
                if hit.killed { ", kill" } else { "" }
            );
        }

        for (index, player) in players.iter_mut().enumerate() {
            let input = if frame < play_frames {
                script(index, frame)
            } else {
                SimulationInput::default()
            };
            player.engine.poll(&mut player.link)?;
            player.engine.update(dt, input);
            player.engine.flush(&mut player.link)?;
            for event in player.engine.drain_events() {
                match event {
                    ClientEvent::Desynced { tick } => {
                        log::warn!("client {}: desync at tick {}", index, tick)
                    }
                    other => log::debug!("client {}: {:?}", index, other),
                }
            }
        }

        if frame > 0 && frame % report_frames == 0 {
            report(&server, &players);
        }
    }

    report(&server, &players);
    let mut scratch = World::new(Arc::clone(&registry));
    let mut diverged = 0;
    for (index, player) in players.iter().enumerate() {
        let Some(tick) = player.engine.confirmed_tick() else {
            log::warn!("client {}: never received server state", index);
            diverged += 1;
            continue;
        };
        // Compare against what the server held at the same tick.
        let authoritative = server.history().by_tick(tick)?;
        scratch.restore_from(authoritative);
        let expected = scratch.checksum();
        let replica = player.engine.replica().checksum();
        if replica == expected {
            log::info!("client {}: tick {} matches the server ({:016x})", index, tick, replica);
        } else {
            log::warn!(
                "client {}: tick {} replica {:016x} differs from server {:016x}",
                index,
                tick,
                replica,
                expected
            );
            diverged += 1;
        }
    }
    if diverged > 0 {
        bail!("{} of {} replicas diverged", diverged, players.len());
    }
    Ok(())
}

fn report(server: &ServerEngine<Arena>, players: &[Player]) {
    let stats = server.stats();
    log::info!(
        "server tick {} | {} entities | {} fragments ({} B) | {} deferred",
        stats.tick,
        stats.entity_count,
        stats.fragments_sent,
        stats.payload_bytes_sent,
        stats.deferred_entities
    );

    let position = server.simulation().avatar().position;
    for (index, player) in players.iter().enumerate() {
        let client = &player.engine;
        let stats = client.stats();
        // How far the smoothed avatar sits from where the server has it now.
        let error = client.local_entities().first().and_then(|&id| {
            let shown = client.smoother()?.visual_position(client.predicted_world(), id)?;
            let actual = server.world().view(id)?.get(position);
            Some(shown.distance(actual))
        });
        log::info!(
            "client {}: tick {} confirmed {:?} | rtt {} | {} rollbacks ({} ticks resimulated) | {} stalls | {} discarded ticks | visual error {}",
            index,
            client.tick(),
            client.confirmed_tick(),
            stats.rtt_ms.map_or_else(|| "-".to_string(), |ms| format!("{:.0} ms", ms)),
            stats.rollbacks,
            stats.resimulated_ticks,
            stats.stalls,
            stats.discarded_ticks,
            error.map_or_else(|| "-".to_string(), |e| format!("{:.2}", e)),
        );
    }
}
