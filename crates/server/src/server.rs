use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use snapline::arena::Arena;
use snapline::{ServerEngine, ServerEvent, Transport, World};

use crate::config::ServerConfig;
use crate::link::TokioLink;

pub struct GameServer {
    engine: ServerEngine<Arena>,
    link: TokioLink,
    last_update: Instant,
    last_report: Instant,
    stats_interval: Duration,
}

impl GameServer {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let registry = Arena::registry(config.avatar_capacity)?;
        let arena = Arena::new(&registry, config.arena)?;
        let engine = ServerEngine::new(config.engine.clone(), arena, World::new(registry))?;
        let link = TokioLink::bind(&config.bind_addr, config.global_packet_loss).await?;
        let now = Instant::now();

        Ok(Self {
            engine,
            link,
            last_update: now,
            last_report: now,
            stats_interval: config.stats_interval,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.link.local_addr()
    }

    pub fn tick_rate(&self) -> u32 {
        self.engine.config().tick_rate
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f32(self.engine.config().tick_dt())
    }

    /// One pass of the loop: receive, run due ticks, send.
    pub fn tick_once(&mut self) -> Result<()> {
        let now = Instant::now();
        let delta = now - self.last_update;
        self.last_update = now;

        self.engine.poll(&mut self.link)?;
        self.engine.update(delta.as_secs_f32());
        self.engine.flush(&mut self.link)?;
        self.link.release_delayed()?;

        self.log_events();
        for hit in self.engine.simulation_mut().take_hits() {
            log::info!(
                "tick {}: {} hit {} at {:.1}m{}",
                hit.tick,
                hit.shooter,
                hit.target,
                hit.distance,
                if hit.killed { " (kill)" } else { "" }
            );
        }

        if now - self.last_report >= self.stats_interval {
            self.last_report = now;
            self.report();
        }
        Ok(())
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.engine.shutdown_connections();
        self.engine.flush(&mut self.link)?;
        self.log_events();
        Ok(())
    }

    fn log_events(&mut self) {
        for event in self.engine.drain_events() {
            match event {
                ServerEvent::ClientConnected { client_id, addr } => {
                    log::info!("{} connected from {}", client_id, addr);
                }
                ServerEvent::ClientDisconnected { client_id, reason } => {
                    log::info!("{} {}", client_id, reason.as_str());
                }
                ServerEvent::ConnectionDenied { addr, reason } => {
                    log::warn!("connection denied to {}: {}", addr, reason);
                }
            }
        }
    }

    fn report(&self) {
        let stats = self.engine.stats();
        let net = self.link.stats();
        log::info!(
            "tick {} | {} clients | {} entities | {} fragments ({} B) | {} deferred | {} inputs rejected | {} sent / {} received / {} dropped",
            stats.tick,
            stats.client_count,
            stats.entity_count,
            stats.fragments_sent,
            stats.payload_bytes_sent,
            stats.deferred_entities,
            stats.inputs_rejected,
            net.packets_sent,
            net.packets_received,
            net.packets_dropped,
        );
    }
}
