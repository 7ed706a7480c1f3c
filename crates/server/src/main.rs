mod config;
mod link;
mod server;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, MissedTickBehavior};

use config::ServerConfig;
use server::GameServer;
use snapline::{EngineConfig, PacketLossSimulation};

#[derive(Parser)]
#[command(name = "snapline-server")]
#[command(about = "Authoritative snapline arena server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = snapline::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = snapline::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,

    #[arg(long, default_value_t = 4096, help = "Replication budget per client per tick")]
    max_bytes_per_tick: usize,

    #[arg(long, default_value_t = 64, help = "Ticks of history kept for acks and lag compensation")]
    history_depth: usize,

    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    #[arg(long, default_value_t = 5, help = "Seconds between stats lines")]
    stats_interval: u64,

    #[arg(long, help = "Enable global packet loss simulation")]
    simulate_packet_loss: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 0, help = "Minimum latency in ms")]
    min_latency: u32,

    #[arg(long, default_value_t = 0, help = "Maximum latency in ms")]
    max_latency: u32,

    #[arg(long, default_value_t = 0, help = "Jitter in ms")]
    jitter: u32,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let global_packet_loss = self.simulate_packet_loss.then(|| PacketLossSimulation {
            enabled: true,
            loss: (self.loss_percent / 100.0).clamp(0.0, 1.0),
            min_latency_ms: self.min_latency,
            max_latency_ms: self.max_latency,
            jitter_ms: self.jitter,
        });

        ServerConfig {
            bind_addr: format!("{}:{}", self.bind, self.port),
            engine: EngineConfig {
                tick_rate: self.tick_rate,
                max_clients: self.max_clients,
                max_bytes_per_tick: self.max_bytes_per_tick,
                history_depth: self.history_depth,
                connection_timeout_secs: self.timeout_secs,
                ..Default::default()
            },
            avatar_capacity: self.max_clients as u32,
            stats_interval: Duration::from_secs(self.stats_interval.max(1)),
            global_packet_loss,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    if let Err(e) = config.engine.validate() {
        log::error!("invalid configuration: {}", e);
        return Err(e.into());
    }

    let mut server = GameServer::new(config).await?;
    log::info!(
        "Server started on {} at {} Hz",
        server.local_addr(),
        server.tick_rate()
    );

    let mut interval = time::interval(server.tick_duration() / 2);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => server.tick_once()?,
            result = &mut shutdown => {
                result?;
                break;
            }
        }
    }

    log::info!("Server shutting down");
    server.shutdown()?;
    Ok(())
}
