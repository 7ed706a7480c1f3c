use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use rand::SeedableRng;
use rand::rngs::StdRng;
use snapline::net::{MAX_PACKET_SIZE, NetworkStats};
use snapline::{Packet, PacketLossSimulation, Transport};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Queued datagrams before the receive task starts dropping.
const RECEIVE_QUEUE: usize = 4096;

struct Delayed {
    due: Instant,
    data: Vec<u8>,
    addr: SocketAddr,
}

/// UDP link whose socket is read by a tokio task.
///
/// The task only moves raw datagrams into a channel; decoding happens in
/// [`Transport::receive`] on the tick loop. Sends go straight out through
/// `try_send_to`, or through a delay queue when loss simulation is on.
pub struct TokioLink {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<(Vec<u8>, SocketAddr)>,
    stats: NetworkStats,
    conditions: Option<PacketLossSimulation>,
    delayed: VecDeque<Delayed>,
    rng: StdRng,
}

impl TokioLink {
    pub async fn bind(addr: &str, conditions: Option<PacketLossSimulation>) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (tx, incoming) = mpsc::channel(RECEIVE_QUEUE);

        let reader = Arc::clone(&socket);
        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_PACKET_SIZE];
            loop {
                match reader.recv_from(&mut buffer).await {
                    Ok((size, addr)) => {
                        if tx.try_send((buffer[..size].to_vec(), addr)).is_err() && tx.is_closed()
                        {
                            break;
                        }
                    }
                    Err(e) => log::warn!("udp receive failed: {}", e),
                }
            }
            log::debug!("receive task stopped");
        });

        Ok(Self {
            socket,
            local_addr,
            incoming,
            stats: NetworkStats::default(),
            conditions: conditions.filter(|c| c.enabled),
            delayed: VecDeque::new(),
            rng: StdRng::from_os_rng(),
        })
    }

    /// Sends every delayed datagram whose time has come.
    pub fn release_delayed(&mut self) -> io::Result<()> {
        let now = Instant::now();
        while self.delayed.front().is_some_and(|d| d.due <= now) {
            let Some(datagram) = self.delayed.pop_front() else {
                break;
            };
            self.send_raw(&datagram.data, datagram.addr)?;
        }
        Ok(())
    }

    fn send_raw(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        match self.socket.try_send_to(data, addr) {
            Ok(bytes) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += bytes as u64;
                Ok(bytes)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.stats.packets_dropped += 1;
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}

impl Transport for TokioLink {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn send_to(&mut self, packet: &Packet, addr: SocketAddr) -> io::Result<usize> {
        let data = packet
            .serialize()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        let Some(conditions) = self.conditions else {
            return self.send_raw(&data, addr);
        };
        if conditions.should_drop(&mut self.rng) {
            self.stats.packets_dropped += 1;
            return Ok(0);
        }
        let due = Instant::now() + conditions.delay(&mut self.rng);
        let at = self.delayed.partition_point(|d| d.due <= due);
        self.delayed.insert(at, Delayed { due, data, addr });
        Ok(0)
    }

    fn receive(&mut self) -> io::Result<Vec<(Packet, SocketAddr)>> {
        let mut packets = Vec::new();
        while let Ok((data, addr)) = self.incoming.try_recv() {
            match Packet::decode(&data) {
                Ok(packet) => {
                    self.stats.packets_received += 1;
                    self.stats.bytes_received += data.len() as u64;
                    packets.push((packet, addr));
                }
                Err(e) => {
                    self.stats.packets_rejected += 1;
                    log::trace!("rejected {} byte datagram from {}: {}", data.len(), addr, e);
                }
            }
        }
        Ok(packets)
    }

    fn stats(&self) -> NetworkStats {
        self.stats
    }
}
