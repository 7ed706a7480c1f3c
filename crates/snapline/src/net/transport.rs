//! Unreliable datagram delivery. Nothing above this layer may assume
//! ordering or delivery.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::protocol::{MAX_PACKET_SIZE, Packet};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Datagrams that failed to decode or carried a foreign header.
    pub packets_rejected: u64,
    /// Datagrams the link simulation threw away.
    pub packets_dropped: u64,
}

pub trait Transport {
    fn local_addr(&self) -> SocketAddr;

    fn send_to(&mut self, packet: &Packet, addr: SocketAddr) -> io::Result<usize>;

    /// Every datagram that has arrived since the last call. Never blocks.
    fn receive(&mut self) -> io::Result<Vec<(Packet, SocketAddr)>>;

    fn stats(&self) -> NetworkStats;
}

fn encode(packet: &Packet) -> io::Result<Vec<u8>> {
    packet
        .serialize()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

/// Non-blocking std UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    stats: NetworkStats,
    recv_buffer: [u8; MAX_PACKET_SIZE],
}

impl UdpTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            stats: NetworkStats::default(),
            recv_buffer: [0u8; MAX_PACKET_SIZE],
        })
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn send_to(&mut self, packet: &Packet, addr: SocketAddr) -> io::Result<usize> {
        let data = encode(packet)?;
        let bytes = self.socket.send_to(&data, addr)?;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes as u64;
        Ok(bytes)
    }

    fn receive(&mut self) -> io::Result<Vec<(Packet, SocketAddr)>> {
        let mut packets = Vec::new();
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => match Packet::decode(&self.recv_buffer[..size]) {
                    Ok(packet) => {
                        self.stats.packets_received += 1;
                        self.stats.bytes_received += size as u64;
                        packets.push((packet, addr));
                    }
                    Err(e) => {
                        self.stats.packets_rejected += 1;
                        log::trace!("rejected {} byte datagram from {}: {}", size, addr, e);
                    }
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(packets)
    }

    fn stats(&self) -> NetworkStats {
        self.stats
    }
}

/// Link conditions applied to everything one endpoint sends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    /// Fraction of datagrams lost, 0..=1.
    pub loss: f32,
    pub min_latency_ms: u32,
    pub max_latency_ms: u32,
    pub jitter_ms: u32,
}

impl PacketLossSimulation {
    pub fn lossy(loss: f32, min_latency_ms: u32, max_latency_ms: u32) -> Self {
        Self {
            enabled: true,
            loss,
            min_latency_ms,
            max_latency_ms,
            jitter_ms: 0,
        }
    }

    pub fn should_drop(&self, rng: &mut impl Rng) -> bool {
        if !self.enabled || self.loss <= 0.0 {
            return false;
        }
        rng.random::<f32>() < self.loss
    }

    pub fn delay(&self, rng: &mut impl Rng) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        let base = self.min_latency_ms.min(self.max_latency_ms);
        let spread = self.max_latency_ms.saturating_sub(base);
        let mut ms = base;
        if spread > 0 {
            ms += rng.random_range(0..=spread);
        }
        if self.jitter_ms > 0 {
            ms += rng.random_range(0..=self.jitter_ms);
        }
        Duration::from_millis(ms as u64)
    }
}

#[derive(Debug)]
struct DelayedPacket {
    release_time: Duration,
    order: u64,
    from: SocketAddr,
    data: Vec<u8>,
}

impl PartialEq for DelayedPacket {
    fn eq(&self, other: &Self) -> bool {
        self.release_time == other.release_time && self.order == other.order
    }
}

impl Eq for DelayedPacket {}

impl PartialOrd for DelayedPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedPacket {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the heap pops the earliest release first.
        (other.release_time, other.order).cmp(&(self.release_time, self.order))
    }
}

#[derive(Debug)]
struct Hub {
    now: Duration,
    next_port: u16,
    next_order: u64,
    inboxes: HashMap<SocketAddr, BinaryHeap<DelayedPacket>>,
    conditions: HashMap<SocketAddr, PacketLossSimulation>,
    rng: ChaCha8Rng,
}

/// In-process datagram network with a virtual clock.
///
/// Time only moves when [`advance`](Self::advance) is called, and loss and
/// latency come from a seeded generator, so a run is reproducible.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new(seed: u64) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                now: Duration::ZERO,
                next_port: 40_000,
                next_order: 0,
                inboxes: HashMap::new(),
                conditions: HashMap::new(),
                rng: ChaCha8Rng::seed_from_u64(seed),
            })),
        }
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a new endpoint on a fresh loopback address.
    pub fn endpoint(&self) -> MemoryTransport {
        let mut hub = self.hub();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), hub.next_port);
        hub.next_port = hub.next_port.wrapping_add(1);
        hub.inboxes.insert(addr, BinaryHeap::new());
        MemoryTransport {
            network: self.clone(),
            addr,
            stats: NetworkStats::default(),
        }
    }

    /// Applies `conditions` to every datagram sent from `from`.
    pub fn set_conditions(&self, from: SocketAddr, conditions: PacketLossSimulation) {
        let mut hub = self.hub();
        if conditions.enabled {
            hub.conditions.insert(from, conditions);
        } else {
            hub.conditions.remove(&from);
        }
    }

    pub fn advance(&self, dt: Duration) {
        self.hub().now += dt;
    }

    pub fn now(&self) -> Duration {
        self.hub().now
    }

    /// Datagrams queued but not yet delivered, network-wide.
    pub fn in_transit(&self) -> usize {
        self.hub().inboxes.values().map(BinaryHeap::len).sum()
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    addr: SocketAddr,
    stats: NetworkStats,
}

impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn send_to(&mut self, packet: &Packet, addr: SocketAddr) -> io::Result<usize> {
        let data = encode(packet)?;
        let len = data.len();
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += len as u64;

        let mut hub = self.network.hub();
        let hub = &mut *hub;
        let conditions = hub.conditions.get(&self.addr).copied().unwrap_or_default();
        if conditions.should_drop(&mut hub.rng) {
            self.stats.packets_dropped += 1;
            return Ok(len);
        }
        let release_time = hub.now + conditions.delay(&mut hub.rng);
        let order = hub.next_order;
        hub.next_order += 1;
        // Like UDP, sending to nobody succeeds and goes nowhere.
        if let Some(inbox) = hub.inboxes.get_mut(&addr) {
            inbox.push(DelayedPacket {
                release_time,
                order,
                from: self.addr,
                data,
            });
        }
        Ok(len)
    }

    fn receive(&mut self) -> io::Result<Vec<(Packet, SocketAddr)>> {
        let mut arrived = Vec::new();
        {
            let mut hub = self.network.hub();
            let now = hub.now;
            if let Some(inbox) = hub.inboxes.get_mut(&self.addr) {
                while inbox.peek().is_some_and(|p| p.release_time <= now) {
                    if let Some(delayed) = inbox.pop() {
                        arrived.push(delayed);
                    }
                }
            }
        }

        let mut packets = Vec::with_capacity(arrived.len());
        for delayed in arrived {
            match Packet::decode(&delayed.data) {
                Ok(packet) => {
                    self.stats.packets_received += 1;
                    self.stats.bytes_received += delayed.data.len() as u64;
                    packets.push((packet, delayed.from));
                }
                Err(_) => self.stats.packets_rejected += 1,
            }
        }
        Ok(packets)
    }

    fn stats(&self) -> NetworkStats {
        self.stats
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.hub().inboxes.remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::{PacketHeader, PacketType};

    fn ping(sequence: u32) -> Packet {
        Packet::new(
            PacketHeader::new(sequence),
            PacketType::Ping {
                timestamp: sequence as u64,
            },
        )
    }

    #[test]
    fn latency_holds_packets_until_due() {
        let network = MemoryNetwork::new(1);
        let mut a = network.endpoint();
        let mut b = network.endpoint();
        network.set_conditions(a.local_addr(), PacketLossSimulation::lossy(0.0, 30, 30));

        a.send_to(&ping(1), b.local_addr()).unwrap();
        network.advance(Duration::from_millis(29));
        assert!(b.receive().unwrap().is_empty());
        network.advance(Duration::from_millis(1));
        let packets = b.receive().unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].1, a.local_addr());
    }

    #[test]
    fn same_seed_drops_the_same_packets() {
        let run = |seed| {
            let network = MemoryNetwork::new(seed);
            let mut a = network.endpoint();
            let mut b = network.endpoint();
            network.set_conditions(a.local_addr(), PacketLossSimulation::lossy(0.3, 0, 0));
            for sequence in 0..200 {
                a.send_to(&ping(sequence), b.local_addr()).unwrap();
            }
            b.receive()
                .unwrap()
                .into_iter()
                .map(|(p, _)| p.header.sequence)
                .collect::<Vec<_>>()
        };
        let first = run(9);
        assert_eq!(first, run(9));
        assert!(first.len() > 100 && first.len() < 180);
    }

    #[test]
    fn no_conditions_means_instant_delivery_in_order() {
        let network = MemoryNetwork::new(0);
        let mut a = network.endpoint();
        let mut b = network.endpoint();
        for sequence in 0..5 {
            a.send_to(&ping(sequence), b.local_addr()).unwrap();
        }
        let order: Vec<u32> = b
            .receive()
            .unwrap()
            .into_iter()
            .map(|(p, _)| p.header.sequence)
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(a.stats().packets_sent, 5);
        assert_eq!(b.stats().packets_received, 5);
    }
}
