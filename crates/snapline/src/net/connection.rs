use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::world::ClientId;

const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Server-side record of one peer. Times are engine time, not wall time,
/// so simulated links time out the same way real ones do.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    pub addr: SocketAddr,
    pub client_id: ClientId,
    pub state: ConnectionState,
    pub client_salt: u64,
    pub connected_at: Duration,
    pub last_receive_time: Duration,
    pub send_sequence: u32,
}

impl ClientConnection {
    pub fn new(addr: SocketAddr, client_id: ClientId, client_salt: u64, now: Duration) -> Self {
        Self {
            addr,
            client_id,
            state: ConnectionState::Connecting,
            client_salt,
            connected_at: now,
            last_receive_time: now,
            send_sequence: 0,
        }
    }

    pub fn is_timed_out(&self, now: Duration, timeout: Duration) -> bool {
        now.saturating_sub(self.last_receive_time) > timeout
    }

    pub fn touch(&mut self, now: Duration) {
        self.last_receive_time = self.last_receive_time.max(now);
    }

    pub fn next_sequence(&mut self) -> u32 {
        let sequence = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        sequence
    }
}

#[derive(Debug)]
pub struct ConnectionManager {
    clients_by_addr: HashMap<SocketAddr, ClientId>,
    clients: HashMap<ClientId, ClientConnection>,
    next_client_id: u32,
    max_clients: usize,
    timeout: Duration,
}

impl ConnectionManager {
    pub fn new(max_clients: usize) -> Self {
        Self::with_timeout(max_clients, DEFAULT_TIMEOUT_SECS)
    }

    pub fn with_timeout(max_clients: usize, timeout_secs: u64) -> Self {
        Self {
            clients_by_addr: HashMap::new(),
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// The existing connection for `addr`, or a new one when there is room.
    /// The bool is true when the connection was created by this call.
    pub fn get_or_create(
        &mut self,
        addr: SocketAddr,
        client_salt: u64,
        now: Duration,
    ) -> Result<(&mut ClientConnection, bool), &'static str> {
        if let Some(&client_id) = self.clients_by_addr.get(&addr) {
            return self
                .clients
                .get_mut(&client_id)
                .map(|connection| (connection, false))
                .ok_or("connection table out of sync");
        }

        if self.clients.len() >= self.max_clients {
            return Err("server full");
        }

        let client_id = ClientId(self.next_client_id);
        self.next_client_id += 1;

        self.clients_by_addr.insert(addr, client_id);
        let connection = self
            .clients
            .entry(client_id)
            .or_insert_with(|| ClientConnection::new(addr, client_id, client_salt, now));
        Ok((connection, true))
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&ClientConnection> {
        self.clients_by_addr
            .get(addr)
            .and_then(|id| self.clients.get(id))
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut ClientConnection> {
        let id = self.clients_by_addr.get(addr)?;
        self.clients.get_mut(id)
    }

    pub fn get(&self, client_id: ClientId) -> Option<&ClientConnection> {
        self.clients.get(&client_id)
    }

    pub fn get_mut(&mut self, client_id: ClientId) -> Option<&mut ClientConnection> {
        self.clients.get_mut(&client_id)
    }

    pub fn remove(&mut self, client_id: ClientId) -> Option<ClientConnection> {
        let connection = self.clients.remove(&client_id)?;
        self.clients_by_addr.remove(&connection.addr);
        Some(connection)
    }

    pub fn remove_by_addr(&mut self, addr: &SocketAddr) -> Option<ClientConnection> {
        let client_id = self.clients_by_addr.remove(addr)?;
        self.clients.remove(&client_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientConnection> {
        self.clients.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientConnection> {
        self.clients.values_mut()
    }

    /// Client ids in ascending order, for deterministic iteration.
    pub fn ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.clients.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn cleanup_timed_out(&mut self, now: Duration) -> Vec<ClientConnection> {
        let timed_out: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| c.is_timed_out(now, self.timeout))
            .map(|(&id, _)| id)
            .collect();

        timed_out.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn connected_count(&self) -> usize {
        self.clients
            .values()
            .filter(|c| c.state == ConnectionState::Connected)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.clients.len()
    }
}
