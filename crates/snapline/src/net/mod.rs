//! Replication wire protocol: packet codec, per-receiver delta encoding,
//! fragment reassembly and the transports underneath.

mod connection;
mod decoder;
mod encoder;
mod priority;
mod protocol;
mod transport;

pub use connection::{ClientConnection, ConnectionManager, ConnectionState};
pub use decoder::{DecodedTick, EntityRecord, FragmentAssembler};
pub use encoder::{EncodedTick, ReplicationSender, fragment};
pub use priority::{Candidate, DeclaredPriority, DistancePriority, PriorityPolicy, schedule};
pub use protocol::{
    ArchivedPacket, ENTITY_HEADER_SIZE, FRAGMENT_OVERHEAD, Fragment, MAX_BLOCK_SIZE,
    MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE, MIN_FRAGMENT_SIZE, PAYLOAD_HEADER_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION, Packet, PacketError, PacketHeader,
    PacketType, REMOVAL_SIZE, sequence_greater_than,
};
pub use transport::{
    MemoryNetwork, MemoryTransport, NetworkStats, PacketLossSimulation, Transport, UdpTransport,
};
