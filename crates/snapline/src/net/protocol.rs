use rkyv::{Archive, Deserialize, Serialize, rancor};

pub const MAX_PACKET_SIZE: usize = 1200;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x534E_504C;

/// Worst-case rkyv framing around a fragment's bytes: header, enum tag,
/// fragment fields and alignment padding.
pub const FRAGMENT_OVERHEAD: usize = 64;

/// tick u32, baseline u32, entity count u16, removal count u16.
pub const PAYLOAD_HEADER_SIZE: usize = 12;
/// id u64, type u16, authority u32, block length u16.
pub const ENTITY_HEADER_SIZE: usize = 16;
pub const REMOVAL_SIZE: usize = 8;

/// Largest payload a sender may produce or a receiver will reassemble.
pub const MAX_PAYLOAD_SIZE: usize = 1 << 20;
/// Block lengths travel as u16.
pub const MAX_BLOCK_SIZE: usize = u16::MAX as usize;
/// Fragment counts travel as u16, so a full payload must split into at most
/// `u16::MAX` pieces.
pub const MIN_FRAGMENT_SIZE: usize = MAX_PAYLOAD_SIZE.div_ceil(u16::MAX as usize);

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u32,
    pub sequence: u32,
}

impl PacketHeader {
    pub fn new(sequence: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            sequence,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

/// One wire-sized piece of a tick's replication payload, addressed by its
/// byte range in the reassembled whole.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Fragment {
    pub tick: u32,
    pub total_len: u32,
    pub offset: u32,
    pub index: u16,
    pub count: u16,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum PacketType {
    ConnectionRequest {
        client_salt: u64,
    },
    ConnectionAccepted {
        client_id: u32,
        tick: u32,
        tick_rate: u32,
    },
    ConnectionDenied {
        reason: String,
    },
    /// `SimulationInput::encode_batch` bytes, newest last.
    Input {
        inputs: Vec<u8>,
    },
    SnapshotFragment(Fragment),
    /// Last tick the receiver applied in full.
    Ack {
        tick: u32,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: PacketType,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("bad magic or protocol version")]
    InvalidHeader,
    #[error("packet of {0} bytes exceeds the MTU")]
    TooLarge(usize),
}

impl Packet {
    pub fn new(header: PacketHeader, payload: PacketType) -> Self {
        Self { header, payload }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let bytes = rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)?;
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        rkyv::from_bytes::<Self, rancor::Error>(data).map_err(PacketError::Deserialize)
    }

    /// `deserialize` plus the magic/version check every receive path wants.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        let packet = Self::deserialize(data)?;
        if !packet.header.is_valid() {
            return Err(PacketError::InvalidHeader);
        }
        Ok(packet)
    }

    pub fn access_archived(data: &[u8]) -> Result<&ArchivedPacket, PacketError> {
        rkyv::access::<ArchivedPacket, rancor::Error>(data).map_err(PacketError::Deserialize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_comparison() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
    }

    #[test]
    fn full_fragment_fits_the_mtu() {
        let fragment = Fragment {
            tick: u32::MAX,
            total_len: u32::MAX,
            offset: u32::MAX,
            index: u16::MAX,
            count: u16::MAX,
            bytes: vec![0xAB; MAX_PACKET_SIZE - FRAGMENT_OVERHEAD],
        };
        let packet = Packet::new(PacketHeader::new(7), PacketType::SnapshotFragment(fragment));
        let bytes = packet.serialize().unwrap();
        assert!(bytes.len() <= MAX_PACKET_SIZE);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn foreign_header_is_rejected() {
        let mut header = PacketHeader::new(1);
        header.magic = 0x4455_414C;
        let bytes = Packet::new(header, PacketType::Disconnect).serialize().unwrap();
        assert!(Packet::deserialize(&bytes).is_ok());
        assert!(matches!(Packet::decode(&bytes), Err(PacketError::InvalidHeader)));

        let archived = Packet::access_archived(&bytes).unwrap();
        assert_eq!(archived.header.sequence.to_native(), 1);
    }
}
