//! Identifiers shared by every stage of the pipeline.

use std::fmt;

pub type PacketNum = u64;
pub type StreamId = u64;

/// Independent packet-number sequences, each with its own ack state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PacketNumberSpace {
    Initial,
    Handshake,
    AppData,
}

impl fmt::Display for PacketNumberSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketNumberSpace::Initial => "initial",
            PacketNumberSpace::Handshake => "handshake",
            PacketNumberSpace::AppData => "app-data",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionLevel {
    Initial,
    Handshake,
    EarlyData,
    AppData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtectionType {
    Initial,
    Handshake,
    ZeroRtt,
    KeyPhaseZero,
    KeyPhaseOne,
}

impl ProtectionType {
    pub fn encryption_level(self) -> EncryptionLevel {
        match self {
            ProtectionType::Initial => EncryptionLevel::Initial,
            ProtectionType::Handshake => EncryptionLevel::Handshake,
            ProtectionType::ZeroRtt => EncryptionLevel::EarlyData,
            ProtectionType::KeyPhaseZero | ProtectionType::KeyPhaseOne => {
                EncryptionLevel::AppData
            }
        }
    }

    /// Initial and Handshake protected packets carry the handshake proper.
    /// 1-RTT crypto frames (session tickets) do not count.
    pub fn is_handshake(self) -> bool {
        matches!(self, ProtectionType::Initial | ProtectionType::Handshake)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderForm {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Client,
    Server,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Client => f.write_str("client"),
            NodeType::Server => f.write_str("server"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuicVersion(pub u32);

impl QuicVersion {
    pub const V1: QuicVersion = QuicVersion(0x0000_0001);
}

// ─── Connection ID ──────────────────────────────────────────────────────────

pub const MAX_CONNECTION_ID_LEN: usize = 20;

/// A connection id of 0..=20 bytes, stored inline.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CONNECTION_ID_LEN],
}

impl ConnectionId {
    /// Returns `None` if `data` is longer than 20 bytes.
    pub fn new(data: &[u8]) -> Option<Self> {
        if data.len() > MAX_CONNECTION_ID_LEN {
            return None;
        }
        let mut bytes = [0u8; MAX_CONNECTION_ID_LEN];
        bytes[..data.len()].copy_from_slice(data);
        Some(ConnectionId {
            len: data.len() as u8,
            bytes,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({self})")
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

// ─── Packet Event ───────────────────────────────────────────────────────────

/// Names the original packet a clone was made from. Every clone of the same
/// packet carries the same event, so acking any one of them settles all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketEvent {
    pub space: PacketNumberSpace,
    pub packet_num: PacketNum,
}

impl PacketEvent {
    pub fn new(space: PacketNumberSpace, packet_num: PacketNum) -> Self {
        PacketEvent { space, packet_num }
    }
}
