//! Fakes shared by the unit tests.

use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

use crate::batch::DatagramSocket;
use crate::config::TransportSettings;
use crate::congestion::CongestionController;
use crate::crypto::{Aead, PacketNumberCipher, Sample, HEADER_MASK_LEN};
use crate::error::CryptoError;
use crate::header::{HeaderBuilder, PacketHeader};
use crate::scheduler::{FrameScheduler, FrameSelection, PacketScheduler};
use crate::state::{CipherPair, ConnectionState, OutstandingPacket};
use crate::stats::{LoopDetectorCallback, NoWriteReason};
use crate::stream::StreamState;
use crate::transmit::PacketContext;
use crate::types::{
    ConnectionId, EncryptionLevel, NodeType, PacketNum, PacketNumberSpace, QuicVersion, StreamId,
};

pub const TAG_LEN: usize = 16;

pub fn cid() -> ConnectionId {
    ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap()
}

pub fn peer() -> SocketAddr {
    "127.0.0.1:443".parse().unwrap()
}

pub fn test_conn_with(settings: TransportSettings) -> ConnectionState {
    ConnectionState::new(NodeType::Client, settings, peer())
}

pub fn test_conn() -> ConnectionState {
    test_conn_with(TransportSettings::default())
}

pub fn short_header(packet_num: PacketNum) -> PacketHeader {
    HeaderBuilder::Short.build(&cid(), &cid(), packet_num, QuicVersion::V1, &Bytes::new())
}

pub fn cipher_pair() -> CipherPair {
    CipherPair {
        aead: Arc::new(XorAead),
        header_cipher: Arc::new(NullHeaderCipher),
    }
}

/// Open a stream with generous windows and queue `data` on it.
pub fn add_stream(conn: &mut ConnectionState, id: StreamId, data: Vec<u8>) {
    conn.flow_control.peer_advertised_max_offset = 1 << 24;
    conn.streams.insert(StreamState::new(id, 1 << 24));
    conn.streams.write_to_stream(id, Bytes::from(data), false);
}

/// 1-RTT ready connection with one stream holding `data`.
pub fn stream_conn(id: StreamId, data: Vec<u8>) -> ConnectionState {
    let mut conn = test_conn();
    conn.write_ciphers.one_rtt = Some(cipher_pair());
    add_stream(&mut conn, id, data);
    conn
}

pub fn app_data_scheduler() -> Box<dyn PacketScheduler> {
    let selection = FrameSelection::new(
        "FrameScheduler",
        EncryptionLevel::AppData,
        PacketNumberSpace::AppData,
    )
    .stream_frames()
    .ack_frames()
    .reset_frames()
    .window_update_frames()
    .blocked_frames()
    .simple_frames()
    .ping_frames()
    .crypto_frames();
    Box::new(FrameScheduler::new(selection))
}

pub fn app_packet_context<'a>(
    conn: &ConnectionState,
    aead: &'a XorAead,
    header_cipher: &'a NullHeaderCipher,
) -> PacketContext<'a> {
    PacketContext::new(conn, cid(), cid(), HeaderBuilder::Short, aead, header_cipher)
}

// ─── Crypto ─────────────────────────────────────────────────────────────────

/// Flips every body byte and appends a fixed tag.
pub struct XorAead;

impl Aead for XorAead {
    fn inplace_encrypt(
        &self,
        body: &mut BytesMut,
        _associated_data: &[u8],
        _seq_num: u64,
    ) -> Result<(), CryptoError> {
        for b in body.iter_mut() {
            *b ^= 0x5a;
        }
        body.extend_from_slice(&[0xee; TAG_LEN]);
        Ok(())
    }

    fn cipher_overhead(&self) -> usize {
        TAG_LEN
    }
}

/// Leaves headers readable.
pub struct NullHeaderCipher;

impl PacketNumberCipher for NullHeaderCipher {
    fn mask(&self, _sample: &Sample) -> [u8; HEADER_MASK_LEN] {
        [0; HEADER_MASK_LEN]
    }
}

// ─── Socket ─────────────────────────────────────────────────────────────────

/// Records datagrams, or fails every write with one errno.
#[derive(Debug, Default)]
pub struct FakeSocket {
    pub sent: Vec<Vec<u8>>,
    pub peers: Vec<SocketAddr>,
    pub attempts: usize,
    pub paused: bool,
    errno: Option<i32>,
}

impl FakeSocket {
    pub fn new() -> Self {
        FakeSocket::default()
    }

    pub fn failing(errno: i32) -> Self {
        FakeSocket {
            errno: Some(errno),
            ..FakeSocket::default()
        }
    }
}

impl DatagramSocket for FakeSocket {
    fn write(&mut self, peer: &SocketAddr, buf: &[u8]) -> io::Result<usize> {
        self.attempts += 1;
        if let Some(errno) = self.errno {
            return Err(io::Error::from_raw_os_error(errno));
        }
        self.sent.push(buf.to_vec());
        self.peers.push(*peer);
        Ok(buf.len())
    }

    fn pause_read(&mut self) {
        self.paused = true;
    }
}

// ─── Collaborators ──────────────────────────────────────────────────────────

/// Constant congestion window that counts sends.
pub struct FixedWindow {
    window: u64,
    sent: Rc<Cell<u64>>,
}

impl FixedWindow {
    pub fn new(window: u64) -> Self {
        FixedWindow {
            window,
            sent: Rc::new(Cell::new(0)),
        }
    }

    pub fn sent_handle(&self) -> Rc<Cell<u64>> {
        self.sent.clone()
    }
}

impl CongestionController for FixedWindow {
    fn get_writable_bytes(&self) -> u64 {
        self.window
    }

    fn on_packet_sent(&mut self, _packet: &OutstandingPacket) {
        self.sent.set(self.sent.get() + 1);
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

#[derive(Debug, Default)]
pub struct RecordingLoopDetector {
    reasons: Mutex<Vec<NoWriteReason>>,
}

impl RecordingLoopDetector {
    pub fn reasons(&self) -> Vec<NoWriteReason> {
        self.reasons.lock().unwrap().clone()
    }
}

impl LoopDetectorCallback for RecordingLoopDetector {
    fn on_suppress_write(&self, reason: NoWriteReason, _scheduler_name: &str) {
        self.reasons.lock().unwrap().push(reason);
    }
}
