//! Shared fakes for the integration tests: in-memory sockets, readable
//! crypto and a ready-to-send connection.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use quic_egress::batch::DatagramSocket;
use quic_egress::config::TransportSettings;
use quic_egress::crypto::{Aead, PacketNumberCipher, Sample, HEADER_MASK_LEN};
use quic_egress::error::CryptoError;
use quic_egress::state::{CipherPair, ConnectionState};
use quic_egress::stream::StreamState;
use quic_egress::types::{ConnectionId, NodeType, StreamId};
use quic_egress::writers::WriteKeys;

pub const TAG_LEN: usize = 16;

pub fn cid() -> ConnectionId {
    ConnectionId::new(&[0xc0, 0xff, 0xee, 0x00, 0x01, 0x02, 0x03, 0x04]).unwrap()
}

pub fn peer() -> SocketAddr {
    "192.0.2.1:443".parse().unwrap()
}

pub fn second_peer() -> SocketAddr {
    "[2001:db8::1]:443".parse().unwrap()
}

/// Route `tracing` output through the test harness. `RUST_LOG` picks the
/// level; repeated calls are no-ops.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn conn_with(settings: TransportSettings) -> ConnectionState {
    init_logging();
    let mut conn = ConnectionState::new(NodeType::Client, settings, peer());
    conn.write_ciphers.one_rtt = Some(CipherPair {
        aead: Arc::new(TagAead),
        header_cipher: Arc::new(ClearHeaders),
    });
    conn.flow_control.peer_advertised_max_offset = 1 << 30;
    conn
}

pub fn conn() -> ConnectionState {
    conn_with(TransportSettings::default())
}

pub fn open_stream(conn: &mut ConnectionState, id: StreamId, data: Vec<u8>) {
    conn.streams.insert(StreamState::new(id, 1 << 30));
    conn.streams.write_to_stream(id, Bytes::from(data), false);
}

pub fn keys<'a>(aead: &'a TagAead, hc: &'a ClearHeaders) -> WriteKeys<'a> {
    WriteKeys {
        src_conn_id: cid(),
        dst_conn_id: cid(),
        aead,
        header_cipher: hc,
    }
}

/// Leaves the body as is and appends a zero tag.
pub struct TagAead;

impl Aead for TagAead {
    fn inplace_encrypt(
        &self,
        body: &mut BytesMut,
        _associated_data: &[u8],
        _seq_num: u64,
    ) -> Result<(), CryptoError> {
        body.extend_from_slice(&[0; TAG_LEN]);
        Ok(())
    }

    fn cipher_overhead(&self) -> usize {
        TAG_LEN
    }
}

pub struct ClearHeaders;

impl PacketNumberCipher for ClearHeaders {
    fn mask(&self, _sample: &Sample) -> [u8; HEADER_MASK_LEN] {
        [0; HEADER_MASK_LEN]
    }
}

/// In-memory socket. Fails every write with `errno` when set.
#[derive(Debug, Default)]
pub struct MemorySocket {
    pub datagrams: Vec<(SocketAddr, Vec<u8>)>,
    pub attempts: usize,
    pub read_paused: bool,
    pub errno: Option<i32>,
}

impl MemorySocket {
    pub fn new() -> Self {
        MemorySocket::default()
    }

    pub fn failing(errno: i32) -> Self {
        MemorySocket {
            errno: Some(errno),
            ..MemorySocket::default()
        }
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.datagrams.iter().map(|(_, d)| d.len()).collect()
    }
}

impl DatagramSocket for MemorySocket {
    fn write(&mut self, peer: &SocketAddr, buf: &[u8]) -> io::Result<usize> {
        self.attempts += 1;
        if let Some(errno) = self.errno {
            return Err(io::Error::from_raw_os_error(errno));
        }
        self.datagrams.push((*peer, buf.to_vec()));
        Ok(buf.len())
    }

    fn pause_read(&mut self) {
        self.read_paused = true;
    }
}

/// Truncated packet number of a short-header datagram. Only valid with
/// [`ClearHeaders`] and the 8-byte [`cid`].
pub fn short_packet_num(datagram: &[u8]) -> u64 {
    let pn_len = (datagram[0] & 0x03) as usize + 1;
    let start = 1 + 8;
    datagram[start..start + pn_len]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}
