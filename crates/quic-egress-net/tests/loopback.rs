//! # Loopback tests
//!
//! The full transmit pipeline, real ChaCha20 keys, and a real UDP socket on
//! 127.0.0.1. A blocking receiver counts what arrives.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use bytes::Bytes;
use quic_egress::batch::SocketPair;
use quic_egress::config::{BatchingMode, TransportSettings};
use quic_egress::crypto::{ChaCha20HeaderCipher, ChaCha20Poly1305Aead, TrafficKey};
use quic_egress::scheduler::DefaultSchedulerFactory;
use quic_egress::state::ConnectionState;
use quic_egress::stream::StreamState;
use quic_egress::types::{ConnectionId, NodeType, PacketNumberSpace};
use quic_egress::writers::{write_quic_data_to_socket, WriteKeys};
use quic_egress_net::UdpDatagramSocket;

fn receiver() -> (UdpSocket, SocketAddr) {
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let addr = sock.local_addr().unwrap();
    (sock, addr)
}

fn drain(sock: &UdpSocket, expected: usize) -> Vec<Vec<u8>> {
    let mut buf = [0u8; 2048];
    let mut out = Vec::new();
    while out.len() < expected {
        let (n, _) = sock.recv_from(&mut buf).unwrap();
        out.push(buf[..n].to_vec());
    }
    out
}

fn send_stream(settings: TransportSettings, payload: usize) -> (u64, Vec<Vec<u8>>, usize) {
    let (rx, peer) = receiver();
    let mut tx = UdpDatagramSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();

    let mut conn = ConnectionState::new(NodeType::Client, settings, peer);
    conn.flow_control.peer_advertised_max_offset = 1 << 20;
    conn.streams.insert(StreamState::new(0, 1 << 20));
    conn.streams
        .write_to_stream(0, Bytes::from(vec![0x42; payload]), false);

    let key = TrafficKey {
        key: [0x11; 32],
        iv: [0x22; 12],
    };
    let aead = ChaCha20Poly1305Aead::new(&key);
    let header_cipher = ChaCha20HeaderCipher::new([0x33; 32]);
    let cid = ConnectionId::new(&[9; 8]).unwrap();
    let keys = WriteKeys {
        src_conn_id: cid,
        dst_conn_id: cid,
        aead: &aead,
        header_cipher: &header_cipher,
    };

    let written = write_quic_data_to_socket(
        SocketPair::single(&mut tx),
        &mut conn,
        &DefaultSchedulerFactory,
        &keys,
        16,
    )
    .unwrap();
    assert_eq!(conn.next_packet_num(PacketNumberSpace::AppData), written);
    assert!(!tx.is_read_paused());
    let datagrams = drain(&rx, written as usize);
    (written, datagrams, conn.udp_send_packet_len)
}

#[test]
fn stream_data_reaches_peer() {
    let (written, datagrams, max_len) = send_stream(TransportSettings::default(), 5000);
    assert_eq!(written, 5);
    assert_eq!(datagrams.len(), 5);
    assert!(datagrams.iter().all(|d| d.len() <= max_len));
    // Short header, fixed bit set, destination id in the clear.
    assert!(datagrams.iter().all(|d| d[0] & 0xc0 == 0x40));
    assert!(datagrams.iter().all(|d| d[1..9] == [9; 8]));
}

#[test]
fn size_based_batching_splits_into_segments() {
    let settings = TransportSettings {
        batching_mode: BatchingMode::SizeBased,
        max_batch_size: 4,
        ..TransportSettings::default()
    };
    let (written, datagrams, max_len) = send_stream(settings, 4000);
    assert_eq!(datagrams.len() as u64, written);
    let full = datagrams.iter().filter(|d| d.len() == max_len).count();
    assert!(full >= datagrams.len() - 1);
}
