//! # Connection state
//!
//! One owned aggregate per connection. Every stage of a transmit pass takes
//! it by `&mut` (or `&` for pure decisions) for the duration of the call and
//! keeps nothing afterwards.
//!
//! Collaborators the pipeline only consults (congestion controller, pacer,
//! stats and loop-detector callbacks, metrics sink) are boxed trait objects
//! so the connection can be built without any of them.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quanta::Instant;

use crate::arena::SendBufAccessor;
use crate::builder::RegularWritePacket;
use crate::config::TransportSettings;
use crate::congestion::{CongestionController, Pacer, PendingPathRateLimiter};
use crate::crypto::{Aead, PacketNumberCipher};
use crate::frame::{AckBlock, RstStreamFrame, SimpleFrame};
use crate::happy_eyeballs::HappyEyeballsState;
use crate::stats::{LoopDetectorCallback, TransmitMetrics, TransportStatsCallback, WriteDebugState};
use crate::stream::{CryptoStreams, StreamManager};
use crate::types::{
    ConnectionId, EncryptionLevel, NodeType, PacketEvent, PacketNum, PacketNumberSpace, QuicVersion,
    StreamId,
};

// ─── Per-Space Storage ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerSpace<T> {
    pub initial: T,
    pub handshake: T,
    pub app_data: T,
}

impl<T> PerSpace<T> {
    pub fn get(&self, space: PacketNumberSpace) -> &T {
        match space {
            PacketNumberSpace::Initial => &self.initial,
            PacketNumberSpace::Handshake => &self.handshake,
            PacketNumberSpace::AppData => &self.app_data,
        }
    }

    pub fn get_mut(&mut self, space: PacketNumberSpace) -> &mut T {
        match space {
            PacketNumberSpace::Initial => &mut self.initial,
            PacketNumberSpace::Handshake => &mut self.handshake,
            PacketNumberSpace::AppData => &mut self.app_data,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (PacketNumberSpace, &T)> {
        [
            (PacketNumberSpace::Initial, &self.initial),
            (PacketNumberSpace::Handshake, &self.handshake),
            (PacketNumberSpace::AppData, &self.app_data),
        ]
        .into_iter()
    }
}

// ─── Ack State ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckState {
    /// Next packet number to use in this space. Only the ledger advances it.
    pub next_packet_num: PacketNum,
    pub largest_acked_by_peer: Option<PacketNum>,
    /// Largest packet number we have put in an ACK frame.
    pub largest_ack_scheduled: Option<PacketNum>,
    pub needs_to_send_ack_immediately: bool,
    pub num_rx_packets_recvd: u64,
    pub num_non_rx_packets_recvd: u64,
    /// Received ranges still to acknowledge, descending.
    pub acks: Vec<AckBlock>,
}

impl AckState {
    pub fn largest_ack_to_send(&self) -> Option<PacketNum> {
        self.acks.first().map(|b| b.end)
    }

    /// True when something has arrived that no ACK frame has covered yet.
    pub fn has_acks_to_schedule(&self) -> bool {
        match (self.largest_ack_to_send(), self.largest_ack_scheduled) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(to_send), Some(scheduled)) => to_send > scheduled,
        }
    }
}

// ─── Pending Events ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct PmtuProbeEvents {
    pub send_probe_packet: bool,
}

/// Things the connection owes the peer, cleared as frames go out.
#[derive(Debug, Clone, Default)]
pub struct PendingEvents {
    pub resets: BTreeMap<StreamId, RstStreamFrame>,
    pub conn_window_update: bool,
    pub send_data_blocked: bool,
    pub send_ping: bool,
    /// Path data of a challenge not yet sent.
    pub path_challenge: Option<u64>,
    pub frames: Vec<SimpleFrame>,
    pub num_probe_packets: u64,
    pub set_loss_detection_alarm: bool,
    pub schedule_ack_timeout: bool,
    pub schedule_path_validation_timeout: bool,
    pub pmtu: PmtuProbeEvents,
}

// ─── Outstanding Packets ────────────────────────────────────────────────────

/// Snapshot of the ack clock at the most recent acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastAckedPacketInfo {
    pub sent_time: Instant,
    pub ack_time: Instant,
    pub total_bytes_sent: u64,
    pub total_bytes_acked: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutstandingPacketMetadata {
    pub time: Instant,
    pub encoded_size: usize,
    pub is_handshake: bool,
    pub is_pmtu_probe: bool,
    /// The counters below all include this packet.
    pub total_bytes_sent: u64,
    pub inflight_bytes: u64,
    pub packets_inflight: u64,
    pub total_packets_sent: u64,
    pub total_ack_eliciting_packets_sent: u64,
    pub write_count: u64,
    pub is_app_limited: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutstandingPacket {
    pub packet: RegularWritePacket,
    pub metadata: OutstandingPacketMetadata,
    /// Set when this packet is a clone of an earlier one.
    pub associated_event: Option<PacketEvent>,
    pub last_acked_packet_info: Option<LastAckedPacketInfo>,
    pub is_dsr: bool,
}

impl OutstandingPacket {
    pub fn packet_num(&self) -> PacketNum {
        self.packet.header.packet_num()
    }

    pub fn space(&self) -> PacketNumberSpace {
        self.packet.header.packet_number_space()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Outstandings {
    /// Ascending packet number within each space.
    pub packets: VecDeque<OutstandingPacket>,
    /// Events that clones may still refer to.
    pub packet_events: HashSet<PacketEvent>,
    pub initial_packets_count: u64,
    pub handshake_packets_count: u64,
    pub cloned_packets_count: u64,
}

impl Outstandings {
    pub fn num_outstanding(&self) -> u64 {
        self.packets.len() as u64
    }

    pub fn in_space(&self, space: PacketNumberSpace) -> impl Iterator<Item = &OutstandingPacket> {
        self.packets.iter().filter(move |p| p.space() == space)
    }
}

// ─── Loss State ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct LossState {
    /// Smoothed RTT. Zero until the first sample.
    pub srtt: Duration,
    pub largest_sent: Option<PacketNum>,
    pub total_bytes_sent: u64,
    pub total_packets_sent: u64,
    pub total_ack_eliciting_packets_sent: u64,
    pub inflight_bytes: u64,
    pub total_bytes_retransmitted: u64,
    pub total_stream_bytes_cloned: u64,
    pub total_bytes_cloned: u64,
    pub timeout_based_rtx_count: u64,
    pub last_retransmittable_packet_sent_time: Option<Instant>,
    pub last_acked: Option<LastAckedPacketInfo>,
}

// ─── Flow Control ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ConnFlowControl {
    pub peer_advertised_max_offset: u64,
    /// Sum over streams of new bytes sent.
    pub sum_cur_write_offset: u64,
    pub advertised_max_offset: u64,
    pub window_size: u64,
    pub sum_cur_read_offset: u64,
    pub last_window_update_sent: Option<Instant>,
}

impl ConnFlowControl {
    pub fn send_window_available(&self) -> u64 {
        self.peer_advertised_max_offset
            .saturating_sub(self.sum_cur_write_offset)
    }
}

// ─── Ciphers ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct CipherPair {
    pub aead: Arc<dyn Aead>,
    pub header_cipher: Arc<dyn PacketNumberCipher>,
}

#[derive(Clone, Default)]
pub struct WriteCiphers {
    pub initial: Option<CipherPair>,
    pub handshake: Option<CipherPair>,
    pub zero_rtt: Option<CipherPair>,
    pub one_rtt: Option<CipherPair>,
}

impl WriteCiphers {
    pub fn for_level(&self, level: EncryptionLevel) -> Option<&CipherPair> {
        match level {
            EncryptionLevel::Initial => self.initial.as_ref(),
            EncryptionLevel::Handshake => self.handshake.as_ref(),
            EncryptionLevel::EarlyData => self.zero_rtt.as_ref(),
            EncryptionLevel::AppData => self.one_rtt.as_ref(),
        }
    }

    /// Cipher that protects ACKs in `space`. AppData ACKs need 1-RTT keys.
    pub fn for_space(&self, space: PacketNumberSpace) -> Option<&CipherPair> {
        match space {
            PacketNumberSpace::Initial => self.initial.as_ref(),
            PacketNumberSpace::Handshake => self.handshake.as_ref(),
            PacketNumberSpace::AppData => self.one_rtt.as_ref(),
        }
    }
}

// ─── Path MTU ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmtuProbe {
    pub packet_num: PacketNum,
    pub probe_size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PmtuState {
    pub current_probe_size: usize,
    pub last_probe: Option<PmtuProbe>,
    pub outstanding_probes: u64,
    pub total_probes_sent: u64,
}

impl PmtuState {
    /// Probes only ever go out in AppData.
    pub fn is_probe(&self, space: PacketNumberSpace, packet_num: PacketNum) -> bool {
        space == PacketNumberSpace::AppData
            && self.last_probe.is_some_and(|p| p.packet_num == packet_num)
    }
}

// ─── Connection ─────────────────────────────────────────────────────────────

pub struct ConnectionState {
    pub node_type: NodeType,
    pub settings: TransportSettings,
    pub udp_send_packet_len: usize,
    pub version: QuicVersion,
    pub peer_address: SocketAddr,
    pub client_connection_id: Option<ConnectionId>,
    pub server_connection_id: Option<ConnectionId>,

    pub ack_states: PerSpace<AckState>,
    pub crypto_streams: CryptoStreams,
    pub streams: StreamManager,
    pub pending_events: PendingEvents,
    pub outstanding_path_validation: Option<u64>,
    pub path_challenge_start_time: Option<Instant>,
    pub loss_state: LossState,
    pub outstandings: Outstandings,
    pub flow_control: ConnFlowControl,
    pub pmtu: PmtuState,

    pub write_ciphers: WriteCiphers,
    pub congestion_controller: Option<Box<dyn CongestionController>>,
    pub pacer: Option<Box<dyn Pacer>>,
    pub path_validation_limiter: Option<PendingPathRateLimiter>,
    /// Anti-amplification / 0-RTT byte cap on `total_bytes_sent`.
    pub writable_bytes_limit: Option<u64>,

    pub buf_accessor: SendBufAccessor,
    pub happy_eyeballs: HappyEyeballsState,

    pub stats_callback: Option<Arc<dyn TransportStatsCallback>>,
    pub loop_detector: Option<Arc<dyn LoopDetectorCallback>>,
    pub write_debug_state: WriteDebugState,
    pub metrics: Option<Arc<dyn TransmitMetrics>>,
    /// Transmit passes run so far.
    pub write_count: u64,
}

impl ConnectionState {
    pub fn new(node_type: NodeType, settings: TransportSettings, peer_address: SocketAddr) -> Self {
        let udp_send_packet_len = settings.udp_send_packet_len;
        let arena_packets = (settings.max_batch_size as u64)
            .max(settings.write_connection_data_packets_limit) as usize;
        ConnectionState {
            node_type,
            udp_send_packet_len,
            version: QuicVersion::V1,
            peer_address,
            client_connection_id: None,
            server_connection_id: None,
            ack_states: PerSpace::default(),
            crypto_streams: CryptoStreams::default(),
            streams: StreamManager::new(),
            pending_events: PendingEvents::default(),
            outstanding_path_validation: None,
            path_challenge_start_time: None,
            loss_state: LossState::default(),
            outstandings: Outstandings::default(),
            flow_control: ConnFlowControl::default(),
            pmtu: PmtuState::default(),
            write_ciphers: WriteCiphers::default(),
            congestion_controller: None,
            pacer: None,
            path_validation_limiter: None,
            writable_bytes_limit: None,
            buf_accessor: SendBufAccessor::new(udp_send_packet_len * arena_packets),
            happy_eyeballs: HappyEyeballsState::single_path(),
            stats_callback: None,
            loop_detector: None,
            write_debug_state: WriteDebugState::default(),
            metrics: None,
            write_count: 0,
            settings,
        }
    }

    pub fn stats(&self) -> Option<&dyn TransportStatsCallback> {
        self.stats_callback.as_deref()
    }

    pub fn ack_state(&self, space: PacketNumberSpace) -> &AckState {
        self.ack_states.get(space)
    }

    pub fn next_packet_num(&self, space: PacketNumberSpace) -> PacketNum {
        self.ack_states.get(space).next_packet_num
    }

    pub fn increase_next_packet_num(&mut self, space: PacketNumberSpace) {
        self.ack_states.get_mut(space).next_packet_num += 1;
    }

    /// True while a path challenge is queued or awaiting its response.
    pub fn path_validation_pending(&self) -> bool {
        self.pending_events.path_challenge.is_some() || self.outstanding_path_validation.is_some()
    }

    /// RTT used for time-based limits: smoothed if sampled, else the default.
    pub fn rtt_or_default(&self) -> Duration {
        if self.loss_state.srtt.is_zero() {
            self.settings.default_initial_rtt
        } else {
            self.loss_state.srtt
        }
    }
}
