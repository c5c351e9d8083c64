//! # Per-space writers
//!
//! Entry points the connection calls. Each picks its schedulers and header
//! form and hands the pass to the transmit loop:
//!
//! | Writer                                   | Space            | Probes first |
//! |------------------------------------------|------------------|--------------|
//! | `write_quic_data_to_socket`              | AppData          | yes          |
//! | `write_quic_data_except_crypto_...`      | AppData          | yes          |
//! | `write_crypto_and_ack_data_to_socket`    | Initial/Handshake| if in flight |
//! | `write_zero_rtt_data_to_socket`          | AppData (0-RTT)  | no           |
//! | `write_pmtu_probe_to_socket`             | AppData          | n/a          |
//!
//! Close packets bypass the loop and the ledger.

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, trace};

use crate::assembler::{seal_in_place, SealingParams};
use crate::batch::SocketPair;
use crate::budget::{congestion_control_writable_bytes, unlimited_writable_bytes};
use crate::builder::{write_frame, PacketBuilder, RegularPacketBuilder};
use crate::crypto::{Aead, PacketNumberCipher};
use crate::error::{ConnectionError, QuicErrorCode, TransportErrorCode};
use crate::frame::{ConnectionCloseFrame, WriteFrame};
use crate::header::{HeaderBuilder, LongHeaderType, PacketHeader};
use crate::scheduler::{FrameSelection, SchedulerFactory};
use crate::state::{ConnectionState, PmtuProbe};
use crate::transmit::{write_connection_data_to_socket, PacketContext};
use crate::types::{ConnectionId, EncryptionLevel, NodeType, PacketNumberSpace};

/// Connection ids and keys shared by the passes of one writer call.
#[derive(Clone, Copy)]
pub struct WriteKeys<'a> {
    pub src_conn_id: ConnectionId,
    pub dst_conn_id: ConnectionId,
    pub aead: &'a dyn Aead,
    pub header_cipher: &'a dyn PacketNumberCipher,
}

impl<'a> WriteKeys<'a> {
    fn context(&self, conn: &ConnectionState, header_builder: HeaderBuilder) -> PacketContext<'a> {
        PacketContext::new(
            conn,
            self.src_conn_id,
            self.dst_conn_id,
            header_builder,
            self.aead,
            self.header_cipher,
        )
    }
}

// ─── Data Writers ───────────────────────────────────────────────────────────

pub fn write_quic_data_to_socket(
    sockets: SocketPair<'_>,
    conn: &mut ConnectionState,
    factory: &dyn SchedulerFactory,
    keys: &WriteKeys<'_>,
    packet_limit: u64,
) -> Result<u64, ConnectionError> {
    write_app_data(sockets, conn, factory, keys, packet_limit, false)
}

/// Same as [`write_quic_data_to_socket`] without 1-RTT crypto frames.
pub fn write_quic_data_except_crypto_stream_to_socket(
    sockets: SocketPair<'_>,
    conn: &mut ConnectionState,
    factory: &dyn SchedulerFactory,
    keys: &WriteKeys<'_>,
    packet_limit: u64,
) -> Result<u64, ConnectionError> {
    write_app_data(sockets, conn, factory, keys, packet_limit, true)
}

fn write_app_data(
    mut sockets: SocketPair<'_>,
    conn: &mut ConnectionState,
    factory: &dyn SchedulerFactory,
    keys: &WriteKeys<'_>,
    packet_limit: u64,
    except_crypto: bool,
) -> Result<u64, ConnectionError> {
    let level = EncryptionLevel::AppData;
    let space = PacketNumberSpace::AppData;
    let mut written = 0;

    if conn.pending_events.num_probe_packets > 0 {
        let name = if except_crypto {
            "ProbeWithoutCrypto"
        } else {
            "ProbeScheduler"
        };
        let mut selection = FrameSelection::new(name, level, space)
            .blocked_frames()
            .window_update_frames()
            .simple_frames()
            .reset_frames()
            .stream_frames()
            .ping_frames();
        if !except_crypto {
            selection = selection.crypto_frames();
        }
        let probes = packet_limit.min(conn.pending_events.num_probe_packets);
        written = write_probing_data_to_socket(
            sockets.reborrow(),
            conn,
            factory,
            keys,
            HeaderBuilder::Short,
            selection,
            probes,
        )?;
        consume_probes(conn, written);
    }

    let name = if except_crypto {
        "FrameSchedulerWithoutCrypto"
    } else {
        "FrameScheduler"
    };
    let mut selection = FrameSelection::new(name, level, space)
        .stream_frames()
        .ack_frames()
        .reset_frames()
        .window_update_frames()
        .blocked_frames()
        .simple_frames()
        .ping_frames();
    if !except_crypto {
        selection = selection.crypto_frames();
    }
    let mut scheduler = factory.frame_scheduler(selection);
    let ctx = keys.context(conn, HeaderBuilder::Short);
    written += write_connection_data_to_socket(
        sockets,
        conn,
        &ctx,
        scheduler.as_mut(),
        congestion_control_writable_bytes,
        packet_limit - written,
    )?;
    if written > 0 {
        trace!(node = %conn.node_type, written, except_crypto, "written app data");
    }
    debug_assert!(written <= packet_limit);
    Ok(written)
}

fn consume_probes(conn: &mut ConnectionState, written: u64) {
    let pending = &mut conn.pending_events.num_probe_packets;
    assert!(*pending >= written, "wrote more probes than were pending");
    *pending -= written;
}

/// Acks and crypto data in the Initial or Handshake space.
pub fn write_crypto_and_ack_data_to_socket(
    mut sockets: SocketPair<'_>,
    conn: &mut ConnectionState,
    factory: &dyn SchedulerFactory,
    keys: &WriteKeys<'_>,
    header_type: LongHeaderType,
    token: Bytes,
    packet_limit: u64,
) -> Result<u64, ConnectionError> {
    let level = header_type.protection_type().encryption_level();
    let space = header_type.packet_number_space();
    let selection = FrameSelection::new("CryptoAndAcksScheduler", level, space)
        .ack_frames()
        .crypto_frames();
    let header_builder = HeaderBuilder::Long(header_type);
    let mut written = 0;

    let crypto_in_flight = conn
        .crypto_streams
        .for_level(level)
        .is_some_and(|s| !s.retransmission_buffer.is_empty());
    if conn.pending_events.num_probe_packets > 0 {
        let has_data = factory.frame_scheduler(selection.clone()).has_data(conn);
        if crypto_in_flight || has_data {
            let probes = packet_limit.min(conn.pending_events.num_probe_packets);
            written = probe_with_token(
                sockets.reborrow(),
                conn,
                factory,
                keys,
                header_builder,
                selection.clone(),
                probes,
                token.clone(),
            )?;
            consume_probes(conn, written);
        }
    }

    let mut scheduler = factory.frame_scheduler(selection);
    let ctx = keys.context(conn, header_builder).with_token(token);
    written += write_connection_data_to_socket(
        sockets,
        conn,
        &ctx,
        scheduler.as_mut(),
        congestion_control_writable_bytes,
        packet_limit - written,
    )?;
    if written > 0 {
        trace!(node = %conn.node_type, %space, written, "written crypto and acks");
    }
    assert!(written <= packet_limit);
    Ok(written)
}

/// Early data. Probes are pointless here: handshake packets are always
/// outstanding while 0-RTT is in use.
pub fn write_zero_rtt_data_to_socket(
    sockets: SocketPair<'_>,
    conn: &mut ConnectionState,
    factory: &dyn SchedulerFactory,
    keys: &WriteKeys<'_>,
    packet_limit: u64,
) -> Result<u64, ConnectionError> {
    let header_type = LongHeaderType::ZeroRtt;
    let selection = FrameSelection::new(
        "ZeroRttScheduler",
        header_type.protection_type().encryption_level(),
        header_type.packet_number_space(),
    )
    .stream_frames()
    .reset_frames()
    .window_update_frames()
    .blocked_frames()
    .simple_frames();
    let mut scheduler = factory.frame_scheduler(selection);
    let ctx = keys.context(conn, HeaderBuilder::Long(header_type));
    let written = write_connection_data_to_socket(
        sockets,
        conn,
        &ctx,
        scheduler.as_mut(),
        congestion_control_writable_bytes,
        packet_limit,
    )?;
    if written > 0 {
        trace!(node = %conn.node_type, written, "written zero rtt data");
    }
    Ok(written)
}

// ─── Probes ─────────────────────────────────────────────────────────────────

/// Send up to `probes` clones of outstanding data, skipping one packet
/// number first. Falls back to PINGs when nothing could be cloned.
pub fn write_probing_data_to_socket(
    sockets: SocketPair<'_>,
    conn: &mut ConnectionState,
    factory: &dyn SchedulerFactory,
    keys: &WriteKeys<'_>,
    header_builder: HeaderBuilder,
    selection: FrameSelection,
    probes: u64,
) -> Result<u64, ConnectionError> {
    probe_with_token(
        sockets,
        conn,
        factory,
        keys,
        header_builder,
        selection,
        probes,
        Bytes::new(),
    )
}

#[allow(clippy::too_many_arguments)]
fn probe_with_token(
    mut sockets: SocketPair<'_>,
    conn: &mut ConnectionState,
    factory: &dyn SchedulerFactory,
    keys: &WriteKeys<'_>,
    header_builder: HeaderBuilder,
    selection: FrameSelection,
    probes: u64,
    token: Bytes,
) -> Result<u64, ConnectionError> {
    let space = header_builder.packet_number_space();
    // A gap in packet numbers makes the peer ack right away.
    conn.increase_next_packet_num(space);

    let level = selection.level;
    let inner = factory.frame_scheduler(selection);
    let mut cloning = factory.cloning_scheduler(inner, "CloningScheduler");
    let ctx = keys.context(conn, header_builder).with_token(token);
    let mut written = write_connection_data_to_socket(
        sockets.reborrow(),
        conn,
        &ctx,
        cloning.as_mut(),
        unlimited_writable_bytes,
        probes,
    )?;

    if probes > 0 && written == 0 {
        conn.pending_events.send_ping = true;
        let ping = FrameSelection::new("PingScheduler", level, space).ping_frames();
        let mut scheduler = factory.frame_scheduler(ping);
        written += write_connection_data_to_socket(
            sockets,
            conn,
            &ctx,
            scheduler.as_mut(),
            unlimited_writable_bytes,
            probes - written,
        )?;
    }
    if written > 0 {
        trace!(node = %conn.node_type, %space, written, "written probes");
    }
    Ok(written)
}

/// One padded PING at the current probe size, if a probe was requested.
pub fn write_pmtu_probe_to_socket(
    sockets: SocketPair<'_>,
    conn: &mut ConnectionState,
    factory: &dyn SchedulerFactory,
    keys: &WriteKeys<'_>,
) -> Result<u64, ConnectionError> {
    if !conn.pending_events.pmtu.send_probe_packet {
        return Ok(0);
    }
    let space = PacketNumberSpace::AppData;
    conn.increase_next_packet_num(space);

    let probe_size = conn.pmtu.current_probe_size;
    conn.pmtu.last_probe = Some(PmtuProbe {
        packet_num: conn.next_packet_num(space),
        probe_size,
    });
    let mut scheduler = factory.pmtu_probe_scheduler(probe_size);
    let ctx = keys
        .context(conn, HeaderBuilder::Short)
        .with_max_packet_len(probe_size);
    let written = write_connection_data_to_socket(
        sockets,
        conn,
        &ctx,
        scheduler.as_mut(),
        unlimited_writable_bytes,
        1,
    )?;
    if written > 0 {
        trace!(probe_size, "written pmtu probe");
        conn.pending_events.pmtu.send_probe_packet = false;
    }
    Ok(written)
}

// ─── Connection Close ───────────────────────────────────────────────────────

/// Why the connection is closing, as sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseDetails {
    pub error_code: QuicErrorCode,
    pub reason: String,
}

fn close_frame(details: Option<&CloseDetails>) -> ConnectionCloseFrame {
    match details {
        None => ConnectionCloseFrame {
            error_code: QuicErrorCode::Transport(TransportErrorCode::NoError),
            reason_phrase: "No error".into(),
        },
        // Local codes never leave the process.
        Some(CloseDetails {
            error_code: QuicErrorCode::Local(_),
            ..
        }) => ConnectionCloseFrame {
            error_code: QuicErrorCode::Transport(TransportErrorCode::InternalError),
            reason_phrase: "Internal error".into(),
        },
        Some(details) => ConnectionCloseFrame {
            error_code: details.error_code,
            reason_phrase: details.reason.clone(),
        },
    }
}

/// Seal and send a CONNECTION_CLOSE. Best effort: the packet number advances
/// and the bytes count as sent even if the socket refuses them.
fn write_close_common(
    sockets: SocketPair<'_>,
    conn: &mut ConnectionState,
    header: PacketHeader,
    details: Option<&CloseDetails>,
    aead: &dyn Aead,
    header_cipher: &dyn PacketNumberCipher,
) {
    let space = header.packet_number_space();
    let form = header.header_form();
    let packet_num = header.packet_num();
    let largest_acked = conn.ack_state(space).largest_acked_by_peer;
    let overhead = aead.cipher_overhead();

    let mut builder = RegularPacketBuilder::new(conn.udp_send_packet_len, header, largest_acked);
    builder.account_for_cipher_overhead(overhead);
    let written = write_frame(WriteFrame::ConnectionClose(close_frame(details)), &mut builder);
    if written == 0 {
        error!(node = %conn.node_type, %space, "close frame too large");
        return;
    }
    if space == PacketNumberSpace::Initial && conn.node_type == NodeType::Client {
        let padding = builder.remaining_space();
        if padding > 0 {
            write_frame(WriteFrame::Padding { len: padding }, &mut builder);
        }
    }

    let chained = builder.build();
    let header_len = chained.built.header_len;
    let mut datagram = BytesMut::with_capacity(header_len + chained.built.body_len + overhead);
    datagram.extend_from_slice(&chained.header);
    for segment in &chained.body {
        datagram.extend_from_slice(segment);
    }
    let keys = SealingParams {
        aead,
        header_cipher,
        max_packet_len: conn.udp_send_packet_len,
    };
    if let Err(err) = seal_in_place(&mut datagram, 0, header_len, form, packet_num, &keys) {
        error!(node = %conn.node_type, %space, error = %err, "failed to seal close packet");
        return;
    }

    trace!(node = %conn.node_type, pn = packet_num, %space, size = datagram.len(), "sending close");
    conn.increase_next_packet_num(space);
    let size = datagram.len();
    let sent = sockets.primary.write(&conn.peer_address, &datagram);
    conn.loss_state.total_bytes_sent += size as u64;
    match sent {
        Ok(n) => {
            if let Some(stats) = conn.stats() {
                stats.on_write(n);
            }
        }
        Err(err) => debug!(node = %conn.node_type, error = %err, "error writing connection close"),
    }
}

/// Close in a long-header space. Skipped if no server connection id was
/// bound yet.
pub fn write_long_close(
    sockets: SocketPair<'_>,
    conn: &mut ConnectionState,
    keys: &WriteKeys<'_>,
    header_type: LongHeaderType,
    details: Option<&CloseDetails>,
) {
    if conn.server_connection_id.is_none() {
        return;
    }
    let packet_num = conn.next_packet_num(header_type.packet_number_space());
    let header = HeaderBuilder::Long(header_type).build(
        &keys.src_conn_id,
        &keys.dst_conn_id,
        packet_num,
        conn.version,
        &Bytes::new(),
    );
    write_close_common(sockets, conn, header, details, keys.aead, keys.header_cipher);
}

pub fn write_short_close(
    sockets: SocketPair<'_>,
    conn: &mut ConnectionState,
    dst_conn_id: ConnectionId,
    details: Option<&CloseDetails>,
    aead: &dyn Aead,
    header_cipher: &dyn PacketNumberCipher,
) {
    let packet_num = conn.next_packet_num(PacketNumberSpace::AppData);
    let header = HeaderBuilder::Short.build(
        &dst_conn_id,
        &dst_conn_id,
        packet_num,
        conn.version,
        &Bytes::new(),
    );
    write_close_common(sockets, conn, header, details, aead, header_cipher);
}
