//! # Packet assembly
//!
//! One call turns a header and a scheduler into an encrypted datagram in the
//! batch: build → schedule → seal → enqueue.
//!
//! ## Strategies
//!
//! | Strategy            | Packet bytes live in                      |
//! |---------------------|-------------------------------------------|
//! | `ContinuousMemory`  | the connection's send arena, back to back |
//! | `ChainedMemory`     | a fresh buffer per packet                 |
//!
//! Both signal the same outcomes. A build that yields no frame, or frames
//! with no body, flushes what is already batched, records the no-write
//! reason and returns [`DataPathResult::BuildFailure`]. The arena is handed
//! back on every path, rolled back to its length before the call when the
//! packet is dropped.

use bytes::{Bytes, BytesMut};
use quanta::Instant;
use tracing::{error, trace};

use crate::batch::{FlushMode, IoBufBatch};
use crate::builder::{InplacePacketBuilder, RegularPacketBuilder, RegularWritePacket};
use crate::config::{DataPathType, TransportSettings};
use crate::crypto::{Aead, PacketNumberCipher, Sample, SAMPLE_LEN};
use crate::error::{ConnectionError, CryptoError};
use crate::header::{packet_number_length, PacketHeader, MAX_PACKET_NUM_ENCODING_SIZE};
use crate::scheduler::PacketScheduler;
use crate::state::ConnectionState;
use crate::stats::{NoWriteReason, WritePhase};
use crate::types::{HeaderForm, PacketEvent, PacketNum, PacketNumberSpace};

/// Keys and size limit for the packets of one pass.
pub struct SealingParams<'a> {
    pub aead: &'a dyn Aead,
    pub header_cipher: &'a dyn PacketNumberCipher,
    /// Upper bound on the datagram, normally the UDP send packet length.
    pub max_packet_len: usize,
}

/// A packet that was built, sealed and handed to the batch.
#[derive(Debug)]
pub struct AssembledPacket {
    pub packet: RegularWritePacket,
    pub packet_event: Option<PacketEvent>,
    pub encoded_size: usize,
    pub encoded_body_size: usize,
    /// False when the flush this packet triggered delivered nothing.
    pub write_success: bool,
}

#[derive(Debug)]
pub enum DataPathResult {
    BuildFailure,
    Built(AssembledPacket),
}

// ─── Header Protection ──────────────────────────────────────────────────────

/// Mask the first byte and packet-number bytes of `header` with a sample of
/// the encrypted `body`.
///
/// Panics if the body is too short to sample.
pub fn encrypt_packet_header(
    form: HeaderForm,
    header: &mut [u8],
    body: &[u8],
    cipher: &dyn PacketNumberCipher,
) {
    let pn_len = packet_number_length(header[0]);
    let sample_offset = MAX_PACKET_NUM_ENCODING_SIZE - pn_len;
    assert!(
        body.len() >= sample_offset + SAMPLE_LEN,
        "encrypted body of {} bytes too short to sample at offset {}",
        body.len(),
        sample_offset
    );
    let mut sample: Sample = [0u8; SAMPLE_LEN];
    sample.copy_from_slice(&body[sample_offset..sample_offset + SAMPLE_LEN]);

    let header_len = header.len();
    let (first, rest) = header.split_at_mut(1);
    let pn_bytes = &mut rest[header_len - 1 - pn_len..];
    match form {
        HeaderForm::Long => cipher.encrypt_long_header(&sample, &mut first[0], pn_bytes),
        HeaderForm::Short => cipher.encrypt_short_header(&sample, &mut first[0], pn_bytes),
    }
}

/// Encrypt the packet that starts at `start` in `buf` and whose header is
/// `header_len` bytes long. Everything after the header is body.
pub(crate) fn seal_in_place(
    buf: &mut BytesMut,
    start: usize,
    header_len: usize,
    form: HeaderForm,
    packet_num: PacketNum,
    keys: &SealingParams<'_>,
) -> Result<(), CryptoError> {
    let header_end = start + header_len;
    let mut body = buf.split_off(header_end);
    let sealed = keys
        .aead
        .inplace_encrypt(&mut body, &buf[start..header_end], packet_num);
    buf.unsplit(body);
    sealed?;

    let (header, body) = buf[start..].split_at_mut(header_len);
    encrypt_packet_header(form, header, body, keys.header_cipher);
    Ok(())
}

// ─── Assembler ──────────────────────────────────────────────────────────────

/// Selected once per connection from [`TransportSettings::data_path_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketAssembler {
    ContinuousMemory,
    ChainedMemory,
}

impl PacketAssembler {
    pub fn from_settings(settings: &TransportSettings) -> Self {
        match settings.data_path_type {
            DataPathType::ContinuousMemory => PacketAssembler::ContinuousMemory,
            DataPathType::ChainedMemory => PacketAssembler::ChainedMemory,
        }
    }

    /// Build, seal and enqueue one packet under `header`.
    pub fn build_schedule_encrypt(
        self,
        conn: &mut ConnectionState,
        batch: &mut IoBufBatch<'_>,
        scheduler: &mut dyn PacketScheduler,
        header: PacketHeader,
        writable_bytes: u64,
        keys: &SealingParams<'_>,
    ) -> Result<DataPathResult, ConnectionError> {
        let started = Instant::now();
        let result = match self {
            PacketAssembler::ContinuousMemory => {
                continuous_memory(conn, batch, scheduler, header, writable_bytes, keys)
            }
            PacketAssembler::ChainedMemory => {
                chained_memory(conn, batch, scheduler, header, writable_bytes, keys)
            }
        };
        if let Some(metrics) = conn.metrics.as_ref() {
            metrics.record(
                WritePhase::Assemble,
                Instant::now().saturating_duration_since(started),
            );
        }
        result
    }
}

/// Flush what is batched and record why nothing was built. A thread-local
/// batch may hold on; the pass ends with a forced flush.
fn build_failure(
    conn: &mut ConnectionState,
    batch: &mut IoBufBatch<'_>,
    reason: NoWriteReason,
    scheduler_name: &str,
) -> Result<DataPathResult, ConnectionError> {
    batch.flush(conn, FlushMode::AllowThreadLocalDelay)?;
    trace!(reason = %reason, scheduler = scheduler_name, "packet build failed");
    if let Some(detector) = conn.loop_detector.clone() {
        conn.write_debug_state.no_write_reason = reason;
        conn.write_debug_state.scheduler_name = scheduler_name.to_owned();
        detector.on_suppress_write(reason, scheduler_name);
    }
    Ok(DataPathResult::BuildFailure)
}

fn warn_if_oversized(conn: &ConnectionState, space: PacketNumberSpace, pn: PacketNum, size: usize) {
    if size > conn.udp_send_packet_len && !conn.pmtu.is_probe(space, pn) {
        error!(pn, %space, size, limit = conn.udp_send_packet_len, "sending packet larger than limit");
    }
}

/// Enqueue a sealed datagram and wrap up the result.
fn enqueue(
    conn: &mut ConnectionState,
    batch: &mut IoBufBatch<'_>,
    datagram: Option<Bytes>,
    packet: RegularWritePacket,
    packet_event: Option<PacketEvent>,
    encoded_size: usize,
    encoded_body_size: usize,
) -> Result<DataPathResult, ConnectionError> {
    let write_success = batch.write(conn, datagram, encoded_size)?;
    if write_success {
        if let Some(stats) = conn.stats() {
            stats.on_write(encoded_size);
            stats.on_packet_sent();
        }
    }
    trace!(
        pn = packet.header.packet_num(),
        space = %packet.header.packet_number_space(),
        size = encoded_size,
        frames = packet.frames.len(),
        "packet enqueued"
    );
    Ok(DataPathResult::Built(AssembledPacket {
        packet,
        packet_event,
        encoded_size,
        encoded_body_size,
        write_success,
    }))
}

fn continuous_memory(
    conn: &mut ConnectionState,
    batch: &mut IoBufBatch<'_>,
    scheduler: &mut dyn PacketScheduler,
    header: PacketHeader,
    writable_bytes: u64,
    keys: &SealingParams<'_>,
) -> Result<DataPathResult, ConnectionError> {
    let prev_size = conn.buf_accessor.len();
    let space = header.packet_number_space();
    let packet_num = header.packet_num();
    let form = header.header_form();
    let largest_acked = conn.ack_state(space).largest_acked_by_peer;

    let mut builder =
        InplacePacketBuilder::new(&mut conn.buf_accessor, keys.max_packet_len, header, largest_acked);
    builder.account_for_cipher_overhead(keys.aead.cipher_overhead());
    let scheduled = scheduler.schedule_frames_for_packet(conn, &mut builder, writable_bytes);
    let built = builder.build(&mut conn.buf_accessor);

    let Some(scheduled) = scheduled.filter(|_| !built.packet.frames.is_empty()) else {
        conn.buf_accessor.rollback_to(prev_size);
        return build_failure(conn, batch, NoWriteReason::NoFrame, scheduler.name());
    };
    if built.body_len == 0 {
        conn.buf_accessor.rollback_to(prev_size);
        return build_failure(conn, batch, NoWriteReason::NoBody, scheduler.name());
    }

    let mut buf = conn.buf_accessor.obtain();
    let sealed = seal_in_place(&mut buf, prev_size, built.header_len, form, packet_num, keys);
    conn.buf_accessor.release(buf);
    if let Err(err) = sealed {
        conn.buf_accessor.rollback_to(prev_size);
        return Err(err.into());
    }

    let encoded_size = conn.buf_accessor.len() - prev_size;
    let encoded_body_size = encoded_size - built.header_len;
    warn_if_oversized(conn, space, packet_num, encoded_size);
    enqueue(
        conn,
        batch,
        None,
        built.packet,
        scheduled.packet_event,
        encoded_size,
        encoded_body_size,
    )
}

fn chained_memory(
    conn: &mut ConnectionState,
    batch: &mut IoBufBatch<'_>,
    scheduler: &mut dyn PacketScheduler,
    header: PacketHeader,
    writable_bytes: u64,
    keys: &SealingParams<'_>,
) -> Result<DataPathResult, ConnectionError> {
    let space = header.packet_number_space();
    let packet_num = header.packet_num();
    let form = header.header_form();
    let largest_acked = conn.ack_state(space).largest_acked_by_peer;
    let overhead = keys.aead.cipher_overhead();

    let mut builder = RegularPacketBuilder::new(keys.max_packet_len, header, largest_acked);
    builder.account_for_cipher_overhead(overhead);
    let scheduled = scheduler.schedule_frames_for_packet(conn, &mut builder, writable_bytes);
    let chained = builder.build();

    let Some(scheduled) = scheduled.filter(|_| !chained.built.packet.frames.is_empty()) else {
        return build_failure(conn, batch, NoWriteReason::NoFrame, scheduler.name());
    };
    if chained.built.body_len == 0 {
        return build_failure(conn, batch, NoWriteReason::NoBody, scheduler.name());
    }

    let header_len = chained.built.header_len;
    let mut datagram = BytesMut::with_capacity(header_len + chained.built.body_len + overhead);
    datagram.extend_from_slice(&chained.header);
    for segment in &chained.body {
        datagram.extend_from_slice(segment);
    }
    seal_in_place(&mut datagram, 0, header_len, form, packet_num, keys)?;

    let encoded_size = datagram.len();
    warn_if_oversized(conn, space, packet_num, encoded_size);
    enqueue(
        conn,
        batch,
        Some(datagram.freeze()),
        chained.built.packet,
        scheduled.packet_event,
        encoded_size,
        encoded_size - header_len,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::batch::SocketPair;
    use crate::builder::PacketBuilder;
    use crate::config::BatchingMode;
    use crate::frame::{SimpleFrame, WriteFrame};
    use crate::scheduler::SchedulingResult;
    use crate::test_util::RecordingLoopDetector;
    use crate::header::HeaderBuilder;
    use crate::test_util::{
        short_header, stream_conn, test_conn, FakeSocket, NullHeaderCipher, XorAead,
    };

    fn keys<'a>(aead: &'a XorAead, cipher: &'a NullHeaderCipher) -> SealingParams<'a> {
        SealingParams {
            aead,
            header_cipher: cipher,
            max_packet_len: 1252,
        }
    }

    fn settings_for(assembler: PacketAssembler) -> TransportSettings {
        let data_path_type = match assembler {
            PacketAssembler::ContinuousMemory => DataPathType::ContinuousMemory,
            PacketAssembler::ChainedMemory => DataPathType::ChainedMemory,
        };
        TransportSettings {
            data_path_type,
            ..TransportSettings::default()
        }
    }

    struct Nothing;

    impl PacketScheduler for Nothing {
        fn name(&self) -> &str {
            "Nothing"
        }
        fn has_data(&self, _conn: &ConnectionState) -> bool {
            true
        }
        fn schedule_frames_for_packet(
            &mut self,
            _conn: &ConnectionState,
            _builder: &mut dyn crate::builder::PacketBuilder,
            _writable_bytes: u64,
        ) -> Option<crate::scheduler::SchedulingResult> {
            None
        }
    }

    /// Records a frame but never writes a byte for it.
    struct ZeroBody;

    impl PacketScheduler for ZeroBody {
        fn name(&self) -> &str {
            "ZeroBody"
        }
        fn has_data(&self, _conn: &ConnectionState) -> bool {
            true
        }
        fn schedule_frames_for_packet(
            &mut self,
            _conn: &ConnectionState,
            builder: &mut dyn PacketBuilder,
            _writable_bytes: u64,
        ) -> Option<SchedulingResult> {
            builder.push_frame(WriteFrame::Simple(SimpleFrame::HandshakeDone));
            Some(SchedulingResult::default())
        }
    }

    #[test]
    fn header_sample_offset_depends_on_pn_len() {
        struct Recording(std::cell::Cell<Sample>);
        impl PacketNumberCipher for Recording {
            fn mask(&self, sample: &Sample) -> [u8; crate::crypto::HEADER_MASK_LEN] {
                self.0.set(*sample);
                [0; crate::crypto::HEADER_MASK_LEN]
            }
        }
        let body: Vec<u8> = (0u8..32).collect();
        // 1-byte packet number: sample starts 3 bytes into the body.
        let mut header = [0x40u8, 0xaa, 0x01];
        let cipher = Recording(std::cell::Cell::new([0; SAMPLE_LEN]));
        encrypt_packet_header(HeaderForm::Short, &mut header, &body, &cipher);
        assert_eq!(cipher.0.get()[0], 3);
    }

    #[test]
    #[should_panic(expected = "too short to sample")]
    fn undersized_body_panics() {
        let mut header = [0x40u8, 0xaa, 0x01];
        encrypt_packet_header(HeaderForm::Short, &mut header, &[0u8; 10], &NullHeaderCipher);
    }

    #[test]
    fn continuous_no_frame_rolls_back_arena() {
        let mut conn = test_conn();
        conn.buf_accessor.with_buf(|b| b.extend_from_slice(b"queued"));
        let before = conn.buf_accessor.len();
        let (aead, hc) = (XorAead, NullHeaderCipher);
        let mut sock = FakeSocket::new();
        let settings = settings_for(PacketAssembler::ContinuousMemory);
        let mut batch = IoBufBatch::new(SocketPair::single(&mut sock), &settings);
        let result = PacketAssembler::ContinuousMemory
            .build_schedule_encrypt(
                &mut conn,
                &mut batch,
                &mut Nothing,
                short_header(0),
                1200,
                &keys(&aead, &hc),
            )
            .unwrap();
        assert!(matches!(result, DataPathResult::BuildFailure));
        assert!(conn.buf_accessor.owns_buffer());
        assert_eq!(conn.buf_accessor.len(), before);
    }

    #[test]
    fn no_frame_is_reported_to_loop_detector() {
        let mut conn = test_conn();
        let detector = std::sync::Arc::new(crate::test_util::RecordingLoopDetector::default());
        conn.loop_detector = Some(detector.clone());
        let (aead, hc) = (XorAead, NullHeaderCipher);
        let mut sock = FakeSocket::new();
        let settings = conn.settings.clone();
        let mut batch = IoBufBatch::new(SocketPair::single(&mut sock), &settings);
        PacketAssembler::ChainedMemory
            .build_schedule_encrypt(
                &mut conn,
                &mut batch,
                &mut Nothing,
                short_header(0),
                1200,
                &keys(&aead, &hc),
            )
            .unwrap();
        assert_eq!(conn.write_debug_state.no_write_reason, NoWriteReason::NoFrame);
        assert_eq!(conn.write_debug_state.scheduler_name, "Nothing");
        assert_eq!(detector.reasons(), vec![NoWriteReason::NoFrame]);
    }

    #[test]
    fn strategies_produce_identical_datagrams() {
        let (aead, hc) = (XorAead, NullHeaderCipher);
        let mut datagrams = Vec::new();
        for assembler in [PacketAssembler::ContinuousMemory, PacketAssembler::ChainedMemory] {
            let mut conn = stream_conn(0, vec![9u8; 1000]);
            let mut sock = FakeSocket::new();
            {
                let settings = settings_for(assembler);
                let mut batch = IoBufBatch::new(SocketPair::single(&mut sock), &settings);
                let mut scheduler = crate::test_util::app_data_scheduler();
                let header = HeaderBuilder::Short.build(
                    &crate::test_util::cid(),
                    &crate::test_util::cid(),
                    0,
                    crate::types::QuicVersion::V1,
                    &Bytes::new(),
                );
                let DataPathResult::Built(packet) = assembler
                    .build_schedule_encrypt(
                        &mut conn,
                        &mut batch,
                        scheduler.as_mut(),
                        header,
                        1200 - 16,
                        &keys(&aead, &hc),
                    )
                    .unwrap()
                else {
                    panic!("expected a packet");
                };
                assert!(packet.write_success);
                assert!(packet.encoded_size <= 1200);
                assert!(matches!(packet.packet.frames[0], WriteFrame::Stream(_)));
            }
            assert!(conn.buf_accessor.is_empty());
            datagrams.push(sock.sent.remove(0));
        }
        assert_eq!(datagrams[0], datagrams[1]);
    }

    fn assert_no_body_failure(assembler: PacketAssembler) {
        let mut conn = test_conn();
        let detector = Arc::new(RecordingLoopDetector::default());
        conn.loop_detector = Some(detector.clone());
        conn.buf_accessor.with_buf(|b| b.extend_from_slice(b"earlier"));
        let before = conn.buf_accessor.len();
        let header = short_header(0);
        let header_len = {
            let mut buf = BytesMut::new();
            header.encode(&mut buf, None);
            buf.len()
        };
        let (aead, hc) = (XorAead, NullHeaderCipher);
        let sealing = SealingParams {
            max_packet_len: header_len,
            ..keys(&aead, &hc)
        };
        let mut sock = FakeSocket::new();
        {
            let settings = settings_for(assembler);
            let mut batch = IoBufBatch::new(SocketPair::single(&mut sock), &settings);
            let result = assembler
                .build_schedule_encrypt(&mut conn, &mut batch, &mut ZeroBody, header, 1200, &sealing)
                .unwrap();
            assert!(matches!(result, DataPathResult::BuildFailure));
        }
        assert!(conn.buf_accessor.owns_buffer());
        assert_eq!(conn.buf_accessor.len(), before);
        assert_eq!(conn.next_packet_num(PacketNumberSpace::AppData), 0);
        assert_eq!(conn.write_debug_state.no_write_reason, NoWriteReason::NoBody);
        assert_eq!(detector.reasons(), vec![NoWriteReason::NoBody]);
        assert!(sock.sent.is_empty());
    }

    #[test]
    fn continuous_frames_without_body_roll_back() {
        assert_no_body_failure(PacketAssembler::ContinuousMemory);
    }

    #[test]
    fn chained_frames_without_body_fail_build() {
        assert_no_body_failure(PacketAssembler::ChainedMemory);
    }

    #[test]
    fn build_failure_leaves_thread_local_batch_for_final_flush() {
        let mut conn = test_conn();
        let (aead, hc) = (XorAead, NullHeaderCipher);
        let mut sock = FakeSocket::new();
        {
            let settings = TransportSettings {
                batching_mode: BatchingMode::ThreadLocal,
                thread_local_delay: std::time::Duration::from_secs(60),
                ..TransportSettings::default()
            };
            let mut batch = IoBufBatch::new(SocketPair::single(&mut sock), &settings);
            batch
                .write(&mut conn, Some(Bytes::from_static(b"queued")), 6)
                .unwrap();
            let result = PacketAssembler::ChainedMemory
                .build_schedule_encrypt(
                    &mut conn,
                    &mut batch,
                    &mut Nothing,
                    short_header(0),
                    1200,
                    &keys(&aead, &hc),
                )
                .unwrap();
            assert!(matches!(result, DataPathResult::BuildFailure));
            assert!(!batch.is_empty());
            batch.flush(&mut conn, FlushMode::Always).unwrap();
        }
        assert_eq!(sock.sent, vec![b"queued".to_vec()]);
    }
}
