//! Transport settings that shape a transmit pass.
//!
//! Loaded from TOML through an all-optional input struct, then resolved
//! into validated settings with defaults filled in.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_UDP_SEND_PACKET_LEN: usize = 1252;
/// Smallest datagram a QUIC endpoint may assume (RFC 9000 §14).
pub const MIN_UDP_SEND_PACKET_LEN: usize = 1200;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 16;
pub const DEFAULT_THREAD_LOCAL_DELAY: Duration = Duration::from_millis(1);
pub const DEFAULT_WRITE_CONNECTION_DATA_PACKETS_LIMIT: u64 = 5;
pub const DEFAULT_WRITE_LIMIT_RTT_FRACTION: u32 = 25;
pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(100);

/// How datagrams are grouped before hitting the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchingMode {
    /// One datagram per socket write.
    #[default]
    None,
    /// Equal-size segments written in one call (GSO style).
    SizeBased,
    /// Batches may be held back across flushes until forced or aged out.
    ThreadLocal,
}

/// Which packet assembler strategy the connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataPathType {
    /// Header and body built as separate buffers, copied together to encrypt.
    #[default]
    ChainedMemory,
    /// Packets assembled in place in the connection's reused send arena.
    ContinuousMemory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportSettings {
    pub udp_send_packet_len: usize,
    pub batching_mode: BatchingMode,
    pub max_batch_size: usize,
    pub thread_local_delay: Duration,
    pub data_path_type: DataPathType,
    /// Batch size used when batching is off.
    pub write_connection_data_packets_limit: u64,
    /// Past the batch size, keep writing for at most `srtt / fraction`.
    pub write_limit_rtt_fraction: u32,
    pub default_initial_rtt: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings {
            udp_send_packet_len: DEFAULT_UDP_SEND_PACKET_LEN,
            batching_mode: BatchingMode::default(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            thread_local_delay: DEFAULT_THREAD_LOCAL_DELAY,
            data_path_type: DataPathType::default(),
            write_connection_data_packets_limit: DEFAULT_WRITE_CONNECTION_DATA_PACKETS_LIMIT,
            write_limit_rtt_fraction: DEFAULT_WRITE_LIMIT_RTT_FRACTION,
            default_initial_rtt: DEFAULT_INITIAL_RTT,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportSettingsInput {
    pub udp_send_packet_len: Option<usize>,
    pub batching_mode: Option<BatchingMode>,
    pub max_batch_size: Option<usize>,
    pub thread_local_delay_us: Option<u64>,
    pub data_path_type: Option<DataPathType>,
    pub write_connection_data_packets_limit: Option<u64>,
    pub write_limit_rtt_fraction: Option<u32>,
    pub default_initial_rtt_ms: Option<u64>,
}

fn at_least(field: &'static str, value: u64, min: u64) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::OutOfRange { field, min, value });
    }
    Ok(())
}

impl TransportSettingsInput {
    pub fn resolve(self) -> Result<TransportSettings, ConfigError> {
        let defaults = TransportSettings::default();

        let udp_send_packet_len = self
            .udp_send_packet_len
            .unwrap_or(defaults.udp_send_packet_len);
        at_least(
            "udp_send_packet_len",
            udp_send_packet_len as u64,
            MIN_UDP_SEND_PACKET_LEN as u64,
        )?;

        let max_batch_size = self.max_batch_size.unwrap_or(defaults.max_batch_size);
        at_least("max_batch_size", max_batch_size as u64, 1)?;

        let write_connection_data_packets_limit = self
            .write_connection_data_packets_limit
            .unwrap_or(defaults.write_connection_data_packets_limit);
        at_least(
            "write_connection_data_packets_limit",
            write_connection_data_packets_limit,
            1,
        )?;

        let write_limit_rtt_fraction = self
            .write_limit_rtt_fraction
            .unwrap_or(defaults.write_limit_rtt_fraction);
        at_least(
            "write_limit_rtt_fraction",
            write_limit_rtt_fraction as u64,
            1,
        )?;

        Ok(TransportSettings {
            udp_send_packet_len,
            batching_mode: self.batching_mode.unwrap_or(defaults.batching_mode),
            max_batch_size,
            thread_local_delay: self
                .thread_local_delay_us
                .map(Duration::from_micros)
                .unwrap_or(defaults.thread_local_delay),
            data_path_type: self.data_path_type.unwrap_or(defaults.data_path_type),
            write_connection_data_packets_limit,
            write_limit_rtt_fraction,
            default_initial_rtt: self
                .default_initial_rtt_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.default_initial_rtt),
        })
    }
}

impl TransportSettings {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(TransportSettings::default());
        }
        let parsed: TransportSettingsInput = toml::from_str(input)?;
        parsed.resolve()
    }

    /// Packets per pass before the RTT-fraction time limit takes over.
    pub fn batch_size(&self) -> u64 {
        match self.batching_mode {
            BatchingMode::None => self.write_connection_data_packets_limit,
            _ => self.max_batch_size as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_default() {
        let cfg = TransportSettings::from_toml_str("  \n").unwrap();
        assert_eq!(cfg, TransportSettings::default());
    }

    #[test]
    fn parse_toml_settings() {
        let toml = r#"
            udp_send_packet_len = 1452
            batching_mode = "size-based"
            max_batch_size = 8
            thread_local_delay_us = 500
            data_path_type = "continuous-memory"
            write_limit_rtt_fraction = 10
        "#;
        let cfg = TransportSettings::from_toml_str(toml).unwrap();
        assert_eq!(cfg.udp_send_packet_len, 1452);
        assert_eq!(cfg.batching_mode, BatchingMode::SizeBased);
        assert_eq!(cfg.max_batch_size, 8);
        assert_eq!(cfg.thread_local_delay, Duration::from_micros(500));
        assert_eq!(cfg.data_path_type, DataPathType::ContinuousMemory);
        assert_eq!(cfg.write_limit_rtt_fraction, 10);
        assert_eq!(
            cfg.write_connection_data_packets_limit,
            DEFAULT_WRITE_CONNECTION_DATA_PACKETS_LIMIT
        );
        assert_eq!(cfg.batch_size(), 8);
    }

    #[test]
    fn rejects_small_datagrams() {
        let err = TransportSettings::from_toml_str("udp_send_packet_len = 1000").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OutOfRange {
                field: "udp_send_packet_len",
                ..
            }
        ));
    }

    #[test]
    fn rejects_unknown_mode() {
        let err = TransportSettings::from_toml_str(r#"batching_mode = "sendmmsg""#).unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn unbatched_uses_packet_limit() {
        let cfg = TransportSettings::default();
        assert_eq!(cfg.batch_size(), DEFAULT_WRITE_CONNECTION_DATA_PACKETS_LIMIT);
    }
}
