//! Error types.
//!
//! Recoverable outcomes of a transmit pass (nothing fit, socket back-pressure)
//! are plain values. `ConnectionError` is reserved for "the connection must
//! close" and carries the code the owning layer reports to the peer.

use std::fmt;
use thiserror::Error;

/// Transport error codes (RFC 9000 §20.1) used by the send path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorCode {
    NoError,
    InternalError,
    FlowControlError,
    ProtocolViolation,
}

impl TransportErrorCode {
    pub fn code(self) -> u64 {
        match self {
            TransportErrorCode::NoError => 0x0,
            TransportErrorCode::InternalError => 0x1,
            TransportErrorCode::FlowControlError => 0x3,
            TransportErrorCode::ProtocolViolation => 0xa,
        }
    }
}

/// Errors that never go on the wire as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalErrorCode {
    /// The network path is gone; close quietly.
    ConnectionAbandoned,
    InternalError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuicErrorCode {
    Application(u64),
    Local(LocalErrorCode),
    Transport(TransportErrorCode),
}

impl fmt::Display for QuicErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuicErrorCode::Application(code) => write!(f, "application error {code:#x}"),
            QuicErrorCode::Local(code) => write!(f, "local error {code:?}"),
            QuicErrorCode::Transport(code) => {
                write!(f, "transport error {code:?} ({:#x})", code.code())
            }
        }
    }
}

/// The connection must close.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} ({code})")]
pub struct ConnectionError {
    pub code: QuicErrorCode,
    pub message: String,
}

impl ConnectionError {
    pub fn local(code: LocalErrorCode, message: impl Into<String>) -> Self {
        ConnectionError {
            code: QuicErrorCode::Local(code),
            message: message.into(),
        }
    }

    pub fn transport(code: TransportErrorCode, message: impl Into<String>) -> Self {
        ConnectionError {
            code: QuicErrorCode::Transport(code),
            message: message.into(),
        }
    }

    /// True when the path died underneath us rather than a protocol failure.
    pub fn is_abandoned(&self) -> bool {
        self.code == QuicErrorCode::Local(LocalErrorCode::ConnectionAbandoned)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("AEAD encryption failed")]
    EncryptionFailed,
    #[error("invalid key material: {0}")]
    InvalidKey(&'static str),
}

impl From<CryptoError> for ConnectionError {
    fn from(err: CryptoError) -> Self {
        ConnectionError::transport(TransportErrorCode::InternalError, err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("{field} must be at least {min}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: u64,
        value: u64,
    },
}
