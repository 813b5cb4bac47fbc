//! # Error Types
//!
//! Error handling for the message queue runtime.
//!
//! Errors fall into four groups and are handled differently by the connection core:
//! - **Transport errors** (EOF, reset, timeout): close the connection, never propagate past it
//! - **Framing errors** (oversized or truncated head): close the connection
//! - **Codec errors**: resolved per the parser's [`ParseErrorPolicy`](crate::parser::ParseErrorPolicy)
//! - **Application errors**: carried as data in [`MessageHead::error`](crate::core::message::MessageHead)
//!
//! Every variant maps to a stable numeric code so it can travel in a message head.
//!
//! ## Example Usage
//! ```rust
//! use netque::error::{ProtocolError, codes};
//!
//! let err = ProtocolError::JsonUnpack("expected value".into());
//! assert_eq!(err.code(), codes::JSON_UNPACK);
//! ```

use std::io;
use thiserror::Error;

/// Numeric error codes carried in `MessageHead::error`.
///
/// Codes below [`MIN_USER_ERROR`](codes::MIN_USER_ERROR) are reserved by the runtime.
pub mod codes {
    pub const OK: u16 = 0;
    pub const DB: u16 = 1;
    pub const PROTO_PACK: u16 = 2;
    pub const PROTO_UNPACK: u16 = 3;
    pub const MSGPACK_PACK: u16 = 4;
    pub const MSGPACK_UNPACK: u16 = 5;
    pub const PB_PACK: u16 = 6;
    pub const PB_UNPACK: u16 = 7;
    pub const JSON_PACK: u16 = 8;
    pub const JSON_UNPACK: u16 = 9;
    pub const CMD_UNPACK: u16 = 10;
    pub const MSG_LEN_TOO_LONG: u16 = 11;
    pub const MSG_LEN_TOO_SHORT: u16 = 12;
    pub const SERVE_PANIC: u16 = 17;
    pub const CONFIG: u16 = 50;
    pub const NET_TIMEOUT: u16 = 200;
    pub const NET_UNREACHABLE: u16 = 201;
    pub const CLIENT_RESERVE: u16 = 254;
    pub const NOT_FOUND: u16 = 255;

    /// First code available to applications
    pub const MIN_USER_ERROR: u16 = 256;
}

/// Error message constants for the hot paths, so the common cases don't allocate.
pub mod constants {
    pub const ERR_QUEUE_FULL: &str = "msgque write channel full";
}

// ProtocolError is the primary error type for all runtime operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("message length {0} exceeds the configured maximum")]
    MsgLenTooLong(u32),

    #[error("message too short: {0} bytes")]
    MsgLenTooShort(usize),

    #[error("protocol pack error: {0}")]
    ProtoPack(String),

    #[error("protocol unpack error: {0}")]
    ProtoUnpack(String),

    #[error("json pack error: {0}")]
    JsonPack(String),

    #[error("json unpack error: {0}")]
    JsonUnpack(String),

    #[error("msgpack pack error: {0}")]
    MsgPackPack(String),

    #[error("msgpack unpack error: {0}")]
    MsgPackUnpack(String),

    #[error("protobuf pack error: {0}")]
    PbPack(String),

    #[error("protobuf unpack error: {0}")]
    PbUnpack(String),

    #[error("cmd parse error: {0}")]
    CmdUnpack(String),

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("server internal error")]
    ServePanic,

    /// Error received from a peer as a bare code
    #[error("remote error code {0}")]
    Remote(u16),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Wire code for this error
    pub fn code(&self) -> u16 {
        match self {
            ProtocolError::Io(e) if e.kind() == io::ErrorKind::TimedOut => codes::NET_TIMEOUT,
            ProtocolError::Io(_) => codes::NET_UNREACHABLE,
            ProtocolError::MsgLenTooLong(_) => codes::MSG_LEN_TOO_LONG,
            ProtocolError::MsgLenTooShort(_) => codes::MSG_LEN_TOO_SHORT,
            ProtocolError::ProtoPack(_) => codes::PROTO_PACK,
            ProtocolError::ProtoUnpack(_) => codes::PROTO_UNPACK,
            ProtocolError::JsonPack(_) => codes::JSON_PACK,
            ProtocolError::JsonUnpack(_) => codes::JSON_UNPACK,
            ProtocolError::MsgPackPack(_) => codes::MSGPACK_PACK,
            ProtocolError::MsgPackUnpack(_) => codes::MSGPACK_UNPACK,
            ProtocolError::PbPack(_) => codes::PB_PACK,
            ProtocolError::PbUnpack(_) => codes::PB_UNPACK,
            ProtocolError::CmdUnpack(_) => codes::CMD_UNPACK,
            ProtocolError::Timeout => codes::NET_TIMEOUT,
            ProtocolError::ConfigError(_) => codes::CONFIG,
            ProtocolError::ServePanic => codes::SERVE_PANIC,
            ProtocolError::Remote(code) => *code,
            _ => codes::NOT_FOUND,
        }
    }

    /// Rebuild an error from a code found in a received head.
    ///
    /// Returns `None` for [`codes::OK`].
    pub fn from_code(code: u16) -> Option<Self> {
        let err = match code {
            codes::OK => return None,
            codes::MSG_LEN_TOO_LONG => ProtocolError::MsgLenTooLong(0),
            codes::MSG_LEN_TOO_SHORT => ProtocolError::MsgLenTooShort(0),
            codes::PROTO_PACK => ProtocolError::ProtoPack(String::new()),
            codes::PROTO_UNPACK => ProtocolError::ProtoUnpack(String::new()),
            codes::JSON_PACK => ProtocolError::JsonPack(String::new()),
            codes::JSON_UNPACK => ProtocolError::JsonUnpack(String::new()),
            codes::MSGPACK_PACK => ProtocolError::MsgPackPack(String::new()),
            codes::MSGPACK_UNPACK => ProtocolError::MsgPackUnpack(String::new()),
            codes::PB_PACK => ProtocolError::PbPack(String::new()),
            codes::PB_UNPACK => ProtocolError::PbUnpack(String::new()),
            codes::CMD_UNPACK => ProtocolError::CmdUnpack(String::new()),
            codes::SERVE_PANIC => ProtocolError::ServePanic,
            codes::NET_TIMEOUT => ProtocolError::Timeout,
            other => ProtocolError::Remote(other),
        };
        Some(err)
    }

    /// True for errors that must close the connection that produced them
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::MsgLenTooLong(_)
                | ProtocolError::MsgLenTooShort(_)
                | ProtocolError::DecompressionFailure
                | ProtocolError::ConnectionClosed
                | ProtocolError::Timeout
        )
    }
}

impl From<bincode::Error> for ProtocolError {
    fn from(e: bincode::Error) -> Self {
        ProtocolError::ProtoUnpack(e.to_string())
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_table() {
        assert_eq!(ProtocolError::MsgLenTooLong(5).code(), 11);
        assert_eq!(ProtocolError::MsgLenTooShort(3).code(), 12);
        assert_eq!(ProtocolError::JsonUnpack(String::new()).code(), 9);
        assert_eq!(ProtocolError::CmdUnpack(String::new()).code(), 10);
        assert_eq!(ProtocolError::Custom("x".into()).code(), codes::NOT_FOUND);
    }

    #[test]
    fn test_from_code_roundtrip() {
        assert!(ProtocolError::from_code(codes::OK).is_none());
        for code in [codes::PB_UNPACK, codes::MSGPACK_UNPACK, codes::JSON_UNPACK] {
            let err = ProtocolError::from_code(code).map(|e| e.code());
            assert_eq!(err, Some(code));
        }
        assert_eq!(
            ProtocolError::from_code(codes::MIN_USER_ERROR + 7).map(|e| e.code()),
            Some(codes::MIN_USER_ERROR + 7)
        );
    }

    #[test]
    fn test_framing_errors_are_fatal() {
        assert!(ProtocolError::MsgLenTooLong(1 << 30).is_fatal());
        assert!(ProtocolError::MsgLenTooShort(2).is_fatal());
        assert!(!ProtocolError::JsonUnpack(String::new()).is_fatal());
    }
}
