//! # Serialization Formats
//!
//! Serde-backed payload formats used by the parser layer.
//! Supports bincode, JSON and MessagePack; each maps its failures onto the
//! matching wire error code so a remind reply tells the peer what went wrong.
//!
//! ## Performance Characteristics
//! - **Bincode**: fastest, binary, not self-describing
//! - **MessagePack**: compact, binary, self-describing
//! - **JSON**: human-readable, text
//!
//! ## Usage
//! ```rust
//! use netque::core::serialization::SerializationFormat;
//!
//! let bytes = SerializationFormat::Json.encode(&vec![1u32, 2, 3]).unwrap();
//! assert_eq!(bytes, b"[1,2,3]");
//! let back: Vec<u32> = SerializationFormat::Json.decode(&bytes).unwrap();
//! assert_eq!(back, vec![1, 2, 3]);
//! ```

use crate::error::{ProtocolError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Supported serialization formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializationFormat {
    /// Binary compact format
    Bincode,
    /// Human-readable JSON format (default, matches browser and script clients)
    #[default]
    Json,
    /// Compact binary format (MessagePack)
    MessagePack,
}

impl SerializationFormat {
    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            SerializationFormat::Bincode => "Bincode",
            SerializationFormat::Json => "JSON",
            SerializationFormat::MessagePack => "MessagePack",
        }
    }

    /// Serialize `value` in this format
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            SerializationFormat::Bincode => {
                bincode::serialize(value).map_err(|e| ProtocolError::ProtoPack(e.to_string()))
            }
            SerializationFormat::Json => {
                serde_json::to_vec(value).map_err(|e| ProtocolError::JsonPack(e.to_string()))
            }
            SerializationFormat::MessagePack => rmp_serde::to_vec_named(value)
                .map_err(|e| ProtocolError::MsgPackPack(e.to_string())),
        }
    }

    /// Deserialize a `T` from `data`
    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> Result<T> {
        match self {
            SerializationFormat::Bincode => Ok(bincode::deserialize(data)?),
            SerializationFormat::Json => {
                serde_json::from_slice(data).map_err(|e| ProtocolError::JsonUnpack(e.to_string()))
            }
            SerializationFormat::MessagePack => rmp_serde::from_slice(data)
                .map_err(|e| ProtocolError::MsgPackUnpack(e.to_string())),
        }
    }

    /// The error a failed decode in this format maps to
    pub fn unpack_error(self, detail: impl Into<String>) -> ProtocolError {
        match self {
            SerializationFormat::Bincode => ProtocolError::ProtoUnpack(detail.into()),
            SerializationFormat::Json => ProtocolError::JsonUnpack(detail.into()),
            SerializationFormat::MessagePack => ProtocolError::MsgPackUnpack(detail.into()),
        }
    }
}
