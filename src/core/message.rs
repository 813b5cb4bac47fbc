//! # Message Envelope
//!
//! Every message on a framed connection starts with a fixed 12-byte head:
//!
//! ```text
//! [len:u32] [error:u16] [cmd:u8] [act:u8] [index:u16] [flags:u16]
//! ```
//!
//! All fields are little-endian. A message without a head belongs to a
//! line-delimited connection and carries its payload (including the `\n`) as-is.

use crate::config::{MAX_MSG_DATA_SIZE, MSG_HEAD_SIZE};
use crate::error::{codes, ProtocolError, Result};
use crate::parser::Parsed;
use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Head flag bits
pub mod flags {
    pub const ENCRYPT: u16 = 1 << 0;
    pub const COMPRESS: u16 = 1 << 1;
    pub const CONTINUE: u16 = 1 << 2;
    pub const NEED_ACK: u16 = 1 << 3;
    pub const ACK: u16 = 1 << 4;
    pub const RESEND: u16 = 1 << 5;
    /// Set by clients so an index can be told apart from server-assigned ones
    pub const CLIENT: u16 = 1 << 6;
}

/// Route key of a message
#[inline]
pub fn cmd_act(cmd: u8, act: u8) -> u16 {
    (cmd as u16) << 8 | act as u16
}

/// Correlation key of one outstanding exchange
#[inline]
pub fn tag(cmd: u8, act: u8, index: u16) -> u32 {
    (cmd as u32) << 16 | (act as u32) << 8 | index as u32
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MessageHead {
    pub len: u32,
    pub error: u16,
    pub cmd: u8,
    pub act: u8,
    pub index: u16,
    pub flags: u16,
}

impl MessageHead {
    pub fn new(cmd: u8, act: u8, index: u16) -> Self {
        Self {
            cmd,
            act,
            index,
            ..Self::default()
        }
    }

    /// Pack the head into its wire form
    pub fn to_bytes(&self) -> [u8; MSG_HEAD_SIZE] {
        let mut out = [0u8; MSG_HEAD_SIZE];
        out[0..4].copy_from_slice(&self.len.to_le_bytes());
        out[4..6].copy_from_slice(&self.error.to_le_bytes());
        out[6] = self.cmd;
        out[7] = self.act;
        out[8..10].copy_from_slice(&self.index.to_le_bytes());
        out[10..12].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    /// Unpack a head, rejecting lengths above the default maximum
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::from_bytes_with_limit(data, MAX_MSG_DATA_SIZE)
    }

    /// Unpack a head, rejecting lengths above `max_len`
    pub fn from_bytes_with_limit(data: &[u8], max_len: u32) -> Result<Self> {
        if data.len() < MSG_HEAD_SIZE {
            return Err(ProtocolError::MsgLenTooShort(data.len()));
        }

        let head = Self {
            len: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            error: u16::from_le_bytes([data[4], data[5]]),
            cmd: data[6],
            act: data[7],
            index: u16::from_le_bytes([data[8], data[9]]),
            flags: u16::from_le_bytes([data[10], data[11]]),
        };

        if head.len > max_len {
            return Err(ProtocolError::MsgLenTooLong(head.len));
        }
        Ok(head)
    }

    pub fn cmd_act(&self) -> u16 {
        cmd_act(self.cmd, self.act)
    }

    pub fn tag(&self) -> u32 {
        tag(self.cmd, self.act, self.index)
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

impl fmt::Display for MessageHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Len:{} Error:{} Cmd:{} Act:{} Index:{} Flags:{}",
            self.len, self.error, self.cmd, self.act, self.index, self.flags
        )
    }
}

/// One unit of traffic on a connection.
///
/// Cloning is cheap: the payload and any attached values are shared.
#[derive(Clone, Default)]
pub struct Message {
    /// `None` on line-delimited connections
    pub head: Option<MessageHead>,
    pub data: Bytes,
    /// Decoded body, attached by the connection's parser
    pub parsed: Option<Arc<Parsed>>,
    pub user: Option<Arc<dyn Any + Send + Sync>>,
}

impl Message {
    pub fn new(cmd: u8, act: u8, index: u16, error: u16, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            head: Some(MessageHead {
                len: data.len() as u32,
                error,
                cmd,
                act,
                index,
                flags: 0,
            }),
            data,
            ..Self::default()
        }
    }

    /// Head-only message, typically a request without a body
    pub fn new_tag(cmd: u8, act: u8, index: u16) -> Self {
        Self {
            head: Some(MessageHead::new(cmd, act, index)),
            ..Self::default()
        }
    }

    /// Framed message with a zeroed route
    pub fn new_data(data: impl Into<Bytes>) -> Self {
        Self::new(0, 0, 0, 0, data)
    }

    /// Headless message for line-delimited connections
    pub fn new_str(s: impl Into<String>) -> Self {
        Self {
            data: Bytes::from(s.into()),
            ..Self::default()
        }
    }

    /// Head-only message carrying the code of `err`
    pub fn new_err(err: &ProtocolError) -> Self {
        Self {
            head: Some(MessageHead {
                error: err.code(),
                ..MessageHead::default()
            }),
            ..Self::default()
        }
    }

    /// Copy cmd, act and index from `other`. No-op unless both carry a head.
    pub fn copy_tag(mut self, other: &Message) -> Self {
        if let (Some(head), Some(src)) = (self.head.as_mut(), other.head.as_ref()) {
            head.cmd = src.cmd;
            head.act = src.act;
            head.index = src.index;
        }
        self
    }

    /// 0 for headless messages
    pub fn cmd_act(&self) -> u16 {
        self.head.as_ref().map_or(0, MessageHead::cmd_act)
    }

    /// 0 for headless messages
    pub fn tag(&self) -> u32 {
        self.head.as_ref().map_or(0, MessageHead::tag)
    }

    /// Error carried in the head, if any
    pub fn error(&self) -> Option<ProtocolError> {
        self.head
            .as_ref()
            .filter(|h| h.error != codes::OK)
            .and_then(|h| ProtocolError::from_code(h.error))
    }

    /// Bytes this message occupies on the wire
    pub fn wire_len(&self) -> usize {
        match self.head {
            Some(_) => MSG_HEAD_SIZE + self.data.len(),
            None => self.data.len(),
        }
    }

    /// Replace the payload and keep `head.len` in step with it
    pub fn set_data(&mut self, data: impl Into<Bytes>) {
        self.data = data.into();
        if let Some(head) = self.head.as_mut() {
            head.len = self.data.len() as u32;
        }
    }

    pub fn with_user(mut self, user: Arc<dyn Any + Send + Sync>) -> Self {
        self.user = Some(user);
        self
    }

    /// Decoded request body, if the parser produced one of type `T`
    pub fn c2s<T: 'static>(&self) -> Option<&T> {
        self.parsed.as_deref().and_then(|p| p.c2s::<T>())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("head", &self.head)
            .field("data_len", &self.data.len())
            .field("parsed", &self.parsed.is_some())
            .finish()
    }
}
