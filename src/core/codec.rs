//! # Message Codec
//!
//! Tokio codec that frames [`Message`]s over a byte stream.
//!
//! Two framing modes are supported:
//! - **Msg**: 12-byte head followed by `head.len` payload bytes
//! - **Cmd**: newline-delimited lines, delivered with the trailing `\n`
//!
//! The decoder keeps a parsed head between calls so a large payload is only
//! waited on, never re-parsed.

use crate::config::{MAX_MSG_DATA_SIZE, MSG_HEAD_SIZE};
use crate::core::message::{Message, MessageHead};
use crate::error::{ProtocolError, Result};
use crate::msgque::MsgType;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone)]
pub struct MessageCodec {
    mode: MsgType,
    max_len: u32,
    pending: Option<MessageHead>,
}

impl MessageCodec {
    pub fn new(mode: MsgType) -> Self {
        Self::with_max_len(mode, MAX_MSG_DATA_SIZE)
    }

    /// `max_len` bounds both payload length in Msg mode and line length in Cmd mode
    pub fn with_max_len(mode: MsgType, max_len: u32) -> Self {
        Self {
            mode,
            max_len,
            pending: None,
        }
    }

    pub fn mode(&self) -> MsgType {
        self.mode
    }

    fn decode_msg(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        let head = match self.pending {
            Some(head) => head,
            None => {
                if src.len() < MSG_HEAD_SIZE {
                    return Ok(None);
                }
                let head = MessageHead::from_bytes_with_limit(&src[..MSG_HEAD_SIZE], self.max_len)?;
                src.advance(MSG_HEAD_SIZE);
                head
            }
        };

        let len = head.len as usize;
        if src.len() < len {
            self.pending = Some(head);
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.pending = None;
        let data = src.split_to(len).freeze();
        Ok(Some(Message {
            head: Some(head),
            data,
            ..Message::default()
        }))
    }

    fn decode_cmd(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        match src.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let line = src.split_to(pos + 1).freeze();
                Ok(Some(Message {
                    data: line,
                    ..Message::default()
                }))
            }
            None if src.len() > self.max_len as usize => {
                Err(ProtocolError::MsgLenTooLong(src.len() as u32))
            }
            None => Ok(None),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.mode {
            MsgType::Msg => self.decode_msg(src),
            MsgType::Cmd => self.decode_cmd(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None if src.is_empty() && self.pending.is_none() => Ok(None),
            // A line cut off by EOF is still a line
            None if self.mode == MsgType::Cmd => Ok(Some(Message {
                data: src.split().freeze(),
                ..Message::default()
            })),
            None => Err(ProtocolError::MsgLenTooShort(src.len())),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        match (self.mode, msg.head) {
            (MsgType::Msg, Some(mut head)) => {
                head.len = msg.data.len() as u32;
                dst.reserve(MSG_HEAD_SIZE + msg.data.len());
                dst.put_slice(&head.to_bytes());
                dst.put_slice(&msg.data);
            }
            (MsgType::Msg, None) => {
                return Err(ProtocolError::Custom(
                    "message without head on a framed connection".to_string(),
                ))
            }
            (MsgType::Cmd, _) => {
                dst.reserve(msg.data.len());
                dst.put_slice(&msg.data);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_decode_waits_for_full_payload() {
        let mut codec = MessageCodec::new(MsgType::Msg);
        let mut wire = BytesMut::new();
        codec
            .encode(Message::new(1, 2, 3, 0, b"hello".to_vec()), &mut wire)
            .unwrap();

        let mut buf = BytesMut::from(&wire[..14]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.len() == 2);

        buf.extend_from_slice(&wire[14..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&msg.data[..], b"hello");
        assert_eq!(msg.tag(), crate::core::message::tag(1, 2, 3));
        assert!(buf.is_empty());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_zero_length_payload_dispatches_immediately() {
        let mut codec = MessageCodec::new(MsgType::Msg);
        let mut buf = BytesMut::from(&MessageHead::new(5, 6, 7).to_bytes()[..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert!(msg.data.is_empty());
        assert_eq!(msg.head.map(|h| h.cmd), Some(5));
    }

    #[test]
    fn test_oversize_head_is_rejected() {
        let mut codec = MessageCodec::with_max_len(MsgType::Msg, 16);
        let head = MessageHead {
            len: 17,
            ..MessageHead::default()
        };
        let mut buf = BytesMut::from(&head.to_bytes()[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MsgLenTooLong(17))
        ));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_cmd_mode_keeps_newline() {
        let mut codec = MessageCodec::new(MsgType::Cmd);
        let mut buf = BytesMut::from(&b"get gamer 1 level\nsecond"[..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert!(msg.head.is_none());
        assert_eq!(&msg.data[..], b"get gamer 1 level\n");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        let tail = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(&tail.data[..], b"second");
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_cmd_encoder_writes_payload_only() {
        let mut codec = MessageCodec::new(MsgType::Cmd);
        let mut dst = BytesMut::new();
        codec.encode(Message::new_str("pong\n"), &mut dst).unwrap();
        assert_eq!(&dst[..], b"pong\n");
    }

    #[test]
    fn test_headless_message_is_refused_in_msg_mode() {
        let mut codec = MessageCodec::new(MsgType::Msg);
        let mut dst = BytesMut::new();
        assert!(codec
            .encode(Message::new_str("hello world!\n"), &mut dst)
            .is_err());
        assert!(dst.is_empty());
    }

    #[test]
    fn test_truncated_frame_at_eof() {
        let mut codec = MessageCodec::new(MsgType::Msg);
        let mut buf = BytesMut::from(&[1u8, 0, 0][..]);
        assert!(codec.decode_eof(&mut buf).is_err());
    }
}
