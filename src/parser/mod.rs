//! # Parsers
//!
//! Turns message payloads into typed request objects and back.
//!
//! A [`Parser`] is a registration table. Bodies are bound either to a
//! `(cmd, act)` route, used when a message carries a head, or registered as a
//! headless message type, tried in registration order when it does not.
//! Each entry knows how to build a fresh request (client to server) and reply
//! (server to client) instance.
//!
//! [`Parser::build`] freezes the table into a shared [`MsgCodec`], which every
//! connection started with it uses to decode inbound traffic.
//!
//! ## Example
//! ```rust
//! use netque::parser::{Parser, ParserType, ParseErrorPolicy};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Default, Serialize, Deserialize)]
//! struct Login { name: String }
//!
//! #[derive(Default, Serialize, Deserialize)]
//! struct LoginReply { ok: bool }
//!
//! let mut parser = Parser::new(ParserType::Json, ParseErrorPolicy::SendRemind);
//! parser.register::<Login, LoginReply>(1, 1);
//! let codec = parser.build().expect("json parser");
//! ```

pub mod cmd;
pub mod protobuf;
pub mod serde_codec;

use crate::core::message::{cmd_act, Message};
use crate::core::serialization::SerializationFormat;
use crate::error::{ProtocolError, Result};
use crate::msgque::MsgType;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

pub use cmd::{CmdArgs, CmdField, CmdKind, CmdMsg, CmdValue};

/// Payload encoding of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserType {
    /// Protocol buffers via `prost`
    Pb,
    Json,
    MsgPack,
    Bincode,
    /// Whitespace separated text commands
    Cmd,
    /// No parsing, handlers see raw bytes
    Raw,
}

impl ParserType {
    pub(crate) fn serde_format(self) -> Option<SerializationFormat> {
        match self {
            ParserType::Json => Some(SerializationFormat::Json),
            ParserType::MsgPack => Some(SerializationFormat::MessagePack),
            ParserType::Bincode => Some(SerializationFormat::Bincode),
            _ => None,
        }
    }
}

/// What the connection does when a payload fails to parse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseErrorPolicy {
    /// Reply with an error message on the same tag and skip dispatch
    #[default]
    SendRemind,
    /// Skip the message
    Continue,
    /// Dispatch the message without a parsed body
    Always,
    /// Close the connection
    Close,
}

/// Builds a fresh, empty body instance
pub type Factory = Arc<dyn Fn() -> Box<dyn Any + Send + Sync> + Send + Sync>;

/// Decodes a payload into a body instance
pub type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send + Sync>> + Send + Sync>;

/// Encodes a body instance of one concrete type
pub type EncodeFn = Arc<dyn Fn(&dyn Any) -> Result<Vec<u8>> + Send + Sync>;

/// Decoding contract used by connections
pub trait MsgCodec: Send + Sync {
    fn kind(&self) -> ParserType;

    fn error_policy(&self) -> ParseErrorPolicy;

    /// Decode an inbound message into its registered request body
    fn parse_c2s(&self, msg: &Message) -> Result<Parsed>;

    /// Encode any body type this codec has registered
    fn pack(&self, value: &dyn Any) -> Result<Vec<u8>>;

    /// Reply sent for a failed parse under [`ParseErrorPolicy::SendRemind`]
    fn remind_msg(&self, err: &ProtocolError, mode: MsgType) -> Option<Message> {
        match mode {
            MsgType::Msg => Some(Message::new_err(err)),
            MsgType::Cmd => Some(Message::new_str(format!("{err}\n"))),
        }
    }
}

/// Decoded request attached to an inbound message
pub struct Parsed {
    c2s: Option<Box<dyn Any + Send + Sync>>,
    c2s_encode: Option<EncodeFn>,
    s2c_new: Option<Factory>,
}

impl Parsed {
    pub fn new(
        c2s: Box<dyn Any + Send + Sync>,
        c2s_encode: Option<EncodeFn>,
        s2c_new: Option<Factory>,
    ) -> Self {
        Self {
            c2s: Some(c2s),
            c2s_encode,
            s2c_new,
        }
    }

    /// The request body, if it is a `T`
    pub fn c2s<T: 'static>(&self) -> Option<&T> {
        self.c2s.as_deref().and_then(|v| v.downcast_ref::<T>())
    }

    /// The request body as an untyped value
    pub fn c2s_any(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.c2s.as_deref()
    }

    /// Concrete type of the request body
    pub fn c2s_type_id(&self) -> Option<TypeId> {
        self.c2s.as_deref().map(|v| v.type_id())
    }

    /// Fresh reply instance for this route
    pub fn new_s2c(&self) -> Option<Box<dyn Any + Send + Sync>> {
        self.s2c_new.as_ref().map(|f| f())
    }

    /// Fresh reply instance for this route, if it is a `T`
    pub fn new_s2c_as<T: 'static>(&self) -> Option<T> {
        self.new_s2c()
            .and_then(|b| b.downcast::<T>().ok())
            .map(|b| *b)
    }

    /// Re-encode the request body with the codec that decoded it
    pub fn c2s_data(&self) -> Option<Vec<u8>> {
        let value = self.c2s.as_deref()?;
        let encode = self.c2s_encode.as_ref()?;
        encode(value).ok()
    }

    pub fn c2s_string(&self) -> Option<String> {
        self.c2s_data()
            .map(|data| String::from_utf8_lossy(&data).into_owned())
    }
}

impl fmt::Debug for Parsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parsed")
            .field("c2s", &self.c2s.is_some())
            .field("s2c", &self.s2c_new.is_some())
            .finish()
    }
}

/// One registered body binding
#[derive(Clone)]
pub(crate) struct Route {
    pub(crate) decode: DecodeFn,
    pub(crate) c2s_new: Factory,
    pub(crate) c2s_encode: Option<EncodeFn>,
    pub(crate) s2c_new: Option<Factory>,
}

impl Route {
    /// Decode `data`, or build an empty body when there is no payload
    pub(crate) fn parse(&self, data: &[u8]) -> Result<Parsed> {
        let c2s = if data.is_empty() {
            (self.c2s_new)()
        } else {
            (self.decode)(data)?
        };
        Ok(Parsed::new(c2s, self.c2s_encode.clone(), self.s2c_new.clone()))
    }
}

/// Frozen registration table shared by the table-driven codecs
#[derive(Clone, Default)]
pub(crate) struct Registry {
    pub(crate) routes: HashMap<u16, Route>,
    pub(crate) typed: Vec<Route>,
    pub(crate) encoders: HashMap<TypeId, EncodeFn>,
}

impl Registry {
    /// Route lookup for headed messages, ordered trial for headless ones
    pub(crate) fn parse_with(
        &self,
        msg: &Message,
        unpack_err: impl Fn(String) -> ProtocolError,
    ) -> Result<Parsed> {
        match msg.head {
            Some(head) => match self.routes.get(&head.cmd_act()) {
                Some(route) => route.parse(&msg.data),
                None => Err(unpack_err(format!(
                    "no route for cmd {} act {}",
                    head.cmd, head.act
                ))),
            },
            None => {
                if msg.data.is_empty() {
                    return Err(unpack_err("empty payload".into()));
                }
                self.typed
                    .iter()
                    .find_map(|route| (route.decode)(&msg.data).ok().map(|c2s| (route, c2s)))
                    .map(|(route, c2s)| {
                        Parsed::new(c2s, route.c2s_encode.clone(), route.s2c_new.clone())
                    })
                    .ok_or_else(|| unpack_err("no registered message matched".into()))
            }
        }
    }

    pub(crate) fn pack(&self, value: &dyn Any) -> Option<Result<Vec<u8>>> {
        self.encoders
            .get(&(*value).type_id())
            .map(|encode| encode(value))
    }
}

/// Registration table for one payload encoding
pub struct Parser {
    kind: ParserType,
    policy: ParseErrorPolicy,
    registry: Registry,
    cmd: cmd::CmdTrie,
}

impl Parser {
    pub fn new(kind: ParserType, policy: ParseErrorPolicy) -> Self {
        Self {
            kind,
            policy,
            registry: Registry::default(),
            cmd: cmd::CmdTrie::new(),
        }
    }

    pub fn kind(&self) -> ParserType {
        self.kind
    }

    pub fn error_policy(&self) -> ParseErrorPolicy {
        self.policy
    }

    /// Bind serde body types to a `(cmd, act)` route.
    ///
    /// Valid for the JSON, MessagePack and bincode parsers.
    pub fn register<C, S>(&mut self, cmd: u8, act: u8) -> &mut Self
    where
        C: serde_codec::SerdeBody,
        S: serde_codec::SerdeBody,
    {
        match self.kind.serde_format() {
            Some(format) => {
                let route = serde_codec::route::<C, S>(format, &mut self.registry.encoders);
                self.registry.routes.insert(cmd_act(cmd, act), route);
            }
            None => warn!(kind = ?self.kind, cmd, act, "serde body registered on non-serde parser"),
        }
        self
    }

    /// Register serde body types for headless messages
    pub fn register_msg<C, S>(&mut self) -> &mut Self
    where
        C: serde_codec::SerdeBody,
        S: serde_codec::SerdeBody,
    {
        match self.kind.serde_format() {
            Some(format) => {
                let route = serde_codec::route::<C, S>(format, &mut self.registry.encoders);
                self.registry.typed.push(route);
            }
            None => warn!(kind = ?self.kind, "serde message registered on non-serde parser"),
        }
        self
    }

    /// Bind protobuf body types to a `(cmd, act)` route
    pub fn register_pb<C, S>(&mut self, cmd: u8, act: u8) -> &mut Self
    where
        C: protobuf::PbBody,
        S: protobuf::PbBody,
    {
        if self.kind != ParserType::Pb {
            warn!(kind = ?self.kind, cmd, act, "protobuf body registered on non-protobuf parser");
            return self;
        }
        let route = protobuf::route::<C, S>(&mut self.registry.encoders);
        self.registry.routes.insert(cmd_act(cmd, act), route);
        self
    }

    /// Register protobuf body types for headless messages
    pub fn register_pb_msg<C, S>(&mut self) -> &mut Self
    where
        C: protobuf::PbBody,
        S: protobuf::PbBody,
    {
        if self.kind != ParserType::Pb {
            warn!(kind = ?self.kind, "protobuf message registered on non-protobuf parser");
            return self;
        }
        let route = protobuf::route::<C, S>(&mut self.registry.encoders);
        self.registry.typed.push(route);
        self
    }

    /// Add a command shape to the cmd grammar
    pub fn register_cmd<C, S>(&mut self) -> &mut Self
    where
        C: CmdMsg + serde::Serialize,
        S: serde_codec::SerdeBody,
    {
        if self.kind != ParserType::Cmd {
            warn!(kind = ?self.kind, "cmd shape registered on non-cmd parser");
            return self;
        }
        self.cmd.register::<C, S>(&mut self.registry.encoders);
        self
    }

    /// Encode a registered body type without building a codec
    pub fn pack<T: Any>(&self, value: &T) -> Result<Vec<u8>> {
        self.registry
            .pack(value)
            .unwrap_or_else(|| Err(ProtocolError::ProtoPack(UNREGISTERED.into())))
    }

    pub fn pack_string<T: Any>(&self, value: &T) -> Result<String> {
        self.pack(value)
            .map(|data| String::from_utf8_lossy(&data).into_owned())
    }

    /// Freeze the table into a codec. `None` for [`ParserType::Raw`].
    pub fn build(self) -> Option<Arc<dyn MsgCodec>> {
        match self.kind {
            ParserType::Raw => None,
            ParserType::Pb => Some(Arc::new(protobuf::ProtobufCodec::new(
                self.policy,
                self.registry,
            ))),
            ParserType::Cmd => Some(Arc::new(cmd::CmdCodec::new(
                self.policy,
                self.cmd,
                self.registry.encoders,
            ))),
            ParserType::Json | ParserType::MsgPack | ParserType::Bincode => {
                let format = self.kind.serde_format().unwrap_or_default();
                Some(Arc::new(serde_codec::SerdeCodec::new(
                    self.kind,
                    format,
                    self.policy,
                    self.registry,
                )))
            }
        }
    }
}

impl fmt::Debug for Parser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parser")
            .field("kind", &self.kind)
            .field("policy", &self.policy)
            .field("routes", &self.registry.routes.len())
            .field("typed", &self.registry.typed.len())
            .finish()
    }
}

const UNREGISTERED: &str = "type is not registered with this parser";

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Pong {
        seq: u32,
    }

    #[test]
    fn test_raw_parser_builds_nothing() {
        assert!(Parser::new(ParserType::Raw, ParseErrorPolicy::Close)
            .build()
            .is_none());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_parsed_accessors() {
        let mut parser = Parser::new(ParserType::Json, ParseErrorPolicy::SendRemind);
        parser.register::<Ping, Pong>(1, 2);
        let codec = parser.build().unwrap();

        let parsed = codec
            .parse_c2s(&Message::new(1, 2, 0, 0, br#"{"seq":7}"#.to_vec()))
            .unwrap();
        assert_eq!(parsed.c2s::<Ping>(), Some(&Ping { seq: 7 }));
        assert!(parsed.c2s::<Pong>().is_none());
        assert_eq!(parsed.new_s2c_as::<Pong>(), Some(Pong::default()));
        assert_eq!(parsed.c2s_string().as_deref(), Some(r#"{"seq":7}"#));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_pack_requires_registration() {
        let mut parser = Parser::new(ParserType::Json, ParseErrorPolicy::SendRemind);
        parser.register::<Ping, Pong>(1, 2);
        assert_eq!(parser.pack_string(&Pong { seq: 3 }).unwrap(), r#"{"seq":3}"#);
        assert!(parser.pack(&"unregistered").is_err());
    }

    #[test]
    fn test_mismatched_registration_is_ignored() {
        let mut parser = Parser::new(ParserType::Pb, ParseErrorPolicy::SendRemind);
        parser.register::<Ping, Pong>(1, 2);
        assert!(parser.registry.routes.is_empty());
    }
}
