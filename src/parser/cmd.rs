//! # Text Command Grammar
//!
//! Line commands such as `get gamer 1 level` are matched against a trie built
//! from registered command shapes. A shape is an ordered field list:
//!
//! - [`CmdField::Key`] matches one literal token, its own (lowercase) name
//! - [`CmdField::Value`] matches its name, then consumes the next token as a value
//!
//! A line parses only if every token is consumed and the walk ends on a node
//! where a shape was registered.
//!
//! ```rust
//! use netque::parser::{CmdArgs, CmdField, CmdKind, CmdMsg};
//! use netque::error::Result;
//!
//! #[derive(Default, serde::Serialize)]
//! struct GetLevel { gamer: i64 }
//!
//! impl CmdMsg for GetLevel {
//!     fn shape() -> Vec<CmdField> {
//!         vec![
//!             CmdField::Key("get"),
//!             CmdField::Value("gamer", CmdKind::Int),
//!             CmdField::Key("level"),
//!         ]
//!     }
//!
//!     fn from_args(args: &CmdArgs) -> Result<Self> {
//!         Ok(Self { gamer: args.int("gamer")? })
//!     }
//! }
//! ```

use super::serde_codec::SerdeBody;
use super::{EncodeFn, Factory, MsgCodec, ParseErrorPolicy, Parsed, ParserType};
use crate::core::message::Message;
use crate::error::{ProtocolError, Result};
use crate::msgque::MsgType;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Kind of value a [`CmdField::Value`] accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdKind {
    Str,
    Bool,
    Int,
    Uint,
    Float,
}

/// One field of a command shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdField {
    Key(&'static str),
    Value(&'static str, CmdKind),
}

impl CmdField {
    fn name(&self) -> String {
        match self {
            CmdField::Key(name) | CmdField::Value(name, _) => name.to_lowercase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CmdValue {
    Str(String),
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
}

impl CmdValue {
    /// Parse one token as `kind`
    pub fn parse(kind: CmdKind, token: &str) -> Result<Self> {
        let bad = || ProtocolError::CmdUnpack(format!("invalid {kind:?} value {token:?}"));
        Ok(match kind {
            CmdKind::Str => CmdValue::Str(token.to_string()),
            CmdKind::Bool => CmdValue::Bool(token == "1" || token.eq_ignore_ascii_case("true")),
            CmdKind::Int => {
                let (negative, digits) = match token.strip_prefix('-') {
                    Some(rest) => (true, rest),
                    None => (false, token.strip_prefix('+').unwrap_or(token)),
                };
                let magnitude = parse_radix(digits).ok_or_else(bad)?;
                let value = if negative {
                    0i64.checked_sub_unsigned(magnitude)
                } else {
                    i64::try_from(magnitude).ok()
                };
                CmdValue::Int(value.ok_or_else(bad)?)
            }
            CmdKind::Uint => CmdValue::Uint(parse_radix(token).ok_or_else(bad)?),
            CmdKind::Float => CmdValue::Float(token.parse().map_err(|_| bad())?),
        })
    }
}

fn parse_radix(token: &str) -> Option<u64> {
    let lower = token.to_ascii_lowercase();
    let (radix, digits) = if let Some(rest) = lower.strip_prefix("0x") {
        (16, rest)
    } else if let Some(rest) = lower.strip_prefix("0o") {
        (8, rest)
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (2, rest)
    } else {
        (10, lower.as_str())
    };
    u64::from_str_radix(digits, radix).ok()
}

/// Values collected while matching one line, keyed by lowercase field name.
///
/// Key fields are present too, holding their own name as a string.
#[derive(Debug, Clone, Default)]
pub struct CmdArgs {
    values: HashMap<String, CmdValue>,
}

impl CmdArgs {
    pub fn get(&self, name: &str) -> Option<&CmdValue> {
        self.values.get(&name.to_lowercase())
    }

    fn missing(name: &str) -> ProtocolError {
        ProtocolError::CmdUnpack(format!("missing or mistyped field {name}"))
    }

    pub fn str(&self, name: &str) -> Result<String> {
        match self.get(name) {
            Some(CmdValue::Str(s)) => Ok(s.clone()),
            _ => Err(Self::missing(name)),
        }
    }

    pub fn bool(&self, name: &str) -> Result<bool> {
        match self.get(name) {
            Some(CmdValue::Bool(b)) => Ok(*b),
            _ => Err(Self::missing(name)),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64> {
        match self.get(name) {
            Some(CmdValue::Int(v)) => Ok(*v),
            _ => Err(Self::missing(name)),
        }
    }

    pub fn uint(&self, name: &str) -> Result<u64> {
        match self.get(name) {
            Some(CmdValue::Uint(v)) => Ok(*v),
            _ => Err(Self::missing(name)),
        }
    }

    pub fn float(&self, name: &str) -> Result<f64> {
        match self.get(name) {
            Some(CmdValue::Float(v)) => Ok(*v),
            _ => Err(Self::missing(name)),
        }
    }
}

/// A request type reachable through the cmd grammar
pub trait CmdMsg: Send + Sync + Sized + 'static {
    /// Ordered fields of the command line
    fn shape() -> Vec<CmdField>;

    /// Build the request from matched values
    fn from_args(args: &CmdArgs) -> Result<Self>;
}

type BuildFn = Arc<dyn Fn(&CmdArgs) -> Result<Box<dyn Any + Send + Sync>> + Send + Sync>;

#[derive(Clone)]
struct Leaf {
    build: BuildFn,
    c2s_encode: EncodeFn,
    s2c_new: Option<Factory>,
}

#[derive(Clone)]
struct Node {
    field: Option<CmdField>,
    next: HashMap<String, usize>,
    leaf: Option<Leaf>,
}

/// Arena backed trie of command shapes
#[derive(Clone)]
pub(crate) struct CmdTrie {
    nodes: Vec<Node>,
}

impl CmdTrie {
    pub(crate) fn new() -> Self {
        Self {
            nodes: vec![Node {
                field: None,
                next: HashMap::new(),
                leaf: None,
            }],
        }
    }

    pub(crate) fn register<C, S>(&mut self, encoders: &mut HashMap<TypeId, EncodeFn>)
    where
        C: CmdMsg + Serialize,
        S: SerdeBody,
    {
        let mut at = 0;
        for field in C::shape() {
            let name = field.name();
            at = match self.nodes[at].next.get(&name) {
                Some(&child) => child,
                None => {
                    self.nodes.push(Node {
                        field: Some(field),
                        next: HashMap::new(),
                        leaf: None,
                    });
                    let child = self.nodes.len() - 1;
                    self.nodes[at].next.insert(name, child);
                    child
                }
            };
        }

        let c2s_encode = pretty_encoder::<C>();
        encoders.insert(TypeId::of::<C>(), c2s_encode.clone());
        let s2c_new = super::serde_codec::factory::<S>();
        if s2c_new.is_some() {
            encoders.insert(TypeId::of::<S>(), pretty_encoder::<S>());
        }

        self.nodes[at].leaf = Some(Leaf {
            build: Arc::new(|args: &CmdArgs| {
                C::from_args(args).map(|c| Box::new(c) as Box<dyn Any + Send + Sync>)
            }),
            c2s_encode,
            s2c_new,
        });
    }

    fn parse(&self, line: &str) -> Result<Parsed> {
        let mismatch = || ProtocolError::CmdUnpack(format!("no command matches {line:?}"));
        let mut at = 0;
        let mut args = CmdArgs::default();
        let mut tokens = line.split_whitespace();

        while let Some(token) = tokens.next() {
            at = *self.nodes[at].next.get(token).ok_or_else(mismatch)?;
            match self.nodes[at].field {
                Some(CmdField::Value(name, kind)) => {
                    let value = tokens.next().ok_or_else(mismatch)?;
                    args.values
                        .insert(name.to_lowercase(), CmdValue::parse(kind, value)?);
                }
                Some(CmdField::Key(name)) => {
                    args.values
                        .insert(name.to_lowercase(), CmdValue::Str(name.to_lowercase()));
                }
                None => return Err(mismatch()),
            }
        }

        let leaf = self.nodes[at].leaf.as_ref().ok_or_else(mismatch)?;
        let c2s = (leaf.build)(&args)?;
        Ok(Parsed::new(
            c2s,
            Some(leaf.c2s_encode.clone()),
            leaf.s2c_new.clone(),
        ))
    }
}

/// Serialize as JSON indented with tabs, the reply format of text consoles
pub fn pack_pretty<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    value
        .serialize(&mut ser)
        .map_err(|e| ProtocolError::JsonPack(e.to_string()))?;
    Ok(out)
}

fn pretty_encoder<T: Serialize + 'static>() -> EncodeFn {
    Arc::new(|value: &dyn Any| match value.downcast_ref::<T>() {
        Some(v) => pack_pretty(v),
        None => Err(ProtocolError::JsonPack("body type mismatch".into())),
    })
}

pub struct CmdCodec {
    policy: ParseErrorPolicy,
    trie: CmdTrie,
    encoders: HashMap<TypeId, EncodeFn>,
}

impl CmdCodec {
    pub(crate) fn new(
        policy: ParseErrorPolicy,
        trie: CmdTrie,
        encoders: HashMap<TypeId, EncodeFn>,
    ) -> Self {
        Self {
            policy,
            trie,
            encoders,
        }
    }
}

impl MsgCodec for CmdCodec {
    fn kind(&self) -> ParserType {
        ParserType::Cmd
    }

    fn error_policy(&self) -> ParseErrorPolicy {
        self.policy
    }

    fn parse_c2s(&self, msg: &Message) -> Result<Parsed> {
        let line = std::str::from_utf8(&msg.data)
            .map_err(|e| ProtocolError::CmdUnpack(e.to_string()))?;
        self.trie.parse(line.trim())
    }

    fn pack(&self, value: &dyn Any) -> Result<Vec<u8>> {
        match self.encoders.get(&(*value).type_id()) {
            Some(encode) => encode(value),
            None => Err(ProtocolError::JsonPack("unregistered type".into())),
        }
    }

    /// Consoles get no remind, the line is just dropped
    fn remind_msg(&self, _err: &ProtocolError, _mode: MsgType) -> Option<Message> {
        None
    }
}

impl fmt::Debug for CmdCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdCodec")
            .field("policy", &self.policy)
            .field("nodes", &self.trie.nodes.len())
            .finish()
    }
}
