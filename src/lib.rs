//! # netque
//!
//! Multi-transport message queue runtime for game and application servers.
//!
//! Every connection, whether listener, accepted peer, outbound link or UDP
//! virtual connection, is a [`MsgQue`]. Inbound traffic is framed by the
//! transport, decoded by an optional [`Parser`], correlated with pending
//! callbacks, and handed to a [`MsgHandler`]. Outbound traffic goes through a
//! bounded per-connection write queue.
//!
//! ## Modules
//! - [`core`]: 12-byte message head, framing codec, payload formats
//! - [`parser`]: pb/json/msgpack/cmd/raw body decoding with error policies
//! - [`msgque`]: connections, callbacks, groups, handlers
//! - [`transport`]: TCP, UDP, WebSocket and TLS
//! - [`runtime`]: task tracking, worker pool, stop sequence, timers
//! - [`timer`]: timing wheel
//! - [`utils`]: compression, logging, metrics
//!
//! ## Example
//! ```no_run
//! use netque::{start_server, EchoHandler, MsgType, Runtime, RuntimeConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> netque::Result<()> {
//! let rt = Runtime::new(RuntimeConfig::default())?;
//! start_server(&rt, "tcp://127.0.0.1:6666", MsgType::Msg, Arc::new(EchoHandler), None).await?;
//! rt.wait_for_system_exit().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod msgque;
pub mod parser;
pub mod runtime;
pub mod timer;
pub mod transport;
pub mod utils;

pub use config::{LoggingConfig, RuntimeConfig};
pub use crate::core::message::{flags, Message, MessageHead};
pub use error::{ProtocolError, Result};
pub use msgque::handler::{DefaultHandler, EchoHandler, MsgHandler};
pub use msgque::{ConnState, ConnType, MsgQue, MsgType, NetType};
pub use parser::{ParseErrorPolicy, Parser, ParserType};
pub use runtime::Runtime;
pub use transport::{start_connect, start_server};
