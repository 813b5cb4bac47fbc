//! # Transports
//!
//! Listen and connect entry points. A listen address names its scheme:
//!
//! | address | result |
//! |---|---|
//! | `tcp://host:port` | TCP listener |
//! | `udp://host:port` | UDP listener with per-peer virtual connections |
//! | `all://host:port` | both of the above on the same port |
//! | `ws://host:port/path` | WebSocket listener, line mode |
//! | `wss://host:port/path` | WebSocket over TLS, needs `tls_cert_path`/`tls_key_path` |
//!
//! Outbound connections support `tcp` and `ws`.

pub mod tcp;
pub mod tls;
pub mod udp;
pub mod ws;

use crate::core::message::Message;
use crate::error::{ProtocolError, Result};
use crate::msgque::handler::MsgHandler;
use crate::msgque::{ConnType, MsgQue, MsgType, NetType};
use crate::parser::MsgCodec;
use crate::runtime::Runtime;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Udp,
    All,
    Ws,
    Wss,
}

/// Parsed listen address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    pub scheme: Scheme,
    /// `host:port`
    pub addr: String,
    /// Upgrade path for WebSocket listeners, `/` by default
    pub path: String,
}

impl ListenAddr {
    pub fn parse(s: &str) -> Result<Self> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| ProtocolError::InvalidAddress(s.to_string()))?;
        let scheme = match scheme {
            "tcp" => Scheme::Tcp,
            "udp" => Scheme::Udp,
            "all" => Scheme::All,
            "ws" => Scheme::Ws,
            "wss" => Scheme::Wss,
            _ => return Err(ProtocolError::InvalidAddress(s.to_string())),
        };

        let (addr, path) = match scheme {
            Scheme::Ws | Scheme::Wss => match rest.split_once('/') {
                Some((addr, path)) => (addr, format!("/{path}")),
                None => (rest, "/".to_string()),
            },
            _ => (rest, String::new()),
        };
        if addr.is_empty() {
            return Err(ProtocolError::InvalidAddress(s.to_string()));
        }
        Ok(Self {
            scheme,
            addr: addr.to_string(),
            path,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialScheme {
    Tcp,
    Ws,
}

/// Where an outbound connection dials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTarget {
    pub scheme: DialScheme,
    pub addr: String,
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            DialScheme::Tcp => write!(f, "tcp://{}", self.addr),
            DialScheme::Ws => write!(f, "ws://{}", self.addr),
        }
    }
}

/// An established outbound stream
pub(crate) enum Link {
    Tcp(TcpStream),
    Ws(Box<WebSocketStream<MaybeTlsStream<TcpStream>>>),
}

impl Link {
    /// Local and peer address
    pub(crate) fn addrs(&self) -> (String, String) {
        let stream = match self {
            Link::Tcp(stream) => Some(stream),
            Link::Ws(ws) => match ws.get_ref() {
                MaybeTlsStream::Plain(stream) => Some(stream),
                _ => None,
            },
        };
        match stream {
            Some(s) => (
                s.local_addr().map(|a| a.to_string()).unwrap_or_default(),
                s.peer_addr().map(|a| a.to_string()).unwrap_or_default(),
            ),
            None => (String::new(), String::new()),
        }
    }
}

pub(crate) async fn dial(target: &DialTarget, connect_timeout: Duration) -> Result<Link> {
    match target.scheme {
        DialScheme::Tcp => {
            let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&target.addr))
                .await
                .map_err(|_| ProtocolError::Timeout)??;
            Ok(Link::Tcp(stream))
        }
        DialScheme::Ws => {
            let url = target.to_string();
            let (ws, _response) =
                tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url))
                    .await
                    .map_err(|_| ProtocolError::Timeout)?
                    .map_err(|e| ProtocolError::WebSocket(e.to_string()))?;
            Ok(Link::Ws(Box::new(ws)))
        }
    }
}

pub(crate) fn start_link(mq: &Arc<MsgQue>, link: Link, rx: mpsc::Receiver<Message>) {
    match link {
        Link::Tcp(stream) => tcp::spawn_stream(mq, stream, rx),
        Link::Ws(ws) => ws::spawn_ws(mq, *ws, rx),
    }
}

/// Start listening on `addr`.
///
/// Returns the listener connections; their `local_addr` is the bound address.
/// WebSocket listeners always use [`MsgType::Cmd`].
#[instrument(skip(rt, handler, parser))]
pub async fn start_server(
    rt: &Arc<Runtime>,
    addr: &str,
    msg_type: MsgType,
    handler: Arc<dyn MsgHandler>,
    parser: Option<Arc<dyn MsgCodec>>,
) -> Result<Vec<Arc<MsgQue>>> {
    let listen = ListenAddr::parse(addr)?;
    let mut listeners = Vec::new();

    if matches!(listen.scheme, Scheme::Tcp | Scheme::All) {
        let mq = tcp::listen(rt, &listen.addr, msg_type, handler.clone(), parser.clone())
            .await
            .inspect_err(|e| error!(addr, error = %e, "listen failed"))?;
        listeners.push(mq);
    }

    if matches!(listen.scheme, Scheme::Udp | Scheme::All) {
        // Bind UDP to the port TCP actually got, so `all://host:0` shares one port
        let udp_addr = match listeners.first() {
            Some(tcp) => tcp.local_addr(),
            None => listen.addr.clone(),
        };
        let mq = udp::listen(rt, &udp_addr, msg_type, handler.clone(), parser.clone())
            .await
            .inspect_err(|e| error!(addr, error = %e, "listen failed"))?;
        listeners.push(mq);
    }

    if matches!(listen.scheme, Scheme::Ws | Scheme::Wss) {
        if msg_type != MsgType::Cmd {
            warn!(addr, "ws msgque only supports MsgType::Cmd, switching");
        }
        let acceptor = match listen.scheme {
            Scheme::Wss => {
                let tls = tls::TlsServerConfig::from_runtime_config(rt.config()).ok_or_else(|| {
                    ProtocolError::ConfigError(
                        "wss listener needs tls_cert_path and tls_key_path".into(),
                    )
                })?;
                Some(tls.acceptor()?)
            }
            _ => None,
        };
        let mq = ws::listen(rt, &listen.addr, &listen.path, acceptor, handler, parser)
            .await
            .inspect_err(|e| error!(addr, error = %e, "listen failed"))?;
        listeners.push(mq);
    }

    Ok(listeners)
}

/// Create an outbound connection and start dialing in the background.
///
/// `net` is `"tcp"` or `"ws"`. Returns `None` for an unsupported network or
/// when `on_new_msgque` rejects the connection. Dial failures are reported
/// through `on_connect_complete`; call [`MsgQue::reconnect`] to retry.
pub fn start_connect(
    rt: &Arc<Runtime>,
    net: &str,
    addr: &str,
    msg_type: MsgType,
    handler: Arc<dyn MsgHandler>,
    parser: Option<Arc<dyn MsgCodec>>,
    user: Option<Arc<dyn Any + Send + Sync>>,
) -> Option<Arc<MsgQue>> {
    let (scheme, net_type, msg_type) = match net {
        "tcp" => (DialScheme::Tcp, NetType::Tcp, msg_type),
        "ws" => (DialScheme::Ws, NetType::Ws, MsgType::Cmd),
        other => {
            error!(net = other, addr, "unsupported network for connect");
            return None;
        }
    };
    let addr = addr
        .strip_prefix("ws://")
        .or_else(|| addr.strip_prefix("tcp://"))
        .unwrap_or(addr);
    let target = DialTarget {
        scheme,
        addr: addr.to_string(),
    };

    let mq = MsgQue::new(
        rt,
        msg_type,
        net_type,
        ConnType::Conn,
        handler,
        parser,
        Some(target.clone()),
    );
    if let Some(user) = user {
        mq.set_user(user);
    }
    info!(msgque = mq.id(), addr = %target, "new msgque connect to addr");

    if mq.handler().on_new_msgque(&mq) {
        mq.reconnect(0);
        Some(mq)
    } else {
        mq.stop();
        None
    }
}
