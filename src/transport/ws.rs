//! WebSocket listener and connection tasks.
//!
//! WebSocket connections are always line mode: each text or binary frame is
//! one headless message, and outbound messages go out as binary frames.
//! Upgrades on any path other than the configured one are answered with 404.

use crate::core::message::Message;
use crate::error::{ProtocolError, Result};
use crate::msgque::handler::MsgHandler;
use crate::msgque::{ConnType, MsgQue, MsgType, NetType};
use crate::parser::MsgCodec;
use crate::runtime::Runtime;
use crate::transport::tcp::{read_loop, write_loop};
use bytes::Bytes;
use futures::future::ready;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

pub(crate) async fn listen(
    rt: &Arc<Runtime>,
    addr: &str,
    path: &str,
    tls: Option<TlsAcceptor>,
    handler: Arc<dyn MsgHandler>,
    parser: Option<Arc<dyn MsgCodec>>,
) -> Result<Arc<MsgQue>> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let mq = MsgQue::new(
        rt,
        MsgType::Cmd,
        NetType::Ws,
        ConnType::Listen,
        handler,
        parser,
        None,
    );
    mq.set_addrs(local.to_string(), String::new());
    info!(msgque = mq.id(), addr = %local, path, tls = tls.is_some(), "new ws listen");

    let token = mq.token();
    let lmq = Arc::clone(&mq);
    let path = path.to_string();
    let handle = rt.spawn_tracked(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => accept(&lmq, stream, peer, path.clone(), tls.clone()),
                    Err(e) => {
                        error!(msgque = lmq.id(), error = %e, "accept failed");
                        break;
                    }
                }
            }
        }
        debug!(msgque = lmq.id(), "process listen end for ws msgque");
        lmq.stop();
    });
    mq.track(handle);
    Ok(mq)
}

fn accept(
    listener: &Arc<MsgQue>,
    stream: TcpStream,
    peer: SocketAddr,
    path: String,
    tls: Option<TlsAcceptor>,
) {
    let lst = Arc::clone(listener);
    let local = stream.local_addr().map(|a| a.to_string()).unwrap_or_default();
    let limit = listener.runtime().config().connect_timeout;
    listener.runtime().go(async move {
        match tls {
            Some(acceptor) => match tokio::time::timeout(limit, acceptor.accept(stream)).await {
                Ok(Ok(stream)) => upgrade(&lst, stream, peer, local, &path).await,
                Ok(Err(e)) => warn!(addr = %peer, error = %e, "tls handshake failed"),
                Err(_) => warn!(addr = %peer, "tls handshake timed out"),
            },
            None => upgrade(&lst, stream, peer, local, &path).await,
        }
    });
}

fn not_found() -> ErrorResponse {
    let mut resp = ErrorResponse::new(None);
    *resp.status_mut() = StatusCode::NOT_FOUND;
    resp
}

async fn upgrade<S>(
    listener: &Arc<MsgQue>,
    stream: S,
    peer: SocketAddr,
    local: String,
    path: &str,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let expected = path.to_string();
    let check_path = move |req: &Request, resp: Response| {
        if req.uri().path() == expected {
            Ok(resp)
        } else {
            Err(not_found())
        }
    };
    let limit = listener.runtime().config().connect_timeout;
    let upgraded =
        tokio::time::timeout(limit, tokio_tungstenite::accept_hdr_async(stream, check_path)).await;
    let ws = match upgraded {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(addr = %peer, error = %e, "ws upgrade rejected");
            return;
        }
        Err(_) => {
            warn!(addr = %peer, "ws upgrade timed out");
            return;
        }
    };

    let rt = listener.runtime();
    let mq = MsgQue::new(
        rt,
        MsgType::Cmd,
        NetType::Ws,
        ConnType::Accept,
        Arc::clone(listener.handler()),
        listener.parser().cloned(),
        None,
    );
    mq.set_addrs(local, peer.to_string());
    info!(msgque = mq.id(), addr = %peer, "new msgque from addr");

    let rx = mq.open_write_queue();
    if mq.handler().on_new_msgque(&mq) {
        mq.accept_ready();
        spawn_ws(&mq, ws, rx);
    } else {
        mq.stop();
    }
}

fn headless(data: Bytes) -> Message {
    Message {
        data,
        ..Message::default()
    }
}

type WsFrame = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>;

/// Map one inbound frame. `None` skips control frames.
fn frame_to_message(frame: WsFrame) -> Option<Result<Message>> {
    match frame {
        Ok(WsMessage::Text(text)) => Some(Ok(headless(Bytes::from(text)))),
        Ok(WsMessage::Binary(data)) => Some(Ok(headless(Bytes::from(data)))),
        Ok(WsMessage::Close(_)) => Some(Err(ProtocolError::ConnectionClosed)),
        Ok(_) => None,
        Err(e) => Some(Err(ProtocolError::WebSocket(e.to_string()))),
    }
}

/// Start the read and write tasks of a WebSocket connection
pub(crate) fn spawn_ws<S>(mq: &Arc<MsgQue>, ws: WebSocketStream<S>, rx: mpsc::Receiver<Message>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    let reader = Box::pin(stream.filter_map(|frame| ready(frame_to_message(frame))));
    let writer = Box::pin(
        sink.sink_map_err(|e| ProtocolError::WebSocket(e.to_string()))
            .with(|msg: Message| {
                ready(Ok::<_, ProtocolError>(WsMessage::Binary(msg.data.to_vec())))
            }),
    );

    let rt = mq.runtime();
    mq.track(rt.spawn_tracked(read_loop(Arc::clone(mq), reader)));
    mq.track(rt.spawn_tracked(write_loop(Arc::clone(mq), writer, rx)));
}
