//! TCP listener and the stream read/write tasks shared with WebSocket.

use crate::core::codec::MessageCodec;
use crate::core::message::Message;
use crate::error::{ProtocolError, Result};
use crate::msgque::handler::MsgHandler;
use crate::msgque::{ConnType, MsgQue, MsgType, NetType};
use crate::parser::MsgCodec;
use crate::runtime::Runtime;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info};

pub(crate) async fn listen(
    rt: &Arc<Runtime>,
    addr: &str,
    msg_type: MsgType,
    handler: Arc<dyn MsgHandler>,
    parser: Option<Arc<dyn MsgCodec>>,
) -> Result<Arc<MsgQue>> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let mq = MsgQue::new(
        rt,
        msg_type,
        NetType::Tcp,
        ConnType::Listen,
        handler,
        parser,
        None,
    );
    mq.set_addrs(local.to_string(), String::new());
    info!(msgque = mq.id(), addr = %local, "new tcp listen");

    let token = mq.token();
    let lmq = Arc::clone(&mq);
    let handle = rt.spawn_tracked(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => accept(&lmq, stream, peer),
                    Err(e) => {
                        error!(msgque = lmq.id(), error = %e, "accept failed");
                        break;
                    }
                }
            }
        }
        debug!(msgque = lmq.id(), "process listen end for tcp msgque");
        lmq.stop();
    });
    mq.track(handle);
    Ok(mq)
}

fn accept(listener: &Arc<MsgQue>, stream: TcpStream, peer: SocketAddr) {
    let rt = Arc::clone(listener.runtime());
    let lst = Arc::clone(listener);
    rt.clone().go(async move {
        let mq = MsgQue::new(
            &rt,
            lst.msg_type(),
            NetType::Tcp,
            ConnType::Accept,
            Arc::clone(lst.handler()),
            lst.parser().cloned(),
            None,
        );
        let local = stream.local_addr().map(|a| a.to_string()).unwrap_or_default();
        mq.set_addrs(local, peer.to_string());
        info!(msgque = mq.id(), addr = %peer, "new msgque from addr");

        let rx = mq.open_write_queue();
        if mq.handler().on_new_msgque(&mq) {
            mq.accept_ready();
            spawn_stream(&mq, stream, rx);
        } else {
            mq.stop();
        }
    });
}

/// Start the read and write tasks of a byte-stream connection
pub(crate) fn spawn_stream<S>(mq: &Arc<MsgQue>, stream: S, rx: mpsc::Receiver<Message>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let config = mq.runtime().config();
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = FramedRead::with_capacity(
        read_half,
        MessageCodec::with_max_len(mq.msg_type(), config.max_msg_data_size),
        config.read_buffer_size,
    );
    let writer = FramedWrite::new(
        write_half,
        MessageCodec::with_max_len(mq.msg_type(), config.max_msg_data_size),
    );

    let rt = mq.runtime();
    mq.track(rt.spawn_tracked(read_loop(Arc::clone(mq), reader)));
    mq.track(rt.spawn_tracked(write_loop(Arc::clone(mq), writer, rx)));
}

/// Feed inbound messages to `mq` until EOF, an error, the idle deadline, or stop
pub(crate) async fn read_loop<R>(mq: Arc<MsgQue>, mut reader: R)
where
    R: Stream<Item = Result<Message>> + Unpin,
{
    let token = mq.token();
    debug!(msgque = mq.id(), "process read for msgque");
    loop {
        let deadline = mq.io_deadline();
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = async {
                match deadline {
                    Some(limit) => tokio::time::timeout(limit, reader.next()).await.ok(),
                    None => Some(reader.next().await),
                }
            } => next,
        };

        match next {
            Some(Some(Ok(msg))) => {
                mq.touch();
                mq.runtime()
                    .metrics()
                    .message_received(msg.wire_len() as u64);
                let (cmd, act) = msg.head.map_or((0, 0), |h| (h.cmd, h.act));
                if !mq.process_msg(msg) {
                    error!(msgque = mq.id(), cmd, act, "process msg failed");
                    break;
                }
            }
            Some(Some(Err(ProtocolError::ConnectionClosed))) | Some(None) => break,
            Some(Some(Err(e))) => {
                error!(msgque = mq.id(), error = %e, "recv data err");
                break;
            }
            None => {
                info!(msgque = mq.id(), timeout = mq.timeout(), "msgque close because timeout");
                break;
            }
        }
    }
    debug!(msgque = mq.id(), "process read end for msgque");
    mq.stop();
}

/// Drain the write queue in order until it closes, a write fails or stalls
/// past the deadline, or stop
pub(crate) async fn write_loop<W>(
    mq: Arc<MsgQue>,
    mut writer: W,
    mut rx: mpsc::Receiver<Message>,
) where
    W: Sink<Message, Error = ProtocolError> + Unpin,
{
    let token = mq.token();
    debug!(msgque = mq.id(), "process write for msgque");
    loop {
        let msg = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let len = msg.wire_len() as u64;
        let deadline = mq.io_deadline();
        let sent = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            sent = async {
                match deadline {
                    Some(limit) => tokio::time::timeout(limit, writer.send(msg)).await.ok(),
                    None => Some(writer.send(msg).await),
                }
            } => sent,
        };
        match sent {
            Some(Ok(())) => mq.runtime().metrics().message_sent(len),
            Some(Err(e)) => {
                error!(msgque = mq.id(), error = %e, "msgque write failed");
                break;
            }
            None => {
                info!(
                    msgque = mq.id(),
                    timeout = mq.timeout(),
                    "msgque close because write timeout"
                );
                break;
            }
        }
    }
    // Senders parked on a full queue fail once the receiver is gone
    drop(rx);
    let linger = mq
        .io_deadline()
        .unwrap_or(mq.runtime().config().stop_timeout);
    let _ = tokio::time::timeout(linger, writer.close()).await;
    debug!(msgque = mq.id(), "process write end for msgque");
    mq.stop();
}
