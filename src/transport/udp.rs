//! # UDP
//!
//! One shared socket serves every peer. Reader tasks call `recv_from`
//! concurrently and route each datagram to the virtual connection of its
//! source address, creating it on first sight. Each virtual connection has its
//! own bounded inbound queue plus its own reader and writer task, and closes
//! after its idle timeout.
//!
//! A datagram carries exactly one message. Datagrams arriving while a virtual
//! connection's inbound queue is full are dropped.

use crate::config::MSG_HEAD_SIZE;
use crate::core::codec::MessageCodec;
use crate::core::message::{Message, MessageHead};
use crate::error::{ProtocolError, Result};
use crate::msgque::handler::MsgHandler;
use crate::msgque::{ConnType, MsgQue, MsgType, NetType};
use crate::parser::MsgCodec;
use crate::runtime::{lock, Runtime};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::codec::Encoder;
use tracing::{debug, error, info, warn};

/// Largest datagram a reader accepts
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

type PeerMap = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Bytes>>>>;

pub(crate) async fn listen(
    rt: &Arc<Runtime>,
    addr: &str,
    msg_type: MsgType,
    handler: Arc<dyn MsgHandler>,
    parser: Option<Arc<dyn MsgCodec>>,
) -> Result<Arc<MsgQue>> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    let local = socket.local_addr()?;
    let mq = MsgQue::new(
        rt,
        msg_type,
        NetType::Udp,
        ConnType::Listen,
        handler,
        parser,
        None,
    );
    mq.set_addrs(local.to_string(), String::new());
    info!(msgque = mq.id(), addr = %local, "new udp listen");

    let peers: PeerMap = Arc::new(Mutex::new(HashMap::new()));
    for _ in 0..rt.config().udp_reader_count {
        let handle = rt.spawn_tracked(reader(
            Arc::clone(&mq),
            Arc::clone(&socket),
            Arc::clone(&peers),
        ));
        mq.track(handle);
    }
    Ok(mq)
}

async fn reader(listener: Arc<MsgQue>, socket: Arc<UdpSocket>, peers: PeerMap) {
    let token = listener.token();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (n, peer) = tokio::select! {
            _ = token.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    error!(msgque = listener.id(), error = %e, "udp recv failed");
                    break;
                }
            },
        };
        if n == 0 {
            continue;
        }
        route(&listener, &socket, &peers, peer, Bytes::copy_from_slice(&buf[..n]));
    }
    listener.stop();
}

/// Hand `data` to the virtual connection for `peer`, creating it if needed
fn route(
    listener: &Arc<MsgQue>,
    socket: &Arc<UdpSocket>,
    peers: &PeerMap,
    peer: SocketAddr,
    data: Bytes,
) {
    let (inbound, mq_id) = {
        let mut map = lock(peers);
        match map.get(&peer) {
            Some(tx) => (tx.clone(), None),
            None => {
                let (tx, mq) = new_virtual(listener, socket, peers, peer);
                map.insert(peer, tx.clone());
                (tx, Some(mq.id()))
            }
        }
    };
    if let Some(id) = mq_id {
        info!(msgque = id, addr = %peer, "new msgque from addr");
    }

    if let Err(mpsc::error::TrySendError::Full(_)) = inbound.try_send(data) {
        warn!(addr = %peer, "drop msg because msgque full");
    }
}

fn new_virtual(
    listener: &Arc<MsgQue>,
    socket: &Arc<UdpSocket>,
    peers: &PeerMap,
    peer: SocketAddr,
) -> (mpsc::Sender<Bytes>, Arc<MsgQue>) {
    let rt = listener.runtime();
    let mq = MsgQue::new(
        rt,
        listener.msg_type(),
        NetType::Udp,
        ConnType::Accept,
        Arc::clone(listener.handler()),
        listener.parser().cloned(),
        None,
    );
    mq.set_addrs(listener.local_addr(), peer.to_string());

    let (tx, rx) = mpsc::channel(rt.config().read_queue_capacity);
    let peers = Arc::clone(peers);
    let own = tx.clone();
    mq.on_stop(move || {
        let mut map = lock(&peers);
        if map.get(&peer).is_some_and(|current| current.same_channel(&own)) {
            map.remove(&peer);
        }
    });

    let write_rx = mq.open_write_queue();
    mq.track(rt.spawn_tracked(read_loop(Arc::clone(&mq), rx)));
    mq.track(rt.spawn_tracked(write_loop(
        Arc::clone(&mq),
        Arc::clone(socket),
        peer,
        write_rx,
    )));
    (tx, mq)
}

/// Decode one datagram into a message
pub fn decode_datagram(mode: MsgType, data: Bytes, max_len: u32) -> Result<Message> {
    if mode == MsgType::Cmd {
        return Ok(Message {
            data,
            ..Message::default()
        });
    }
    let head = MessageHead::from_bytes_with_limit(&data, max_len)?;
    let end = MSG_HEAD_SIZE + head.len as usize;
    if data.len() < end {
        return Err(ProtocolError::MsgLenTooShort(data.len()));
    }
    Ok(Message {
        head: Some(head),
        data: data.slice(MSG_HEAD_SIZE..end),
        ..Message::default()
    })
}

async fn read_loop(mq: Arc<MsgQue>, mut inbound: mpsc::Receiver<Bytes>) {
    let token = mq.token();
    let max_len = mq.runtime().config().max_msg_data_size;
    loop {
        let data = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            data = inbound.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };

        let len = data.len() as u64;
        let msg = match decode_datagram(mq.msg_type(), data, max_len) {
            Ok(msg) => msg,
            Err(e) => {
                error!(msgque = mq.id(), error = %e, "read msg head err");
                break;
            }
        };
        mq.touch();
        mq.runtime().metrics().message_received(len);

        if !mq.is_init() {
            if !mq.handler().on_new_msgque(&mq) {
                break;
            }
            mq.accept_ready();
            arm_idle_timer(&mq);
        }

        if !mq.process_msg(msg) {
            break;
        }
    }
    debug!(msgque = mq.id(), "process read end for msgque");
    mq.stop();
}

fn arm_idle_timer(mq: &Arc<MsgQue>) {
    let delay = match mq.timeout() {
        0 => mq.runtime().config().default_timeout_secs.max(1),
        secs => secs,
    };
    let weak = Arc::downgrade(mq);
    let timer = mq.runtime().set_timeout(delay.saturating_mul(1000), move || {
        weak.upgrade().map_or(0, |mq| mq.idle_check())
    });
    if let Some(id) = timer {
        let rt = Arc::clone(mq.runtime());
        mq.on_stop(move || {
            rt.cancel_timeout(id);
        });
    }
}

async fn write_loop(
    mq: Arc<MsgQue>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut rx: mpsc::Receiver<Message>,
) {
    let token = mq.token();
    let max_len = mq.runtime().config().max_msg_data_size;
    let mut codec = MessageCodec::with_max_len(mq.msg_type(), max_len);
    let mut buf = BytesMut::new();
    loop {
        let msg = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        buf.clear();
        if let Err(e) = codec.encode(msg, &mut buf) {
            error!(msgque = mq.id(), error = %e, "udp encode failed");
            break;
        }
        match socket.send_to(&buf, peer).await {
            Ok(n) => mq.runtime().metrics().message_sent(n as u64),
            Err(e) => warn!(msgque = mq.id(), addr = %peer, error = %e, "udp send failed"),
        }
    }
    mq.stop();
}
