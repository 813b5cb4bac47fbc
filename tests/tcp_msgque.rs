//! TCP connections end to end: ordering, callbacks, rejection, parse error reminders

#![allow(clippy::expect_used, clippy::unwrap_used)]

use futures::{SinkExt, StreamExt};
use netque::core::codec::MessageCodec;
use netque::error::codes;
use netque::parser::MsgCodec;
use netque::{
    start_connect, start_server, DefaultHandler, EchoHandler, Message, MsgHandler, MsgQue,
    MsgType, ParseErrorPolicy, Parser, ParserType, Runtime, RuntimeConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

async fn server(
    handler: Arc<dyn MsgHandler>,
    parser: Option<Arc<dyn MsgCodec>>,
) -> (Arc<Runtime>, String) {
    let rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let listeners = start_server(&rt, "tcp://127.0.0.1:0", MsgType::Msg, handler, parser)
        .await
        .unwrap();
    let addr = listeners[0].local_addr();
    (rt, addr)
}

async fn client(addr: &str) -> Framed<TcpStream, MessageCodec> {
    let stream = TcpStream::connect(addr).await.unwrap();
    Framed::new(stream, MessageCodec::new(MsgType::Msg))
}

async fn wait_available(mq: &Arc<MsgQue>) {
    for _ in 0..200 {
        if mq.available() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("connection never became available");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_messages_echo_in_send_order() {
    let (rt, addr) = server(Arc::new(EchoHandler), None).await;
    let mut conn = client(&addr).await;

    for i in 0..200u16 {
        conn.send(Message::new(1, 2, i, 0, format!("msg-{i}"))).await.unwrap();
    }
    for i in 0..200u16 {
        let msg = tokio::time::timeout(Duration::from_secs(5), conn.next())
            .await
            .expect("echo timed out")
            .unwrap()
            .unwrap();
        assert_eq!(msg.head.unwrap().index, i);
        assert_eq!(msg.data, format!("msg-{i}").as_bytes());
    }
    rt.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_gets_reply_with_same_tag() {
    let handler = DefaultHandler::new();
    handler.register(3, 4, |mq, msg| {
        mq.send(Message::new(0, 0, 0, 0, "pong").copy_tag(msg))
    });
    let (rt, addr) = server(Arc::new(handler), None).await;

    let conn = start_connect(
        &rt,
        "tcp",
        &addr,
        MsgType::Msg,
        Arc::new(DefaultHandler::new()),
        None,
        None,
    )
    .unwrap();
    wait_available(&conn).await;

    let request = conn.request(Message::new(3, 4, 77, 0, "ping"));
    let reply = tokio::time::timeout(Duration::from_secs(5), request)
        .await
        .expect("request timed out")
        .expect("reply expected");
    let head = reply.head.unwrap();
    assert_eq!((head.cmd, head.act, head.index), (3, 4, 77));
    assert_eq!(&reply.data[..], b"pong");
    rt.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pending_request_resolves_none_on_stop() {
    // Server never answers
    let (rt, addr) = server(Arc::new(DefaultHandler::new()), None).await;
    let conn = start_connect(
        &rt,
        "tcp",
        &addr,
        MsgType::Msg,
        Arc::new(DefaultHandler::new()),
        None,
        None,
    )
    .unwrap();
    wait_available(&conn).await;

    let pending = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move { conn.request(Message::new_tag(9, 9, 1)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.stop();

    let reply = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("request did not resolve")
        .unwrap();
    assert!(reply.is_none());
    rt.stop().await;
}

struct Reject;

impl MsgHandler for Reject {
    fn on_new_msgque(&self, _mq: &Arc<MsgQue>) -> bool {
        false
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejected_connection_is_closed() {
    let (rt, addr) = server(Arc::new(Reject), None).await;
    let mut conn = client(&addr).await;
    let _ = conn.send(Message::new_tag(1, 1, 1)).await;

    let next = tokio::time::timeout(Duration::from_secs(5), conn.next())
        .await
        .expect("server kept the connection open");
    assert!(!matches!(next, Some(Ok(_))));
    rt.stop().await;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Login {
    name: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Welcome {
    greeting: String,
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_json_gets_reminder_and_connection_survives() {
    let mut parser = Parser::new(ParserType::Json, ParseErrorPolicy::SendRemind);
    parser.register::<Login, Welcome>(1, 1);
    let codec = parser.build().unwrap();

    let handler = DefaultHandler::new();
    let reply_codec = Arc::clone(&codec);
    handler.register(1, 1, move |mq, msg| {
        let login = msg.c2s::<Login>().unwrap();
        let welcome = Welcome {
            greeting: format!("hi {}", login.name),
        };
        let data = reply_codec.pack(&welcome).unwrap();
        mq.send(Message::new(0, 0, 0, 0, data).copy_tag(msg))
    });
    let (rt, addr) = server(Arc::new(handler), Some(codec)).await;
    let mut conn = client(&addr).await;

    conn.send(Message::new(1, 1, 5, 0, "{not json")).await.unwrap();
    let remind = tokio::time::timeout(Duration::from_secs(5), conn.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let head = remind.head.unwrap();
    assert_eq!(head.error, codes::JSON_UNPACK);
    assert_eq!((head.cmd, head.act, head.index), (1, 1, 5));

    conn.send(Message::new(1, 1, 6, 0, r#"{"name":"ann"}"#)).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), conn.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply.head.unwrap().index, 6);
    let welcome: Welcome = serde_json::from_slice(&reply.data).unwrap();
    assert_eq!(welcome.greeting, "hi ann");
    rt.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_idle_connection_times_out() {
    let rt = Runtime::new(RuntimeConfig::default_with_overrides(|c| {
        c.default_timeout_secs = 1;
    }))
    .unwrap();
    let listeners = start_server(
        &rt,
        "tcp://127.0.0.1:0",
        MsgType::Msg,
        Arc::new(EchoHandler),
        None,
    )
    .await
    .unwrap();
    let mut conn = client(&listeners[0].local_addr()).await;

    let next = tokio::time::timeout(Duration::from_secs(5), conn.next())
        .await
        .expect("idle connection was not closed");
    assert!(next.is_none() || matches!(next, Some(Err(_))));
    rt.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_closes_every_connection() {
    let (rt, addr) = server(Arc::new(EchoHandler), None).await;
    let mut conn = client(&addr).await;
    conn.send(Message::new_tag(1, 1, 1)).await.unwrap();
    let _ = conn.next().await;
    assert!(rt.msgque_count() >= 2);

    rt.stop().await;
    assert!(!rt.is_running());
    assert_eq!(rt.msgque_count(), 0);
}

/// Reports the dial outcome of an outbound connection
struct DialWatch(tokio::sync::mpsc::UnboundedSender<bool>);

impl MsgHandler for DialWatch {
    fn on_connect_complete(&self, _mq: &Arc<MsgQue>, ok: bool) -> bool {
        let _ = self.0.send(ok);
        true
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dial_succeeds_then_rejected_connection_goes_down() {
    let (rt, addr) = server(Arc::new(Reject), None).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let conn = start_connect(&rt, "tcp", &addr, MsgType::Msg, Arc::new(DialWatch(tx)), None, None)
        .unwrap();

    let ok = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(ok, "the dial itself succeeds");

    for _ in 0..200 {
        if !conn.available() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!conn.available());
    rt.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_oversized_head_closes_only_that_connection() {
    let (rt, addr) = server(Arc::new(EchoHandler), None).await;

    let mut bad = TcpStream::connect(&addr).await.unwrap();
    let head = netque::MessageHead {
        len: 2 * 1024 * 1024,
        ..netque::MessageHead::default()
    };
    tokio::io::AsyncWriteExt::write_all(&mut bad, &head.to_bytes())
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::io::AsyncReadExt::read(&mut bad, &mut buf),
    )
    .await
    .expect("oversized head did not close the connection")
    .unwrap_or(0);
    assert_eq!(n, 0);

    let mut good = client(&addr).await;
    good.send(Message::new(1, 1, 1, 0, "still fine")).await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(5), good.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(&echoed.data[..], b"still fine");
    rt.stop().await;
}

/// Redials a second after losing the connection and reports every dial outcome
struct Redial(tokio::sync::mpsc::UnboundedSender<bool>);

impl MsgHandler for Redial {
    fn on_connect_complete(&self, _mq: &Arc<MsgQue>, ok: bool) -> bool {
        let _ = self.0.send(ok);
        true
    }

    fn on_del_msgque(&self, mq: &Arc<MsgQue>) {
        mq.reconnect(1);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconnect_after_server_restart() {
    let (server_rt, addr) = server(Arc::new(EchoHandler), None).await;
    let rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let conn = start_connect(&rt, "tcp", &addr, MsgType::Msg, Arc::new(Redial(tx)), None, None)
        .unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(first);
    wait_available(&conn).await;

    server_rt.stop().await;
    for _ in 0..200 {
        if !conn.available() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!conn.available());

    let restarted = Runtime::new(RuntimeConfig::default()).unwrap();
    start_server(
        &restarted,
        &format!("tcp://{addr}"),
        MsgType::Msg,
        Arc::new(EchoHandler),
        None,
    )
    .await
    .unwrap();

    // Failed attempts retry until the new listener answers
    let redialed = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(ok) = rx.recv().await {
            if ok {
                return true;
            }
        }
        false
    })
    .await
    .expect("never redialed");
    assert!(redialed);
    wait_available(&conn).await;

    let request = conn.request(Message::new(2, 2, 9, 0, "back"));
    let reply = tokio::time::timeout(Duration::from_secs(5), request)
        .await
        .expect("no echo after reconnect")
        .expect("reply expected");
    assert_eq!(&reply.data[..], b"back");

    rt.stop().await;
    restarted.stop().await;
}

/// Answers every message with a large payload and reports when the connection goes
struct Flood(tokio::sync::mpsc::UnboundedSender<()>);

impl MsgHandler for Flood {
    fn on_process_msg(&self, mq: &Arc<MsgQue>, msg: &Message) -> bool {
        mq.send(Message::new(0, 0, 0, 0, vec![7u8; 256 * 1024]).copy_tag(msg));
        true
    }

    fn on_del_msgque(&self, _mq: &Arc<MsgQue>) {
        let _ = self.0.send(());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_that_never_reads_is_closed_by_write_deadline() {
    let rt = Runtime::new(RuntimeConfig::default_with_overrides(|c| {
        c.default_timeout_secs = 1;
    }))
    .unwrap();
    let (tx, mut closed) = tokio::sync::mpsc::unbounded_channel();
    let listeners = start_server(
        &rt,
        "tcp://127.0.0.1:0",
        MsgType::Msg,
        Arc::new(Flood(tx)),
        None,
    )
    .await
    .unwrap();

    // Keep the read side alive but never poll it
    let stream = TcpStream::connect(listeners[0].local_addr()).await.unwrap();
    let (_unread, write) = stream.into_split();
    let mut pings = tokio_util::codec::FramedWrite::new(write, MessageCodec::new(MsgType::Msg));

    let mut gone = false;
    for i in 0..150u16 {
        let _ = pings.send(Message::new(1, 1, i, 0, "ping")).await;
        if closed.try_recv().is_ok() {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(gone, "server kept a connection whose peer stopped reading");
    rt.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_headless_reply_on_framed_connection_closes_it() {
    let handler = DefaultHandler::new();
    handler.register(1, 1, |mq, _msg| mq.send_string("not framed"));
    let (rt, addr) = server(Arc::new(handler), None).await;
    let mut conn = client(&addr).await;

    conn.send(Message::new_tag(1, 1, 1)).await.unwrap();
    let next = tokio::time::timeout(Duration::from_secs(5), conn.next())
        .await
        .expect("connection stayed open");
    assert!(!matches!(next, Some(Ok(_))));
    rt.stop().await;
}
