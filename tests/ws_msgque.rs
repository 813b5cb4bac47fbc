//! WebSocket listener, TLS listener and dialer

#![allow(clippy::expect_used, clippy::unwrap_used)]

use futures::{SinkExt, StreamExt};
use netque::{
    start_connect, start_server, EchoHandler, Message, MsgHandler, MsgQue, MsgType, Runtime,
    RuntimeConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

async fn ws_server() -> (Arc<Runtime>, String) {
    let rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let listeners = start_server(
        &rt,
        "ws://127.0.0.1:0/chat",
        MsgType::Cmd,
        Arc::new(EchoHandler),
        None,
    )
    .await
    .unwrap();
    let addr = listeners[0].local_addr();
    (rt, addr)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_text_frame_echoes_as_binary() {
    let (rt, addr) = ws_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/chat"))
        .await
        .unwrap();

    ws.send(WsMessage::Text("hello\n".into())).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no echo")
        .unwrap()
        .unwrap();
    assert_eq!(reply, WsMessage::Binary(b"hello\n".to_vec()));
    rt.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wrong_path_is_rejected() {
    let (rt, addr) = ws_server().await;
    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/other")).await;
    assert!(result.is_err());
    rt.stop().await;
}

struct Collect(mpsc::UnboundedSender<Message>);

impl MsgHandler for Collect {
    fn on_process_msg(&self, _mq: &Arc<MsgQue>, msg: &Message) -> bool {
        let _ = self.0.send(msg.clone());
        true
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dialed_ws_connection_exchanges_lines() {
    let (rt, addr) = ws_server().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = start_connect(
        &rt,
        "ws",
        &format!("{addr}/chat"),
        MsgType::Msg,
        Arc::new(Collect(tx)),
        None,
        None,
    )
    .unwrap();
    assert_eq!(conn.msg_type(), MsgType::Cmd);

    for _ in 0..200 {
        if conn.available() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(conn.send_string_ln("ping"));

    let echoed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no echo")
        .unwrap();
    assert_eq!(&echoed.data[..], b"ping\n");
    rt.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wss_listener_echoes_over_tls() {
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    std::fs::write(&cert_path, generated.cert.pem()).unwrap();
    std::fs::write(&key_path, generated.key_pair.serialize_pem()).unwrap();

    let rt = Runtime::new(RuntimeConfig::default_with_overrides(|c| {
        c.tls_cert_path = Some(cert_path.to_string_lossy().into_owned());
        c.tls_key_path = Some(key_path.to_string_lossy().into_owned());
    }))
    .unwrap();
    let listeners = start_server(
        &rt,
        "wss://127.0.0.1:0/secure",
        MsgType::Cmd,
        Arc::new(EchoHandler),
        None,
    )
    .await
    .unwrap();
    let addr = listeners[0].local_addr();

    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(&rustls::Certificate(generated.cert.der().to_vec()))
        .unwrap();
    let client_config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
    let tcp = TcpStream::connect(&addr).await.unwrap();
    let domain = rustls::ServerName::try_from("localhost").unwrap();
    let tls = connector.connect(domain, tcp).await.unwrap();
    let (mut ws, _) = tokio_tungstenite::client_async("wss://localhost/secure", tls)
        .await
        .unwrap();

    ws.send(WsMessage::Text("sealed\n".into())).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no echo over tls")
        .unwrap()
        .unwrap();
    assert_eq!(reply, WsMessage::Binary(b"sealed\n".to_vec()));
    rt.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_silent_client_is_dropped_before_upgrade() {
    let rt = Runtime::new(RuntimeConfig::default_with_overrides(|c| {
        c.connect_timeout = Duration::from_millis(200);
    }))
    .unwrap();
    let listeners = start_server(
        &rt,
        "ws://127.0.0.1:0/chat",
        MsgType::Cmd,
        Arc::new(EchoHandler),
        None,
    )
    .await
    .unwrap();

    let mut silent = TcpStream::connect(listeners[0].local_addr()).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::io::AsyncReadExt::read(&mut silent, &mut buf),
    )
    .await
    .expect("handshake was never abandoned")
    .unwrap_or(0);
    assert_eq!(n, 0);
    rt.stop().await;
}
