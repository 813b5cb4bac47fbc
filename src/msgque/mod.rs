//! # Connections
//!
//! A [`MsgQue`] is one endpoint of traffic: a listener, an accepted peer, an
//! outbound connection, or a UDP virtual connection keyed by source address.
//! Transports feed it inbound messages and drain its bounded write queue; the
//! connection itself owns callback correlation, groups, idle timing and the
//! stop sequence.
//!
//! ## Inbound pipeline
//! 1. Payloads flagged compressed are decompressed (failure closes the connection)
//! 2. The parser decodes the body; failures follow its [`ParseErrorPolicy`]
//! 3. A message whose tag matches a pending callback resolves it and stops there
//! 4. Otherwise the handler's routed function, or `on_process_msg`, runs
//!
//! A `false` from any step closes the connection.

pub mod handler;

use crate::core::message::{flags, Message};
use crate::error::constants::ERR_QUEUE_FULL;
use crate::parser::{MsgCodec, ParseErrorPolicy};
use crate::runtime::{lock, Runtime};
use crate::transport::{self, DialTarget};
use crate::utils::compression;
use handler::MsgHandler;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use handler::{DefaultHandler, EchoHandler, HandlerFn, HandlerMap};

static NEXT_MSGQUE_ID: AtomicU32 = AtomicU32::new(0);

/// Framing of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// 12-byte head plus payload
    Msg,
    /// Newline-delimited text
    Cmd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetType {
    Tcp,
    Udp,
    Ws,
}

/// How a connection came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnType {
    Listen,
    /// Outbound, created by a connect call
    Conn,
    /// Inbound, created by a listener
    Accept,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Created = 0,
    Connecting = 1,
    Available = 2,
    Stopping = 3,
    Stopped = 4,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Created,
            1 => ConnState::Connecting,
            2 => ConnState::Available,
            3 => ConnState::Stopping,
            _ => ConnState::Stopped,
        }
    }
}

/// Reply channel of [`MsgQue::send_callback`]. `None` means the connection stopped first.
pub type CallbackSender = mpsc::Sender<Option<Message>>;

type StopHook = Box<dyn FnOnce() + Send>;

pub struct MsgQue {
    id: u32,
    msg_type: MsgType,
    net_type: NetType,
    conn_type: ConnType,
    rt: Arc<Runtime>,
    handler: Arc<dyn MsgHandler>,
    parser: Option<Arc<dyn MsgCodec>>,

    state: AtomicU8,
    stop: AtomicBool,
    available: AtomicBool,
    init: AtomicBool,
    connecting: AtomicBool,
    multiplex: AtomicBool,
    timeout: AtomicU32,
    last_tick: AtomicU64,

    write_tx: Mutex<Option<mpsc::Sender<Message>>>,
    callbacks: Mutex<HashMap<u32, CallbackSender>>,
    groups: Mutex<HashSet<String>>,
    user: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
    local_addr: RwLock<String>,
    remote_addr: RwLock<String>,
    real_remote_addr: RwLock<String>,

    token: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    on_stop: Mutex<Vec<StopHook>>,
    dial: Option<DialTarget>,
}

impl MsgQue {
    /// Create a connection and add it to the runtime's registry
    pub(crate) fn new(
        rt: &Arc<Runtime>,
        msg_type: MsgType,
        net_type: NetType,
        conn_type: ConnType,
        handler: Arc<dyn MsgHandler>,
        parser: Option<Arc<dyn MsgCodec>>,
        dial: Option<DialTarget>,
    ) -> Arc<Self> {
        let timeout = match conn_type {
            ConnType::Listen => 0,
            _ => rt.config().default_timeout_secs,
        };
        let mq = Arc::new(Self {
            id: NEXT_MSGQUE_ID.fetch_add(1, Ordering::SeqCst) + 1,
            msg_type,
            net_type,
            conn_type,
            rt: Arc::clone(rt),
            handler,
            parser,
            state: AtomicU8::new(ConnState::Created as u8),
            stop: AtomicBool::new(false),
            available: AtomicBool::new(false),
            init: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            multiplex: AtomicBool::new(false),
            timeout: AtomicU32::new(timeout),
            last_tick: AtomicU64::new(rt.now_ms()),
            write_tx: Mutex::new(None),
            callbacks: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashSet::new()),
            user: RwLock::new(None),
            local_addr: RwLock::new(String::new()),
            remote_addr: RwLock::new(String::new()),
            real_remote_addr: RwLock::new(String::new()),
            token: Mutex::new(rt.stop_token().child_token()),
            tasks: Mutex::new(Vec::new()),
            on_stop: Mutex::new(Vec::new()),
            dial,
        });
        rt.add_msgque(&mq);
        mq
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    pub fn net_type(&self) -> NetType {
        self.net_type
    }

    pub fn conn_type(&self) -> ConnType {
        self.conn_type
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.rt
    }

    pub fn handler(&self) -> &Arc<dyn MsgHandler> {
        &self.handler
    }

    pub fn parser(&self) -> Option<&Arc<dyn MsgCodec>> {
        self.parser.as_ref()
    }

    pub fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// True once the connection has stopped, or the runtime is shutting down
    pub fn is_stop(self: &Arc<Self>) -> bool {
        if !self.stop.load(Ordering::SeqCst) && !self.rt.is_running() {
            self.stop();
        }
        self.stop.load(Ordering::SeqCst)
    }

    // Transport hooks

    pub(crate) fn token(&self) -> CancellationToken {
        lock(&self.token).clone()
    }

    /// Create a fresh write queue and return its consumer end
    pub(crate) fn open_write_queue(&self) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.rt.config().write_queue_capacity);
        *lock(&self.write_tx) = Some(tx);
        rx
    }

    /// Mark an accepted connection live after `on_new_msgque` approved it
    pub(crate) fn accept_ready(&self) {
        self.init.store(true, Ordering::SeqCst);
        self.available.store(true, Ordering::SeqCst);
        self.set_state(ConnState::Available);
    }

    /// Whether `on_new_msgque` has approved this connection
    pub(crate) fn is_init(&self) -> bool {
        self.init.load(Ordering::SeqCst)
    }

    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Run `hook` when this connection stops
    pub(crate) fn on_stop<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        lock(&self.on_stop).push(Box::new(hook));
    }

    pub(crate) fn set_addrs(&self, local: String, remote: String) {
        if let Ok(mut addr) = self.local_addr.write() {
            *addr = local;
        }
        if let Ok(mut addr) = self.remote_addr.write() {
            *addr = remote;
        }
    }

    /// Record inbound activity for idle timing
    pub(crate) fn touch(&self) {
        self.last_tick.store(self.rt.now_ms(), Ordering::Relaxed);
    }

    /// Per-operation read and write deadline for stream transports. `None` when the timeout is 0.
    pub(crate) fn io_deadline(&self) -> Option<Duration> {
        match self.timeout.load(Ordering::Relaxed) {
            0 => None,
            secs => Some(Duration::from_secs(secs as u64)),
        }
    }

    /// Timer body for idle checks: the delay until the next check, or 0 after
    /// closing an idle connection
    pub(crate) fn idle_check(self: &Arc<Self>) -> u32 {
        if self.is_stop() {
            return 0;
        }
        let timeout_ms = self.timeout.load(Ordering::Relaxed) as u64 * 1000;
        if timeout_ms == 0 {
            return self.rt.config().default_timeout_secs.max(1) * 1000;
        }
        let idle = self
            .rt
            .now_ms()
            .saturating_sub(self.last_tick.load(Ordering::Relaxed));
        if idle < timeout_ms {
            return (timeout_ms - idle) as u32;
        }
        info!(msgque = self.id, idle_ms = idle, timeout_ms, "msgque close because timeout");
        self.stop();
        0
    }

    // Sending

    /// Queue `msg` for writing.
    ///
    /// Blocks the caller while the write queue is full. Returns `false` if the
    /// connection is not available or has closed.
    pub fn send(&self, mut msg: Message) -> bool {
        if !self.available() {
            return false;
        }
        self.auto_compress(&mut msg);
        let tx = match lock(&self.write_tx).clone() {
            Some(tx) => tx,
            None => return false,
        };
        match tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => false,
            Err(TrySendError::Full(msg)) => {
                warn!(msgque = self.id, "{}", ERR_QUEUE_FULL);
                blocking_enqueue(tx, msg)
            }
        }
    }

    /// Queue `msg`, waiting asynchronously while the write queue is full
    pub async fn send_async(&self, mut msg: Message) -> bool {
        if !self.available() {
            return false;
        }
        self.auto_compress(&mut msg);
        let tx = match lock(&self.write_tx).clone() {
            Some(tx) => tx,
            None => return false,
        };
        tx.send(msg).await.is_ok()
    }

    pub fn send_string(&self, s: impl Into<String>) -> bool {
        self.send(Message::new_str(s))
    }

    pub fn send_string_ln(&self, s: impl Into<String>) -> bool {
        let mut s = s.into();
        s.push('\n');
        self.send(Message::new_str(s))
    }

    pub fn send_bytes_str(&self, data: &[u8]) -> bool {
        self.send(Message::new_str(String::from_utf8_lossy(data)))
    }

    pub fn send_bytes_str_ln(&self, data: &[u8]) -> bool {
        self.send_string_ln(String::from_utf8_lossy(data))
    }

    fn auto_compress(&self, msg: &mut Message) {
        // Line-mode messages and already compressed payloads go out as they are
        if !msg.head.is_some_and(|h| !h.has_flag(flags::COMPRESS)) {
            return;
        }
        let config = self.rt.config();
        let threshold = config.auto_compress_len as usize;
        match compression::maybe_compress(&msg.data, &config.compression, threshold) {
            Ok(Some(data)) => {
                msg.set_data(data);
                if let Some(head) = msg.head.as_mut() {
                    head.flags |= flags::COMPRESS;
                }
                self.rt.metrics().compression();
            }
            Ok(None) => {}
            Err(e) => warn!(msgque = self.id, error = %e, "auto compress failed, sending plain"),
        }
    }

    // Callbacks

    /// Send `msg` and deliver the reply with the same tag to `reply`.
    ///
    /// `reply` receives exactly one value: the reply, or `None` if the send
    /// fails, the tag is registered again, or the connection stops first.
    pub fn send_callback(&self, msg: Message, reply: CallbackSender) -> bool {
        let tag = msg.tag();
        if let Some(previous) = lock(&self.callbacks).insert(tag, reply.clone()) {
            let _ = previous.try_send(None);
        }
        if self.send(msg) {
            return true;
        }

        let mut callbacks = lock(&self.callbacks);
        if callbacks
            .get(&tag)
            .is_some_and(|current| current.same_channel(&reply))
        {
            callbacks.remove(&tag);
        }
        drop(callbacks);
        let _ = reply.try_send(None);
        false
    }

    /// Send `msg` and wait for the reply with the same tag
    pub async fn request(&self, msg: Message) -> Option<Message> {
        let (tx, mut rx) = mpsc::channel(1);
        if !self.send_callback(msg, tx) {
            return None;
        }
        rx.recv().await.flatten()
    }

    /// Forget the pending callback for `msg`'s tag without resolving it
    pub fn del_callback(&self, msg: &Message) {
        lock(&self.callbacks).remove(&msg.tag());
    }

    pub(crate) fn try_callback(&self, msg: &Message) -> bool {
        let reply = {
            let mut callbacks = lock(&self.callbacks);
            if callbacks.is_empty() {
                return false;
            }
            callbacks.remove(&msg.tag())
        };
        match reply {
            Some(reply) => {
                if reply.try_send(Some(msg.clone())).is_err() {
                    debug!(msgque = self.id, tag = msg.tag(), "callback receiver gone");
                }
                true
            }
            None => false,
        }
    }

    // Inbound

    /// Run one inbound message through the pipeline.
    ///
    /// Returns `false` when the connection should close.
    pub(crate) fn process_msg(self: &Arc<Self>, msg: Message) -> bool {
        if self.multiplex.load(Ordering::Relaxed) {
            let mq = Arc::clone(self);
            self.rt.go(async move {
                if !mq.process_msg_inner(msg) {
                    mq.stop();
                }
            });
            return true;
        }
        self.process_msg_inner(msg)
    }

    fn process_msg_inner(self: &Arc<Self>, mut msg: Message) -> bool {
        let compressed = msg.head.is_some_and(|h| h.has_flag(flags::COMPRESS));
        if compressed && !msg.data.is_empty() {
            let config = self.rt.config();
            let limit = config.max_msg_data_size as usize;
            match compression::decompress_with_limit(&msg.data, &config.compression, limit) {
                Ok(data) => {
                    msg.set_data(data);
                    if let Some(head) = msg.head.as_mut() {
                        head.flags &= !flags::COMPRESS;
                    }
                }
                Err(e) => {
                    error!(
                        msgque = self.id,
                        cmd = msg.head.map(|h| h.cmd),
                        act = msg.head.map(|h| h.act),
                        len = msg.data.len(),
                        error = %e,
                        "msgque uncompress failed"
                    );
                    return false;
                }
            }
        }

        if let Some(parser) = &self.parser {
            match parser.parse_c2s(&msg) {
                Ok(parsed) => msg.parsed = Some(Arc::new(parsed)),
                Err(e) => {
                    self.rt.metrics().parse_error();
                    debug!(msgque = self.id, error = %e, "parse failed");
                    match parser.error_policy() {
                        ParseErrorPolicy::SendRemind => {
                            if let Some(remind) = parser.remind_msg(&e, self.msg_type) {
                                self.send(remind.copy_tag(&msg));
                            }
                            return true;
                        }
                        ParseErrorPolicy::Close => return false,
                        ParseErrorPolicy::Continue => return true,
                        ParseErrorPolicy::Always => {}
                    }
                }
            }
        }

        if self.try_callback(&msg) {
            return true;
        }

        match self.handler.handler_func(self, &msg) {
            Some(f) => f(self, &msg),
            None => self.handler.on_process_msg(self, &msg),
        }
    }

    // Lifecycle

    /// Close the connection. Later calls do nothing.
    pub fn stop(self: &Arc<Self>) {
        if self
            .stop
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.set_state(ConnState::Stopping);
        self.available.store(false, Ordering::SeqCst);

        self.token().cancel();
        lock(&self.write_tx).take();

        if self.init.load(Ordering::SeqCst) {
            self.handler.on_del_msgque(self);
        }

        let pending: Vec<CallbackSender> = lock(&self.callbacks).drain().map(|(_, c)| c).collect();
        for reply in pending {
            let _ = reply.try_send(None);
        }

        let hooks = std::mem::take(&mut *lock(&self.on_stop));
        for hook in hooks {
            hook();
        }

        self.rt.remove_msgque(self.id);
        info!(msgque = self.id, "msgque close");
        self.set_state(ConnState::Stopped);
    }

    /// Dial again after `delay_secs`. Only for outbound connections that are not live.
    ///
    /// Every attempt after the first waits at least one second.
    pub fn reconnect(self: &Arc<Self>, delay_secs: u32) {
        if self.conn_type != ConnType::Conn || self.dial.is_none() || !self.rt.is_running() {
            return;
        }
        if self.state() == ConnState::Available && !self.stop.load(Ordering::SeqCst) {
            return;
        }
        if self
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let mut delay = delay_secs;
        if self.init.swap(true, Ordering::SeqCst) {
            delay = delay.max(1);
        }

        let mq = Arc::clone(self);
        let stop_token = self.rt.stop_token().clone();
        self.rt.spawn_tracked(async move {
            let previous = std::mem::take(&mut *lock(&mq.tasks));
            for handle in previous {
                let _ = handle.await;
            }
            if delay > 0 {
                tokio::select! {
                    _ = stop_token.cancelled() => {
                        mq.connecting.store(false, Ordering::SeqCst);
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(delay as u64)) => {}
                }
            }
            mq.connect().await;
        });
    }

    async fn connect(self: &Arc<Self>) {
        let target = match &self.dial {
            Some(target) => target.clone(),
            None => return,
        };

        *lock(&self.token) = self.rt.stop_token().child_token();
        let rx = self.open_write_queue();
        self.stop.store(false, Ordering::SeqCst);
        self.set_state(ConnState::Connecting);
        self.rt.add_msgque(self);

        info!(msgque = self.id, addr = %target, "connect to addr");
        let link = transport::dial(&target, self.rt.config().connect_timeout).await;
        let link = match link {
            Ok(link) => link,
            Err(e) => {
                info!(msgque = self.id, addr = %target, error = %e, "connect to addr failed");
                self.handler.on_connect_complete(self, false);
                self.connecting.store(false, Ordering::SeqCst);
                self.stop();
                return;
            }
        };
        if self.stop.load(Ordering::SeqCst) {
            self.connecting.store(false, Ordering::SeqCst);
            return;
        }

        let (local, remote) = link.addrs();
        self.set_addrs(local, remote);
        self.touch();
        info!(msgque = self.id, addr = %target, "connect to addr ok");
        self.available.store(true, Ordering::SeqCst);
        let keep = self.handler.on_connect_complete(self, true);
        self.connecting.store(false, Ordering::SeqCst);
        if keep {
            self.set_state(ConnState::Available);
            transport::start_link(self, link, rx);
        } else {
            self.stop();
        }
    }

    // Groups

    pub fn set_group_id(&self, group: impl Into<String>) {
        lock(&self.groups).insert(group.into());
    }

    pub fn del_group_id(&self, group: &str) {
        lock(&self.groups).remove(group);
    }

    pub fn clear_group_id(&self) {
        lock(&self.groups).clear();
    }

    pub fn is_in_group(&self, group: &str) -> bool {
        lock(&self.groups).contains(group)
    }

    // Settings

    /// Dispatch each inbound message on its own pooled task. Returns the previous setting.
    pub fn set_multiplex(&self, multiplex: bool) -> bool {
        self.multiplex.swap(multiplex, Ordering::SeqCst)
    }

    /// Idle timeout in seconds. 0 disables closing idle connections.
    pub fn set_timeout(&self, secs: u32) {
        self.timeout.store(secs, Ordering::Relaxed);
    }

    pub fn timeout(&self) -> u32 {
        self.timeout.load(Ordering::Relaxed)
    }

    pub fn set_user(&self, user: Arc<dyn Any + Send + Sync>) {
        if let Ok(mut slot) = self.user.write() {
            *slot = Some(user);
        }
    }

    pub fn user(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.user.read().ok().and_then(|u| u.clone())
    }

    pub fn user_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.user().and_then(|u| u.downcast::<T>().ok())
    }

    // Addresses

    pub fn local_addr(&self) -> String {
        self.local_addr.read().map(|a| a.clone()).unwrap_or_default()
    }

    /// Peer address, preferring the one set by [`set_real_remote_addr`](Self::set_real_remote_addr)
    pub fn remote_addr(&self) -> String {
        let real = self
            .real_remote_addr
            .read()
            .map(|a| a.clone())
            .unwrap_or_default();
        if !real.is_empty() {
            return real;
        }
        self.remote_addr.read().map(|a| a.clone()).unwrap_or_default()
    }

    /// Record the client address reported by a proxy in front of this connection
    pub fn set_real_remote_addr(&self, addr: impl Into<String>) {
        if let Ok(mut slot) = self.real_remote_addr.write() {
            *slot = addr.into();
        }
    }

    pub fn is_proxy(&self) -> bool {
        self.real_remote_addr
            .read()
            .map(|a| !a.is_empty())
            .unwrap_or(false)
    }
}

/// Wait for queue space without stalling the async runtime's other tasks
fn blocking_enqueue(tx: mpsc::Sender<Message>, msg: Message) -> bool {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| handle.block_on(tx.send(msg))).is_ok()
        }
        // TODO: current_thread runtimes cannot block here; the spawned send
        // may land after messages queued later from the same caller
        Ok(handle) => {
            handle.spawn(async move {
                let _ = tx.send(msg).await;
            });
            true
        }
        Err(_) => tx.blocking_send(msg).is_ok(),
    }
}

impl fmt::Debug for MsgQue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgQue")
            .field("id", &self.id)
            .field("msg_type", &self.msg_type)
            .field("net_type", &self.net_type)
            .field("conn_type", &self.conn_type)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::error::codes;
    use crate::parser::{ParseErrorPolicy, Parser, ParserType};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    struct Recorder {
        seen: Mutex<Vec<Message>>,
        deleted: AtomicBool,
    }

    impl MsgHandler for Recorder {
        fn on_process_msg(&self, _mq: &Arc<MsgQue>, msg: &Message) -> bool {
            lock(&self.seen).push(msg.clone());
            msg.head.map_or(true, |h| h.cmd != 99)
        }

        fn on_del_msgque(&self, _mq: &Arc<MsgQue>) {
            self.deleted.store(true, Ordering::SeqCst);
        }
    }

    fn recorder() -> Arc<Recorder> {
        Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            deleted: AtomicBool::new(false),
        })
    }

    fn accepted(
        handler: Arc<Recorder>,
        parser: Option<Arc<dyn MsgCodec>>,
    ) -> (Arc<Runtime>, Arc<MsgQue>, mpsc::Receiver<Message>) {
        accepted_with(RuntimeConfig::default(), handler, parser)
    }

    #[allow(clippy::unwrap_used)]
    fn accepted_with(
        config: RuntimeConfig,
        handler: Arc<Recorder>,
        parser: Option<Arc<dyn MsgCodec>>,
    ) -> (Arc<Runtime>, Arc<MsgQue>, mpsc::Receiver<Message>) {
        let rt = Runtime::new(config).unwrap();
        let mq = MsgQue::new(
            &rt,
            MsgType::Msg,
            NetType::Tcp,
            ConnType::Accept,
            handler,
            parser,
            None,
        );
        let rx = mq.open_write_queue();
        mq.accept_ready();
        (rt, mq, rx)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ids_are_unique_and_increasing() {
        let (rt, a, _rx) = accepted(recorder(), None);
        let b = MsgQue::new(
            &rt,
            MsgType::Msg,
            NetType::Tcp,
            ConnType::Accept,
            recorder(),
            None,
            None,
        );
        assert!(b.id() > a.id());
        assert_eq!(rt.msgque_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_callback_resolves_once_with_reply() {
        let handler = recorder();
        let (_rt, mq, mut rx) = accepted(handler.clone(), None);

        let (tx, mut reply) = mpsc::channel(1);
        assert!(mq.send_callback(Message::new_tag(1, 2, 3), tx));
        assert!(rx.recv().await.is_some());

        assert!(mq.process_msg(Message::new(1, 2, 3, 0, b"ok".to_vec())));
        let got = reply.recv().await.flatten();
        assert_eq!(got.map(|m| m.data.to_vec()), Some(b"ok".to_vec()));
        assert!(lock(&handler.seen).is_empty());

        // Same tag again goes to the handler
        assert!(mq.process_msg(Message::new(1, 2, 3, 0, b"again".to_vec())));
        assert_eq!(lock(&handler.seen).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_resolves_pending_callbacks_with_none() {
        let handler = recorder();
        let (rt, mq, _rx) = accepted(handler.clone(), None);

        let (tx, mut reply) = mpsc::channel(1);
        assert!(mq.send_callback(Message::new_tag(4, 4, 4), tx));
        mq.stop();
        mq.stop();

        assert!(matches!(reply.recv().await, Some(None)));
        assert!(handler.deleted.load(Ordering::SeqCst));
        assert_eq!(mq.state(), ConnState::Stopped);
        assert!(!mq.send(Message::new_tag(1, 1, 1)));
        assert_eq!(rt.msgque_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reregistering_a_tag_resolves_previous_with_none() {
        let (_rt, mq, _rx) = accepted(recorder(), None);
        let (first, mut first_rx) = mpsc::channel(1);
        let (second, _second_rx) = mpsc::channel(1);
        assert!(mq.send_callback(Message::new_tag(1, 1, 1), first));
        assert!(mq.send_callback(Message::new_tag(1, 1, 1), second));
        assert!(matches!(first_rx.recv().await, Some(None)));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[allow(clippy::unwrap_used)]
    async fn test_send_remind_keeps_tag_and_skips_handler() {
        let mut parser = Parser::new(ParserType::Json, ParseErrorPolicy::SendRemind);
        parser.register::<Ping, ()>(1, 1);
        let handler = recorder();
        let (_rt, mq, mut rx) = accepted(handler.clone(), parser.build());

        assert!(mq.process_msg(Message::new(1, 1, 42, 0, b"{broken".to_vec())));
        let remind = rx.recv().await.unwrap();
        let head = remind.head.unwrap();
        assert_eq!(head.error, codes::JSON_UNPACK);
        assert_eq!((head.cmd, head.act, head.index), (1, 1, 42));
        assert!(lock(&handler.seen).is_empty());
        assert!(mq.available());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_and_always_policies() {
        let mut parser = Parser::new(ParserType::Json, ParseErrorPolicy::Close);
        parser.register::<Ping, ()>(1, 1);
        let (_rt, mq, _rx) = accepted(recorder(), parser.build());
        assert!(!mq.process_msg(Message::new(1, 1, 0, 0, b"nope".to_vec())));

        let mut parser = Parser::new(ParserType::Json, ParseErrorPolicy::Always);
        parser.register::<Ping, ()>(1, 1);
        let handler = recorder();
        let (_rt, mq, _rx) = accepted(handler.clone(), parser.build());
        assert!(mq.process_msg(Message::new(1, 1, 0, 0, b"nope".to_vec())));
        assert_eq!(lock(&handler.seen).len(), 1);
        assert!(lock(&handler.seen)[0].parsed.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_handler_false_closes() {
        let (_rt, mq, _rx) = accepted(recorder(), None);
        assert!(!mq.process_msg(Message::new_tag(99, 0, 0)));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[allow(clippy::unwrap_used)]
    async fn test_auto_compress_round_trip() {
        let rt = Runtime::new(RuntimeConfig::default_with_overrides(|c| {
            c.auto_compress_len = 64;
        }))
        .unwrap();
        let handler = recorder();
        let mq = MsgQue::new(
            &rt,
            MsgType::Msg,
            NetType::Tcp,
            ConnType::Accept,
            handler.clone(),
            None,
            None,
        );
        let mut rx = mq.open_write_queue();
        mq.accept_ready();

        let payload = vec![b'a'; 4096];
        assert!(mq.send(Message::new(5, 5, 0, 0, payload.clone())));
        let sent = rx.recv().await.unwrap();
        assert!(sent.head.unwrap().has_flag(flags::COMPRESS));
        assert!(sent.data.len() < payload.len());

        assert!(mq.process_msg(sent));
        let seen = lock(&handler.seen)[0].clone();
        assert_eq!(seen.data.to_vec(), payload);
        assert!(!seen.head.unwrap().has_flag(flags::COMPRESS));
        assert_eq!(seen.head.unwrap().len as usize, payload.len());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[allow(clippy::unwrap_used)]
    async fn test_compressed_payload_uses_configured_max() {
        let config = RuntimeConfig::default_with_overrides(|c| {
            c.max_msg_data_size = 4 * 1024 * 1024;
            c.auto_compress_len = 64;
        });
        let handler = recorder();
        let (_rt, mq, mut rx) = accepted_with(config, handler.clone(), None);

        let payload = vec![b'z'; 2 * 1024 * 1024];
        assert!(mq.send(Message::new(6, 6, 0, 0, payload.clone())));
        let sent = rx.recv().await.unwrap();
        assert!(sent.head.unwrap().has_flag(flags::COMPRESS));

        assert!(mq.process_msg(sent));
        assert_eq!(lock(&handler.seen)[0].data.len(), payload.len());
        assert!(mq.available());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[allow(clippy::unwrap_used)]
    async fn test_send_async_waits_for_queue_space() {
        let config = RuntimeConfig::default_with_overrides(|c| c.write_queue_capacity = 1);
        let (_rt, mq, mut rx) = accepted_with(config, recorder(), None);

        assert!(mq.send_async(Message::new_tag(1, 0, 1)).await);
        let queued = {
            let mq = Arc::clone(&mq);
            tokio::spawn(async move { mq.send_async(Message::new_tag(1, 0, 2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!queued.is_finished());

        assert_eq!(rx.recv().await.unwrap().head.unwrap().index, 1);
        assert!(queued.await.unwrap());
        assert_eq!(rx.recv().await.unwrap().head.unwrap().index, 2);

        mq.stop();
        assert!(!mq.send_async(Message::new_tag(1, 0, 3)).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_groups_and_settings() {
        let (rt, mq, mut rx) = accepted(recorder(), None);
        mq.set_group_id("room");
        assert!(mq.is_in_group("room"));
        assert_eq!(rt.send_group("room", &Message::new_tag(1, 0, 0)), 1);
        assert!(rx.recv().await.is_some());
        mq.del_group_id("room");
        assert_eq!(rt.send_group("room", &Message::new_tag(1, 0, 0)), 0);

        assert!(!mq.set_multiplex(true));
        assert!(mq.set_multiplex(false));

        mq.set_real_remote_addr("10.0.0.1:9");
        assert!(mq.is_proxy());
        assert_eq!(mq.remote_addr(), "10.0.0.1:9");

        mq.set_user(Arc::new(7u64));
        assert_eq!(mq.user_as::<u64>().as_deref(), Some(&7));
    }
}
