//! Application callbacks for connection events.
//!
//! [`MsgHandler`] is what a server or client implements. [`HandlerMap`] routes
//! messages to per-route functions, by `(cmd, act)` for headed messages and by
//! decoded request type for headless ones.

use super::MsgQue;
use crate::core::message::{cmd_act, Message};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Per-route message function. Returning `false` closes the connection.
pub type HandlerFn = Arc<dyn Fn(&Arc<MsgQue>, &Message) -> bool + Send + Sync>;

pub trait MsgHandler: Send + Sync + 'static {
    /// A connection was accepted. Returning `false` rejects it.
    fn on_new_msgque(&self, _mq: &Arc<MsgQue>) -> bool {
        true
    }

    /// A connection that was accepted or connected has stopped
    fn on_del_msgque(&self, _mq: &Arc<MsgQue>) {}

    /// Fallback for messages with no routed function
    fn on_process_msg(&self, _mq: &Arc<MsgQue>, _msg: &Message) -> bool {
        true
    }

    /// Outbound connect finished. Returning `false` after success closes the connection.
    fn on_connect_complete(&self, _mq: &Arc<MsgQue>, _ok: bool) -> bool {
        true
    }

    /// Routed function for `msg`, if any
    fn handler_func(&self, _mq: &Arc<MsgQue>, _msg: &Message) -> Option<HandlerFn> {
        None
    }
}

/// Route table from message keys to handler functions
#[derive(Default)]
pub struct HandlerMap {
    routes: RwLock<HashMap<u16, HandlerFn>>,
    types: RwLock<HashMap<TypeId, HandlerFn>>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route headed messages with this `(cmd, act)` to `f`
    pub fn register<F>(&self, cmd: u8, act: u8, f: F)
    where
        F: Fn(&Arc<MsgQue>, &Message) -> bool + Send + Sync + 'static,
    {
        match self.routes.write() {
            Ok(mut routes) => {
                routes.insert(cmd_act(cmd, act), Arc::new(f));
            }
            Err(_) => warn!(cmd, act, "Handler map poisoned, route not registered"),
        }
    }

    /// Route headless messages whose decoded request is a `T` to `f`
    pub fn register_msg<T, F>(&self, f: F)
    where
        T: 'static,
        F: Fn(&Arc<MsgQue>, &Message) -> bool + Send + Sync + 'static,
    {
        match self.types.write() {
            Ok(mut types) => {
                types.insert(TypeId::of::<T>(), Arc::new(f));
            }
            Err(_) => warn!(
                msg_type = std::any::type_name::<T>(),
                "Handler map poisoned, route not registered"
            ),
        }
    }

    pub fn lookup(&self, msg: &Message) -> Option<HandlerFn> {
        match msg.head {
            Some(head) => self.routes.read().ok()?.get(&head.cmd_act()).cloned(),
            None => {
                let type_id = msg.parsed.as_ref()?.c2s_type_id()?;
                self.types.read().ok()?.get(&type_id).cloned()
            }
        }
    }
}

/// Handler that only dispatches through a [`HandlerMap`]
#[derive(Default)]
pub struct DefaultHandler {
    pub map: HandlerMap,
}

impl DefaultHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, cmd: u8, act: u8, f: F)
    where
        F: Fn(&Arc<MsgQue>, &Message) -> bool + Send + Sync + 'static,
    {
        self.map.register(cmd, act, f);
    }

    pub fn register_msg<T, F>(&self, f: F)
    where
        T: 'static,
        F: Fn(&Arc<MsgQue>, &Message) -> bool + Send + Sync + 'static,
    {
        self.map.register_msg::<T, F>(f);
    }
}

impl MsgHandler for DefaultHandler {
    fn handler_func(&self, _mq: &Arc<MsgQue>, msg: &Message) -> Option<HandlerFn> {
        self.map.lookup(msg)
    }
}

/// Sends every message back to its sender
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl MsgHandler for EchoHandler {
    fn on_process_msg(&self, mq: &Arc<MsgQue>, msg: &Message) -> bool {
        mq.send(msg.clone());
        true
    }
}
