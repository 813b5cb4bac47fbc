//! Example: echo server on TCP and UDP, with a WebSocket console
//!
//! Framed messages on `all://127.0.0.1:6666` are echoed back with the same tag.
//! On `ws://127.0.0.1:6680/echo` the line `stat` answers with the runtime
//! counters as tab-indented JSON; other lines are ignored.
//!
//! Run with: `cargo run --example echo_server`
//! Configuration comes from `NETQUE_*` environment variables.

use netque::error::Result;
use netque::parser::{cmd, CmdArgs, CmdField, CmdMsg};
use netque::utils::init_logging;
use netque::{
    start_server, DefaultHandler, EchoHandler, MsgType, ParseErrorPolicy, Parser, ParserType,
    Runtime, RuntimeConfig,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Default, Serialize)]
struct Stat {
    stat: String,
}

impl CmdMsg for Stat {
    fn shape() -> Vec<CmdField> {
        vec![CmdField::Key("stat")]
    }

    fn from_args(args: &CmdArgs) -> Result<Self> {
        Ok(Self {
            stat: args.str("stat")?,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = RuntimeConfig::from_env()?;
    init_logging(&config.logging)?;
    let rt = Runtime::new(config)?;

    start_server(&rt, "all://127.0.0.1:6666", MsgType::Msg, Arc::new(EchoHandler), None).await?;

    let mut parser = Parser::new(ParserType::Cmd, ParseErrorPolicy::Continue);
    parser.register_cmd::<Stat, ()>();
    let lines = DefaultHandler::new();
    lines.register_msg::<Stat, _>(|mq, _msg| match cmd::pack_pretty(&mq.runtime().statis()) {
        Ok(json) => mq.send_bytes_str_ln(&json),
        Err(_) => false,
    });
    start_server(
        &rt,
        "ws://127.0.0.1:6680/echo",
        MsgType::Cmd,
        Arc::new(lines),
        parser.build(),
    )
    .await?;

    info!("echo server running, Ctrl-C to stop");
    rt.wait_for_system_exit().await;
    Ok(())
}
