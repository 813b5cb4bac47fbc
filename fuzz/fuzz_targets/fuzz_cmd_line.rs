#![no_main]

use libfuzzer_sys::fuzz_target;
use netque::error::Result;
use netque::parser::{CmdArgs, CmdField, CmdKind, CmdMsg};
use netque::{Message, ParseErrorPolicy, Parser, ParserType};
use serde::Serialize;

#[derive(Serialize)]
struct Move {
    x: i64,
    y: i64,
    run: bool,
}

impl CmdMsg for Move {
    fn shape() -> Vec<CmdField> {
        vec![
            CmdField::Key("move"),
            CmdField::Value("x", CmdKind::Int),
            CmdField::Value("y", CmdKind::Int),
            CmdField::Value("run", CmdKind::Bool),
        ]
    }

    fn from_args(args: &CmdArgs) -> Result<Self> {
        Ok(Self {
            x: args.int("x")?,
            y: args.int("y")?,
            run: args.bool("run")?,
        })
    }
}

fuzz_target!(|data: &[u8]| {
    let mut parser = Parser::new(ParserType::Cmd, ParseErrorPolicy::Continue);
    parser.register_cmd::<Move, ()>();
    if let Some(codec) = parser.build() {
        let _ = codec.parse_c2s(&Message::new_str(String::from_utf8_lossy(data)));
    }
});
