#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use netque::core::codec::MessageCodec;
use netque::MsgType;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    for mode in [MsgType::Msg, MsgType::Cmd] {
        let mut codec = MessageCodec::with_max_len(mode, 64 * 1024);
        let mut buf = BytesMut::from(data);
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
        let _ = codec.decode_eof(&mut buf);
    }
});
