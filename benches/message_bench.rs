#![allow(clippy::unwrap_used)]

use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use netque::core::codec::MessageCodec;
use netque::{Message, MessageHead, MsgType, ParseErrorPolicy, Parser, ParserType};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

fn bench_head(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_head");
    let head = MessageHead {
        len: 1024,
        error: 0,
        cmd: 3,
        act: 7,
        index: 42,
        flags: 0,
    };
    let bytes = head.to_bytes();

    group.bench_function("pack", |b| b.iter(|| head.to_bytes()));
    group.bench_function("unpack", |b| {
        b.iter(|| MessageHead::from_bytes(&bytes).unwrap())
    });
    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_codec");
    for &size in &[0usize, 64, 4096, 65536] {
        let msg = Message::new(1, 2, 3, 0, vec![0xAB; size]);
        let mut wire = BytesMut::new();
        MessageCodec::new(MsgType::Msg)
            .encode(msg.clone(), &mut wire)
            .unwrap();

        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_function(format!("encode_{size}b"), |b| {
            let mut codec = MessageCodec::new(MsgType::Msg);
            b.iter_batched(
                || (msg.clone(), BytesMut::with_capacity(wire.len())),
                |(m, mut dst)| codec.encode(m, &mut dst).unwrap(),
                BatchSize::SmallInput,
            )
        });
        group.bench_function(format!("decode_{size}b"), |b| {
            let mut codec = MessageCodec::new(MsgType::Msg);
            b.iter_batched(
                || wire.clone(),
                |mut src| codec.decode(&mut src).unwrap().unwrap(),
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Move {
    x: i32,
    y: i32,
    speed: f32,
    tag: String,
}

fn bench_parsers(c: &mut Criterion) {
    let mut group = c.benchmark_group("parser");
    let body = Move {
        x: 10,
        y: -4,
        speed: 1.5,
        tag: "run".into(),
    };

    for kind in [ParserType::Json, ParserType::MsgPack, ParserType::Bincode] {
        let mut parser = Parser::new(kind, ParseErrorPolicy::Continue);
        parser.register::<Move, ()>(5, 1);
        let data = parser.pack(&body).unwrap();
        let codec = parser.build().unwrap();
        let msg = Message::new(5, 1, 0, 0, data);

        group.bench_function(format!("{kind:?}_parse"), |b| {
            b.iter(|| codec.parse_c2s(&msg).unwrap())
        });
        group.bench_function(format!("{kind:?}_pack"), |b| {
            b.iter(|| codec.pack(&body).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_head, bench_codec, bench_parsers);
criterion_main!(benches);
