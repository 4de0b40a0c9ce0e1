//! Benchmarks for the engine wire formats in protocol/
//!
//! Performance-critical paths:
//! - `encode_frame` / `decode_frame`: every engine exchange
//! - `decode_metered_frame`: subprocess replies
//! - `NetstringCodec`: record framing on the subprocess pipes

#![allow(missing_docs)]

use bytes::{Bytes, BytesMut};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tokio_util::codec::{Decoder, Encoder};
use vatvisor_kernel::message::{Headers, Id, Message, MessageType};
use vatvisor_kernel::protocol::{
    NetstringCodec, decode_frame, decode_metered_frame, encode_frame,
};

const BODY_SIZES: [usize; 4] = [64, 4096, 65536, 1_048_576];

fn message(size: usize) -> Message {
    Message::new(
        Headers::new(MessageType::System)
            .with_from(Id::new(3))
            .with_to(Id::new(1))
            .with_port(Id::new(2))
            .sync(),
    )
    .with_body(vec![b'x'; size])
}

fn bench_encode_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing/encode");

    for size in BODY_SIZES {
        let message = message(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, m| {
            b.iter(|| encode_frame(black_box(m)).unwrap());
        });
    }

    group.finish();
}

fn bench_decode_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing/decode");

    for size in BODY_SIZES {
        let frame = encode_frame(&message(size)).unwrap().freeze();
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, f| {
            b.iter(|| decode_frame(black_box(f.clone())).unwrap());
        });
    }

    group.finish();
}

fn bench_decode_metered(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing/decode_metered");

    let meter = br#"{"compute":1234,"allocate":65536,"currentHeapCount":42}"#;
    for size in [64usize, 65536] {
        let mut raw = BytesMut::from(&meter[..]);
        raw.extend_from_slice(&[0x01]);
        raw.extend_from_slice(&encode_frame(&message(size)).unwrap());
        let frame = raw.freeze();
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, f| {
            b.iter(|| decode_metered_frame(black_box(f.clone())).unwrap());
        });
    }

    group.finish();
}

fn bench_netstring(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing/netstring");

    for size in BODY_SIZES {
        let payload = Bytes::from(vec![b'?'; size]);
        let mut encoded = BytesMut::new();
        NetstringCodec::default()
            .encode(payload.clone(), &mut encoded)
            .unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &payload, |b, p| {
            b.iter(|| {
                let mut dst = BytesMut::with_capacity(p.len() + 16);
                NetstringCodec::default()
                    .encode(black_box(p.clone()), &mut dst)
                    .unwrap();
                dst
            });
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, e| {
            b.iter(|| {
                let mut src = e.clone();
                NetstringCodec::default()
                    .decode(black_box(&mut src))
                    .unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode_frame,
    bench_decode_frame,
    bench_decode_metered,
    bench_netstring
);
criterion_main!(benches);
