use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nserf::codec::{decode_message, encode_message, MessageType};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone)]
struct Alive {
    name: String,
    addr: std::net::IpAddr,
    port: u16,
    incarnation: u64,
    meta: Vec<u8>,
}

fn sample() -> Alive {
    Alive {
        name: "node-042".into(),
        addr: "10.0.0.42".parse().unwrap(),
        port: 7946,
        incarnation: 17,
        meta: vec![0u8; 64],
    }
}

fn bench_codec(c: &mut Criterion) {
    let msg = sample();
    let encoded = encode_message(MessageType::Alive, &msg).unwrap();

    c.bench_function("encode_message/alive", |b| {
        b.iter(|| encode_message(MessageType::Alive, black_box(&msg)).unwrap())
    });

    c.bench_function("decode_message/alive", |b| {
        b.iter(|| {
            let (_ty, decoded): (MessageType, Alive) = decode_message(black_box(&encoded)).unwrap();
            black_box(decoded)
        })
    });
}

criterion_group!(benches, bench_codec);
criterion_main!(benches);
