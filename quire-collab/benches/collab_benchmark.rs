use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use quire_collab::presence::{AwarenessUpdate, PresenceRoom, PresenceState, PresenceUser};
use quire_collab::protocol::{FrameFormat, WireMessage};
use quire_collab::registry::{PeerSession, SessionRegistry};

fn bench_update_encode(c: &mut Criterion) {
    let msg = WireMessage::update(vec![7u8; 64]);

    c.bench_function("update_encode_binary_64B", |b| {
        b.iter(|| black_box(black_box(&msg).encode_binary().unwrap()))
    });
    c.bench_function("update_encode_json_64B", |b| {
        b.iter(|| black_box(black_box(&msg).encode_json().unwrap()))
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let msg = WireMessage::update(vec![7u8; 64]);
    let binary = msg.encode_binary().unwrap();
    let json = msg.encode_json().unwrap();

    c.bench_function("update_decode_binary_64B", |b| {
        b.iter(|| black_box(WireMessage::decode_binary(black_box(&binary)).unwrap()))
    });
    c.bench_function("update_decode_json_64B", |b| {
        b.iter(|| black_box(WireMessage::decode_json(black_box(&json)).unwrap()))
    });
}

fn bench_broadcast_100_peers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = SessionRegistry::new();
    let addr = "127.0.0.1:4000".parse().unwrap();
    let mut receivers = Vec::new();
    rt.block_on(async {
        for _ in 0..100 {
            let (session, rx) = PeerSession::new(addr, 1024);
            registry.add(session).await;
            receivers.push(rx);
        }
    });
    let frame = WireMessage::update(vec![7u8; 64]).to_frame(FrameFormat::Binary).unwrap();

    c.bench_function("broadcast_except_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(registry.broadcast_except(None, black_box(&frame)).await);
            });
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_presence_apply(c: &mut Criterion) {
    let mut room = PresenceRoom::new(0);
    let state = PresenceState {
        user: PresenceUser { name: "Bench".into(), color: "#ffa500".into(), id: 1 },
        cursor: None,
    };
    let mut clock = 0u64;

    c.bench_function("presence_apply_100_clients", |b| {
        b.iter(|| {
            clock += 1;
            for client_id in 1..=100 {
                let update = AwarenessUpdate { client_id, clock, state: Some(state.clone()) };
                black_box(room.apply(&update));
            }
        })
    });
}

criterion_group!(
    codec_benches,
    bench_update_encode,
    bench_update_decode,
);

criterion_group!(
    fanout_benches,
    bench_broadcast_100_peers,
    bench_presence_apply,
);

criterion_main!(codec_benches, fanout_benches);
