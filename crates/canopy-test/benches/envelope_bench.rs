//! Benchmarks for payload sealing and frame authentication

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use canopy_core::{KeyId, NodeId, PubId, Topic, DEFAULT_SEPARATORS};
use canopy_crypto::{CryptoEnvelope, Identity, KeyStore};
use canopy_wire::{FrameFlags, Message, PublicationBody};

const NETWORK_KEY: KeyId = KeyId([0x01; 16]);
const CONTENT_KEY: KeyId = KeyId([0x02; 16]);

fn envelope() -> CryptoEnvelope {
    let store = KeyStore::new();
    store.set_network_key(NETWORK_KEY, &[0x42; 32]).unwrap();
    store.add_content_key(CONTENT_KEY, &[0x24; 32]).unwrap();
    CryptoEnvelope::new(store)
}

fn body(size: usize) -> PublicationBody {
    PublicationBody {
        pub_id: PubId::generate(),
        seq: 1,
        ack_requested: false,
        topics: vec![Topic::parse("bench/payload", DEFAULT_SEPARATORS).unwrap()],
        seal: None,
        payload: vec![0xAB; size],
    }
}

fn bench_identity_generate(c: &mut Criterion) {
    c.bench_function("identity_generate", |b| b.iter(|| black_box(Identity::generate())));
}

fn bench_seal_publication(c: &mut Criterion) {
    let envelope = envelope();
    let mut group = c.benchmark_group("seal_publication");

    for size in [64usize, 512, 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || body(size),
                |mut body| {
                    envelope.seal_publication(&mut body, CONTENT_KEY).unwrap();
                    body
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_open_publication(c: &mut Criterion) {
    let envelope = envelope();
    let mut sealed = body(512);
    envelope.seal_publication(&mut sealed, CONTENT_KEY).unwrap();

    let mut group = c.benchmark_group("open_publication");
    group.throughput(Throughput::Bytes(512));
    group.bench_function("512_bytes", |b| {
        b.iter(|| envelope.open_publication(black_box(&sealed)).unwrap())
    });
    group.finish();
}

fn bench_frame_roundtrip(c: &mut Criterion) {
    let envelope = envelope();
    let node_id = NodeId::new(0xDEAD_BEEF_CAFE_BABE);
    let message = Message::Publication(body(512));
    let frame = envelope
        .seal_frame(node_id, &message, FrameFlags::NONE)
        .unwrap();

    let mut group = c.benchmark_group("frame");
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("seal", |b| {
        b.iter(|| {
            envelope
                .seal_frame(node_id, black_box(&message), FrameFlags::NONE)
                .unwrap()
        })
    });
    group.bench_function("open", |b| {
        b.iter(|| envelope.open_frame(black_box(&frame)).unwrap())
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_identity_generate,
    bench_seal_publication,
    bench_open_publication,
    bench_frame_roundtrip,
);
criterion_main!(benches);
