use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use logos_relay::merge::merge_updates;
use logos_relay::protocol::{self, Message, PresenceEntry, SyncMessage};
use yrs::{Doc, GetString, ReadTxn, Text, Transact, WriteTxn};

fn edits(count: usize) -> Vec<Vec<u8>> {
    let doc = Doc::new();
    (0..count)
        .map(|i| {
            let sv = doc.transact().state_vector();
            {
                let mut txn = doc.transact_mut();
                let text = txn.get_or_insert_text("content");
                let len = text.get_string(&txn).len() as u32;
                text.insert(&mut txn, len, &format!("edit {i} "));
            }
            doc.transact().encode_state_as_update_v1(&sv)
        })
        .collect()
}

fn bench_envelope_encode(c: &mut Criterion) {
    let payload = vec![0u8; 64];

    c.bench_function("envelope_encode_64B", |b| {
        b.iter(|| {
            let msg = Message::Sync(SyncMessage::Update(black_box(payload.clone())));
            black_box(msg.encode());
        })
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let encoded = Message::Sync(SyncMessage::Update(vec![0u8; 64])).encode();

    c.bench_function("envelope_decode_64B", |b| {
        b.iter(|| {
            black_box(protocol::decode_envelope(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_presence_decode(c: &mut Criterion) {
    let entries: Vec<PresenceEntry> = (0..50)
        .map(|id| PresenceEntry::present(id, 3, r#"{"cursor":{"anchor":12,"head":40}}"#))
        .collect();
    let payload = protocol::encode_presence_entries(&entries);

    c.bench_function("presence_decode_50_clients", |b| {
        b.iter(|| {
            black_box(protocol::decode_presence_entries(black_box(&payload)).unwrap());
        })
    });
}

fn bench_merge_100(c: &mut Criterion) {
    let updates = edits(100);

    c.bench_function("merge_100_updates", |b| {
        b.iter(|| {
            black_box(merge_updates(black_box(&updates)).unwrap());
        })
    });
}

fn bench_merge_snapshot_plus_tail(c: &mut Criterion) {
    let updates = edits(110);
    let snapshot = merge_updates(&updates[..100]).unwrap().unwrap();
    let mut blobs = vec![snapshot];
    blobs.extend_from_slice(&updates[100..]);

    c.bench_function("merge_snapshot_plus_10", |b| {
        b.iter(|| {
            black_box(merge_updates(black_box(&blobs)).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_presence_decode,
    bench_merge_100,
    bench_merge_snapshot_plus_tail,
);
criterion_main!(benches);
