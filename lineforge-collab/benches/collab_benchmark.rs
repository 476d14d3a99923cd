use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use lineforge_collab::frame::{decode_next_frame, encode_masked_frame, encode_text_frame, Opcode};
use lineforge_collab::snapshot::{compute_checksum, DiffOperation, Snapshot, SnapshotStore};

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");
    for size in [64usize, 1024, 65536] {
        let text = "x".repeat(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &text, |b, text| {
            b.iter(|| black_box(encode_text_frame(black_box(text))))
        });
    }
    group.finish();
}

fn bench_frame_decode_masked(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode_masked");
    for size in [64usize, 1024, 65536] {
        let frame = encode_masked_frame(Opcode::Text, &vec![b'x'; size], [0x12, 0x34, 0x56, 0x78]);
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| black_box(decode_next_frame(black_box(frame)).unwrap()))
        });
    }
    group.finish();
}

fn snapshot_of(keys: usize) -> Snapshot {
    (0..keys)
        .map(|i| (format!("project:line:{i:05}"), format!("{{\"id\":{i},\"points\":[1,2,3]}}")))
        .collect()
}

fn bench_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum");
    for keys in [10usize, 1000] {
        let snapshot = snapshot_of(keys);
        group.bench_with_input(BenchmarkId::from_parameter(keys), &snapshot, |b, snapshot| {
            b.iter(|| black_box(compute_checksum(black_box(snapshot))))
        });
    }
    group.finish();
}

fn bench_apply_operations(c: &mut Criterion) {
    let mut store = SnapshotStore::default();
    let seed: Vec<DiffOperation> = snapshot_of(1000)
        .into_iter()
        .map(|(k, v)| DiffOperation::set(k, v))
        .collect();
    let base = store.state().checksum.clone();
    store.apply_operations(&base, &seed);

    c.bench_function("apply_operations_1000_keys", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let base = store.state().checksum.clone();
            let ops = [
                DiffOperation::set("project:line:00001", counter.to_string()),
                DiffOperation::remove("project:line:00002"),
            ];
            black_box(store.apply_operations(&base, &ops))
        })
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode_masked,
    bench_checksum,
    bench_apply_operations
);
criterion_main!(benches);
