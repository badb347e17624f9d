use criterion::{black_box, criterion_group, criterion_main, Criterion};
use replikit::history::{self, History, ReplicationEntry, DEFAULT_MAX_HISTORY};
use replikit::{Metadata, ReplicationIntake};
use replikit_store::{replicate, DocumentKind, MemoryStore};
use serde_json::{json, Value};

fn lineage(source: &str, len: u64) -> History {
    (1..=len).map(|v| ReplicationEntry::new(source, v)).collect()
}

fn bench_history_merge(c: &mut Criterion) {
    let incoming = lineage("node-a", 50);
    let existing = lineage("node-b", 50);

    c.bench_function("history::merge 50 + 50", |b| {
        b.iter(|| black_box(history::merge(&incoming, &existing, DEFAULT_MAX_HISTORY)))
    });

    let overlapping = lineage("node-a", 60);
    c.bench_function("history::merge overlapping", |b| {
        b.iter(|| black_box(history::merge(&overlapping, &incoming, DEFAULT_MAX_HISTORY)))
    });
}

fn bench_descendant_chain(c: &mut Criterion) {
    // Each write descends from the previous one.
    let mut writes: Vec<Metadata> = Vec::with_capacity(100);
    for version in 1..=100 {
        let next = history::stamp_local_write(writes.last(), "peer", version, DEFAULT_MAX_HISTORY);
        writes.push(next);
    }
    let intake = ReplicationIntake::<Value, Value>::new();

    c.bench_function("replicate 100 descendant puts", |b| {
        b.iter(|| {
            let store = MemoryStore::<DocumentKind>::with_local_id("bench");
            for (i, metadata) in writes.iter().enumerate() {
                let outcome = replicate(&store, &intake, "docs/1", metadata.clone(), Some(json!({ "n": i })));
                black_box(outcome.is_ok());
            }
        })
    });
}

fn bench_conflict_growth(c: &mut Criterion) {
    let intake = ReplicationIntake::<Value, Value>::new();

    c.bench_function("replicate 20 concurrent puts", |b| {
        b.iter(|| {
            let store = MemoryStore::<DocumentKind>::with_local_id("bench");
            for peer in 0..20 {
                let metadata = Metadata::new(format!("peer-{peer}"), 1);
                let outcome = replicate(&store, &intake, "docs/1", metadata, Some(json!({ "peer": peer })));
                black_box(outcome.is_ok());
            }
            black_box(store.len())
        })
    });
}

criterion_group!(benches, bench_history_merge, bench_descendant_chain, bench_conflict_growth);
criterion_main!(benches);
