//! Store and blob benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::json;

use revdb_core::{Attachment, NewRevision};
use revdb_testkit::fixtures::{payload, props, TestDb};
use revdb_testkit::scenarios::numbered_docs;

fn bench_put_revision(c: &mut Criterion) {
    let db = TestDb::new();
    let mut n = 0u64;
    c.bench_function("put_revision", |b| {
        b.iter(|| {
            n += 1;
            db.put(&format!("doc{n}"), props(json!({ "n": n, "title": "benchmark" })))
        })
    });
}

fn bench_changes_since(c: &mut Criterion) {
    let db = TestDb::new();
    numbered_docs(&db, 500);
    c.bench_function("changes_since_500", |b| {
        b.iter(|| {
            db.in_transaction(|txn| txn.changes_since(black_box(0), Some(100)))
                .map(|changes| changes.len())
        })
    });
}

fn bench_attachment_store(c: &mut Criterion) {
    let bytes = payload(7, 64 * 1024);
    c.bench_function("put_with_64k_attachment", |b| {
        b.iter_batched(
            TestDb::new,
            |db| {
                db.put_new(
                    NewRevision::new("photo", props(json!({})))
                        .with_attachment(Attachment::inline("img", "image/png", bytes.clone())),
                    None,
                )
            },
            BatchSize::PerIteration,
        )
    });
}

async fn push_all(count: usize) {
    let pair = revdb_testkit::ReplicationPair::new();
    numbered_docs(&pair.local, count);
    pair.start(pair.push_config()).wait_until_stopped().await;
}

fn bench_push(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("push_200_docs", |b| {
        b.iter(|| runtime.block_on(push_all(black_box(200))))
    });
}

criterion_group!(
    benches,
    bench_put_revision,
    bench_changes_since,
    bench_attachment_store,
    bench_push
);
criterion_main!(benches);
