use criterion::{Criterion, criterion_group, criterion_main};
use record_store::{AddGuard, Consistency, InMemoryRecordStore, RecordKey, RecordStore, Version};

fn bench_put_then_get(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("record_store/put_then_get", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryRecordStore::new();
                let key = RecordKey::new("inventory", "KEYBD-01");
                store
                    .put_if_absent(&key, serde_json::json!({"available": 10}), None)
                    .await
                    .unwrap();
                store.get(&key, Consistency::Strong).await.unwrap();
            });
        });
    });
}

fn bench_guarded_add(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("record_store/guarded_add", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryRecordStore::new();
                let key = RecordKey::new("inventory", "KEYBD-01");
                store
                    .put_if_absent(&key, serde_json::json!({"available": 1_000_000}), None)
                    .await
                    .unwrap();
                for _ in 0..100 {
                    store
                        .add(&key, "available", -1, AddGuard::ResultNonNegative)
                        .await
                        .unwrap();
                }
            });
        });
    });
}

fn bench_compare_and_set_chain(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("record_store/compare_and_set_chain", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryRecordStore::new();
                let key = RecordKey::with_sort("orders", "o-1", "META");
                store
                    .put_if_absent(&key, serde_json::json!({"status": "PENDING"}), None)
                    .await
                    .unwrap();
                let mut version = Version::first();
                for status in ["STOCK_RESERVED", "PAYMENT_CHARGED", "CONFIRMED"] {
                    version = store
                        .compare_and_set(&key, version, serde_json::json!({"status": status}))
                        .await
                        .unwrap();
                }
            });
        });
    });
}

criterion_group!(
    benches,
    bench_put_then_get,
    bench_guarded_add,
    bench_compare_and_set_chain
);
criterion_main!(benches);
