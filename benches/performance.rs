//! Performance benchmarks for the save store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use storyline::{GameStateCheckpoint, ReachedDialogueData, SaveConfig, SaveStore};
use tempfile::TempDir;

fn create_store(dir: &TempDir) -> SaveStore {
    SaveStore::create(SaveConfig {
        sync_interval: 10_000,
        ..SaveConfig::new(dir.path().join("saves"))
    })
    .unwrap()
}

/// Benchmark branch lookup with varying sibling counts
fn bench_get_or_create_child(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_or_create_child");

    for siblings in [1, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("siblings", siblings),
            &siblings,
            |b, &siblings| {
                let dir = TempDir::new().unwrap();
                let mut store = create_store(&dir);
                let root = store.get_or_create_child(None, "root", 0, 0).unwrap();
                for i in 0..siblings {
                    store
                        .get_or_create_child(Some(root.offset), &format!("scene_{}", i), 0, 0)
                        .unwrap();
                }

                // Hit the last sibling, the worst case for the chain walk.
                let last = format!("scene_{}", siblings - 1);
                b.iter(|| {
                    black_box(
                        store
                            .get_or_create_child(Some(root.offset), &last, 0, 0)
                            .unwrap(),
                    )
                });
            },
        );
    }

    group.finish();
}

/// Benchmark checkpoint append and read back
fn bench_checkpoint(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let mut store = create_store(&dir);
    store.get_or_create_child(None, "start", 0, 0).unwrap();

    let mut payload = GameStateCheckpoint::new("start", 0);
    for i in 0..50 {
        payload.variables.insert(format!("var_{}", i), (i as i64).into());
    }

    c.bench_function("checkpoint_append_read", |b| {
        b.iter(|| {
            let reference = store.append_checkpoint(&payload).unwrap();
            black_box(store.get_checkpoint(reference).unwrap())
        })
    });
}

/// Benchmark reached index replay on open with varying history sizes
fn bench_reached_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("reached_replay");
    group.sample_size(20);

    for facts in [100, 1000, 5000] {
        let dir = TempDir::new().unwrap();
        let config = SaveConfig {
            sync_interval: 10_000,
            ..SaveConfig::new(dir.path().join("saves"))
        };

        {
            let mut store = SaveStore::create(config.clone()).unwrap();
            for i in 0..facts {
                let node = format!("node_{}", i % 20);
                store
                    .set_reached(ReachedDialogueData::new(node, i / 20, i as u64))
                    .unwrap();
            }
            store.close().unwrap();
        }

        group.bench_with_input(BenchmarkId::new("facts", facts), &config, |b, config| {
            b.iter(|| {
                let store = SaveStore::open(config.clone()).unwrap();
                black_box(store.stats().reached_dialogue_count);
                store.close().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_get_or_create_child,
    bench_checkpoint,
    bench_reached_replay
);
criterion_main!(benches);
