//! Benchmarks for stratakv storage operations

use std::time::Duration;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};
use tempfile::TempDir;
use uuid::Uuid;

use stratakv::{Config, RepoManager, Update};

fn bench_repo(dir: &TempDir) -> RepoManager {
    let config = Config::builder()
        .data_dir(dir.path())
        .durable(true)
        .write_delay(Duration::from_secs(3600))
        .merge_delay(Duration::from_secs(3600))
        .layer_cleaning_interval(Duration::from_secs(3600))
        .build();
    RepoManager::open(config, Uuid::new_v4()).unwrap()
}

fn write_throughput(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let repo = bench_repo(&dir);
    let payload = Bytes::from(vec![0u8; 256]);

    c.bench_function("apply_single_key", |b| {
        b.iter(|| {
            repo.apply(Update::put(Uuid::new_v4(), u64::MAX, payload.clone()))
                .unwrap()
        })
    });
}

fn memory_read_throughput(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let repo = bench_repo(&dir);
    let ids: Vec<Uuid> = (0..1000).map(|_| Uuid::new_v4()).collect();
    for id in &ids {
        repo.apply(Update::put(*id, u64::MAX, Bytes::from(vec![0u8; 256])))
            .unwrap();
    }

    let view = repo.new_view();
    let mut cursor = 0usize;
    c.bench_function("load_from_memory_layer", |b| {
        b.iter(|| {
            cursor = (cursor + 1) % ids.len();
            view.load(&ids[cursor]).unwrap()
        })
    });
}

fn disk_read_throughput(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let repo = bench_repo(&dir);
    let ids: Vec<Uuid> = (0..1000).map(|_| Uuid::new_v4()).collect();
    for id in &ids {
        repo.apply(Update::put(*id, u64::MAX, Bytes::from(vec![0u8; 256])))
            .unwrap();
    }
    repo.flush().unwrap();

    let view = repo.new_view();
    let mut cursor = 0usize;
    c.bench_function("load_from_sorted_file", |b| {
        b.iter(|| {
            cursor = (cursor + 1) % ids.len();
            view.load(&ids[cursor]).unwrap()
        })
    });
}

criterion_group!(
    benches,
    write_throughput,
    memory_read_throughput,
    disk_read_throughput
);
criterion_main!(benches);
