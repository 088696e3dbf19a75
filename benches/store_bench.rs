//! Benchmarks for the tsvault index and store
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::tempdir;
use tsvault::storage::JournalSyncMode;
use tsvault::{
    BLinkTree, DataType, IndexEntry, Key, KeyMatcher, Lsn, Samples, Store, StoreConfig,
    TimeSeries, TxId,
};

fn entry(i: u64) -> IndexEntry {
    IndexEntry {
        file_id: i % 16,
        offset: i,
        length: 1,
        size: 512,
        data_type: DataType::Float,
        checksum: 0,
        last_writer: TxId(1),
        commit_lsn: Lsn(i),
    }
}

fn flux_key(i: u64) -> Key {
    Key::new(format!("/pa/flux/{}/{}", i % 84, i)).unwrap()
}

fn bench_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("index");

    for size in [1_000u64, 10_000] {
        group.throughput(Throughput::Elements(size));

        group.bench_with_input(BenchmarkId::new("insert", size), &size, |b, &size| {
            b.iter(|| {
                let tree = BLinkTree::new(64);
                for i in 0..size {
                    tree.insert(flux_key(i), entry(i)).unwrap();
                }
                black_box(tree.len())
            })
        });

        let tree = BLinkTree::new(64);
        for i in 0..size {
            tree.insert(flux_key(i), entry(i)).unwrap();
        }
        let keys: Vec<Key> = (0..size).map(flux_key).collect();

        group.bench_with_input(BenchmarkId::new("lookup", size), &keys, |b, keys| {
            b.iter(|| {
                for key in keys {
                    black_box(tree.lookup(key).unwrap());
                }
            })
        });

        let matcher = KeyMatcher::new("Float@/pa/flux/[10-20]/*").unwrap();
        group.bench_with_input(BenchmarkId::new("match", size), &matcher, |b, matcher| {
            b.iter(|| {
                tree.range_scan(matcher.scan_prefix())
                    .filter(|(key, entry)| matcher.accepts(key, entry))
                    .count()
            })
        });
    }

    group.finish();
}

fn bench_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");
    let rt = tokio::runtime::Runtime::new().unwrap();

    let dir = tempdir().unwrap();
    let mut config = StoreConfig::new(dir.path());
    // Measure the store, not the disk
    config.journal.sync_mode = JournalSyncMode::None;
    config.checkpoint_interval = None;
    let store = rt.block_on(Store::open(config)).unwrap();

    group.bench_function("commit_series_100", |b| {
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            rt.block_on(async {
                let tx = store.begin().await.unwrap();
                let series = TimeSeries::dense(0, Samples::Float(vec![n as f32; 100]));
                store
                    .write_time_series(tx, &flux_key(n), series, 1)
                    .await
                    .unwrap();
                store.commit(tx).await.unwrap()
            })
        })
    });

    group.bench_function("merge_into_series", |b| {
        let key = Key::new("/pa/flux/merge/0").unwrap();
        let mut start = 0i64;
        b.iter(|| {
            start += 10;
            rt.block_on(async {
                let tx = store.begin().await.unwrap();
                let series = TimeSeries::dense(start, Samples::Float(vec![1.0; 10]));
                store.write_time_series(tx, &key, series, 2).await.unwrap();
                store.commit(tx).await.unwrap()
            })
        })
    });

    group.bench_function("read_window", |b| {
        let key = Key::new("/pa/flux/window/0").unwrap();
        rt.block_on(async {
            let tx = store.begin().await.unwrap();
            let series = TimeSeries::dense(0, Samples::Double(vec![0.5; 10_000]));
            store.write_time_series(tx, &key, series, 3).await.unwrap();
            store.commit(tx).await.unwrap();
        });
        b.iter(|| {
            rt.block_on(async {
                let tx = store.begin().await.unwrap();
                let window = store
                    .read_time_series(tx, &key, Some((4_000, 4_999)))
                    .await
                    .unwrap();
                store.commit(tx).await.unwrap();
                black_box(window)
            })
        })
    });

    group.finish();
    rt.block_on(store.close()).unwrap();
}

criterion_group!(benches, bench_index, bench_store);
criterion_main!(benches);
