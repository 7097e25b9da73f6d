//! Benchmarks for the device hot paths.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;

use zram_plus::backing::batcher::WritebackBatcher;
use zram_plus::backing::store::MemBackingStore;
use zram_plus::config::Config;
use zram_plus::table::compressor::{PageCompressor, ZstdCompressor};
use zram_plus::table::lru::LruList;
use zram_plus::{WritebackMode, Zram, PAGE_SIZE};

fn text_page(seed: u8) -> Vec<u8> {
    (0..PAGE_SIZE)
        .map(|i| b'a' + ((i / 64) as u8).wrapping_add(seed) % 26)
        .collect()
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_compression(c: &mut Criterion) {
    let compressor = ZstdCompressor::new(1);
    let page = text_page(3);
    let compressed = compressor.compress(&page).unwrap();
    let mut out = vec![0u8; PAGE_SIZE];

    c.bench_function("zstd_compress_page", |b| {
        b.iter(|| black_box(compressor.compress(black_box(&page)).unwrap()))
    });
    c.bench_function("zstd_decompress_page", |b| {
        b.iter(|| compressor.decompress(black_box(&compressed), &mut out).unwrap())
    });
}

fn bench_write_read(c: &mut Criterion) {
    let rt = runtime();
    let zram = rt.block_on(async {
        let zram = Zram::new(Config::default()).unwrap();
        zram.set_disksize(1024 * PAGE_SIZE as u64).await.unwrap();
        zram
    });
    let pages: Vec<Vec<u8>> = (0..16).map(text_page).collect();
    let mut buf = vec![0u8; PAGE_SIZE];

    c.bench_function("write_page", |b| {
        let mut i = 0u32;
        b.iter(|| {
            rt.block_on(zram.write(i % 1024, 0, &pages[(i % 16) as usize]))
                .unwrap();
            i = i.wrapping_add(1);
        })
    });
    c.bench_function("read_resident_page", |b| {
        let mut i = 0u32;
        b.iter(|| {
            rt.block_on(zram.read(i % 1024, 0, &mut buf)).unwrap();
            i = i.wrapping_add(1);
        })
    });
}

fn bench_writeback_cycle(c: &mut Criterion) {
    let rt = runtime();
    c.bench_function("writeback_and_restore_256_pages", |b| {
        b.iter(|| {
            rt.block_on(async {
                let zram = Zram::new(Config::default()).unwrap();
                zram.attach_backing(Arc::new(MemBackingStore::new(1024)))
                    .await
                    .unwrap();
                zram.set_disksize(256 * PAGE_SIZE as u64).await.unwrap();
                for i in 0..256u32 {
                    zram.write(i, 0, &text_page(i as u8)).await.unwrap();
                }
                let summary = zram.writeback(WritebackMode::All).await.unwrap();
                let mut buf = vec![0u8; PAGE_SIZE];
                for i in 0..256u32 {
                    zram.read(i, 0, &mut buf).await.unwrap();
                }
                zram.reset().await.unwrap();
                black_box(summary);
            })
        })
    });
}

fn bench_batcher(c: &mut Criterion) {
    let payloads: Vec<Vec<u8>> = (0..2048).map(|i| vec![i as u8; 200 + i % 300]).collect();

    c.bench_function("batch_2048_payloads", |b| {
        b.iter(|| {
            let mut batcher = WritebackBatcher::new();
            let mut items = 0;
            for (i, payload) in payloads.iter().enumerate() {
                if batcher.push(i as u32, i as u64, payload).is_some() {
                    items += 1;
                }
            }
            if batcher.flush().is_some() {
                items += 1;
            }
            black_box(items)
        })
    });
}

fn bench_lru(c: &mut Criterion) {
    let mut lru = LruList::new(65_536);
    for i in 0..65_536 {
        lru.touch(i);
    }

    c.bench_function("lru_touch_and_coldest", |b| {
        let mut i = 0u32;
        b.iter(|| {
            lru.touch(i % 65_536);
            i = i.wrapping_add(7919);
            black_box(lru.coldest(64))
        })
    });
}

criterion_group!(
    benches,
    bench_compression,
    bench_write_read,
    bench_writeback_cycle,
    bench_batcher,
    bench_lru
);
criterion_main!(benches);
