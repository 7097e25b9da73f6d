//! Integration tests for the device read/write/free paths.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use zram_plus::backing::store::MemBackingStore;
use zram_plus::config::Config;
use zram_plus::table::slot::{SlotFlags, SlotState};
use zram_plus::{WritebackMode, Zram, ZramError, PAGE_SIZE};

fn test_config() -> Config {
    let mut config = Config::default();
    config.ramplus.prefetch_interval_ms = 20;
    config.ramplus.lru_interval_ms = 20;
    config.ramplus.writeback_interval_ms = 20;
    config.ramplus.pool_interval_ms = 20;
    config
}

fn text_page(seed: u8) -> Vec<u8> {
    (0..PAGE_SIZE)
        .map(|i| b'a' + ((i / 96) as u8).wrapping_add(seed) % 26)
        .collect()
}

fn random_page(seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut page = vec![0u8; PAGE_SIZE];
    rng.fill(&mut page[..]);
    page
}

async fn device(nr_pages: u64, store: Option<Arc<MemBackingStore>>) -> Zram {
    let zram = Zram::new(test_config()).unwrap();
    if let Some(store) = store {
        zram.attach_backing(store).await.unwrap();
    }
    zram.set_disksize(nr_pages * PAGE_SIZE as u64).await.unwrap();
    zram
}

async fn read_back(zram: &Zram, index: u32) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    zram.read(index, 0, &mut page).await.unwrap();
    page
}

#[tokio::test]
async fn test_four_slot_lifecycle() {
    let store = Arc::new(MemBackingStore::new(256));
    let zram = device(4, Some(store)).await;

    // Zero page is stored as a same-element slot.
    zram.write(0, 0, &[0u8; PAGE_SIZE]).await.unwrap();
    let slot = zram.slot(0).await.unwrap();
    assert!(matches!(slot.state, SlotState::Same { element: 0 }));

    // Incompressible page is stored raw.
    let random = random_page(7);
    zram.write(1, 0, &random).await.unwrap();
    let slot = zram.slot(1).await.unwrap();
    assert!(slot.state.is_resident());
    assert!(slot.has(SlotFlags::HUGE));
    assert_eq!(zram.stats().huge_pages, 1);

    let summary = zram.writeback(WritebackMode::All).await.unwrap();
    assert_eq!(summary.written, 1);
    assert!(zram.slot(1).await.unwrap().state.is_written_back());
    assert!(matches!(zram.slot(0).await.unwrap().state, SlotState::Same { .. }));
    let stats = zram.stats();
    assert_eq!(stats.bd_count, 1);
    assert_eq!(stats.huge_pages, 0);

    assert_eq!(read_back(&zram, 1).await, random);
    assert_eq!(read_back(&zram, 0).await, vec![0u8; PAGE_SIZE]);
    let stats = zram.stats();
    assert_eq!(stats.bd_count, 0);
    assert_eq!(stats.bd_objcnt, 0);
    assert_eq!(stats.bd_objreads, 1);
    assert!(zram.slot(1).await.unwrap().has(SlotFlags::HUGE));
}

#[tokio::test]
async fn test_same_element_pages() {
    let zram = device(2, None).await;
    let page: Vec<u8> = std::iter::repeat(0xdead_beef_u64.to_ne_bytes())
        .take(PAGE_SIZE / 8)
        .flatten()
        .collect();
    zram.write(1, 0, &page).await.unwrap();

    assert_eq!(read_back(&zram, 1).await, page);
    let stats = zram.stats();
    assert_eq!(stats.same_pages, 1);
    assert_eq!(stats.compr_data_size, 0);
}

#[tokio::test]
async fn test_compressed_round_trip() {
    let zram = device(16, None).await;
    for i in 0..16u32 {
        zram.write(i, 0, &text_page(i as u8)).await.unwrap();
    }
    for i in 0..16u32 {
        assert_eq!(read_back(&zram, i).await, text_page(i as u8));
    }
    let stats = zram.stats();
    assert_eq!(stats.pages_stored, 16);
    assert_eq!(stats.num_writes, 16);
    assert_eq!(stats.num_reads, 16);
    assert!(stats.compr_data_size < 16 * PAGE_SIZE as u64);
    assert!(stats.max_used_bytes >= stats.compr_data_size);
}

#[tokio::test]
async fn test_partial_write_read_modify_write() {
    let mut config = test_config();
    config.device.logical_block_size = 512;
    let zram = Zram::new(config).unwrap();
    zram.set_disksize(2 * PAGE_SIZE as u64).await.unwrap();

    let base = text_page(3);
    zram.write(0, 0, &base).await.unwrap();
    zram.write(0, 1024, &[0x55u8; 512]).await.unwrap();

    let mut expected = base.clone();
    expected[1024..1536].fill(0x55);
    assert_eq!(read_back(&zram, 0).await, expected);
    assert!(zram.slot(0).await.unwrap().has(SlotFlags::PARTIAL_REPLACE));

    // Sub-page read of the modified sector.
    let mut sector = vec![0u8; 512];
    zram.read(0, 1024, &mut sector).await.unwrap();
    assert!(sector.iter().all(|&b| b == 0x55));

    // A partial write to an empty slot sees zeroes around it.
    zram.write(1, 512, &[1u8; 512]).await.unwrap();
    let page = read_back(&zram, 1).await;
    assert!(page[..512].iter().all(|&b| b == 0));
    assert!(page[512..1024].iter().all(|&b| b == 1));
}

#[tokio::test]
async fn test_invalid_requests_mutate_nothing() {
    let zram = device(2, None).await;
    let page = text_page(1);
    zram.write(0, 0, &page).await.unwrap();

    let mut buf = vec![0u8; PAGE_SIZE];
    assert!(matches!(zram.read(2, 0, &mut buf).await, Err(ZramError::InvalidIo(_))));
    assert!(matches!(zram.write(0, 512, &page[..512]).await, Err(ZramError::InvalidIo(_))));
    assert!(matches!(zram.write(5, 0, &page).await, Err(ZramError::InvalidIo(_))));
    assert!(matches!(zram.notify_free(9).await, Err(ZramError::InvalidIo(_))));

    assert_eq!(read_back(&zram, 0).await, page);
    let stats = zram.stats();
    assert_eq!(stats.invalid_io, 4);
    assert_eq!(stats.pages_stored, 1);
}

#[tokio::test]
async fn test_free_of_empty_slot_is_a_miss() {
    let zram = device(4, None).await;
    assert!(!zram.notify_free(3).await.unwrap());
    zram.write(3, 0, &text_page(2)).await.unwrap();
    assert!(zram.notify_free(3).await.unwrap());
    assert!(zram.slot(3).await.unwrap().state.is_empty());

    let stats = zram.stats();
    assert_eq!(stats.miss_free, 1);
    assert_eq!(stats.notify_free, 2);
    assert_eq!(stats.pages_stored, 0);
}

#[tokio::test]
async fn test_discard_frees_whole_pages_only() {
    let mut config = test_config();
    config.device.logical_block_size = 512;
    let zram = Zram::new(config).unwrap();
    zram.set_disksize(4 * PAGE_SIZE as u64).await.unwrap();
    for i in 0..4u32 {
        zram.write(i, 0, &text_page(i as u8)).await.unwrap();
    }
    // From the middle of page 0 to the end of page 2: pages 1 and 2.
    let pages = zram
        .discard(PAGE_SIZE as u64 / 2, PAGE_SIZE as u64 * 5 / 2)
        .await
        .unwrap();
    assert_eq!(pages, 2);
    assert!(zram.slot(0).await.unwrap().state.is_resident());
    assert!(zram.slot(1).await.unwrap().state.is_empty());
    assert!(zram.slot(2).await.unwrap().state.is_empty());
    assert!(zram.slot(3).await.unwrap().state.is_resident());
}

#[tokio::test]
async fn test_over_limit_write_is_rejected() {
    let zram = device(8, None).await;
    zram.set_mem_limit(2 * PAGE_SIZE as u64);
    zram.write(0, 0, &random_page(1)).await.unwrap();
    zram.write(1, 0, &random_page(2)).await.unwrap();

    let err = zram.write(2, 0, &random_page(3)).await.unwrap_err();
    assert!(matches!(err, ZramError::OverLimit { .. }));
    assert!(zram.slot(2).await.unwrap().state.is_empty());

    // Same-element pages need no memory and still succeed.
    zram.write(3, 0, &[0u8; PAGE_SIZE]).await.unwrap();

    let stats = zram.stats();
    assert_eq!(stats.writestall, 1);
    assert_eq!(stats.failed_writes, 1);
    assert_eq!(stats.pages_stored, 3);
}

#[tokio::test]
async fn test_failed_backing_read_keeps_slot_written_back() {
    let store = Arc::new(MemBackingStore::new(256));
    let zram = device(4, Some(store.clone())).await;
    let page = text_page(9);
    zram.write(0, 0, &page).await.unwrap();
    zram.writeback(WritebackMode::Index(0)).await.unwrap();

    store.fail_reads(true);
    let mut buf = vec![0u8; PAGE_SIZE];
    let err = zram.read(0, 0, &mut buf).await.unwrap_err();
    assert!(matches!(err, ZramError::PrefetchIoFailure { index: 0, .. }));
    let slot = zram.slot(0).await.unwrap();
    assert!(slot.state.is_written_back());
    assert!(!slot.has(SlotFlags::PREFETCHING));

    store.fail_reads(false);
    assert_eq!(read_back(&zram, 0).await, page);
    let stats = zram.stats();
    assert_eq!(stats.failed_reads, 1);
    assert_eq!(stats.prefetch_failures, 1);
}

#[tokio::test]
async fn test_failed_backing_write_reverts() {
    let store = Arc::new(MemBackingStore::new(256));
    let zram = device(4, Some(store.clone())).await;
    zram.write(0, 0, &text_page(1)).await.unwrap();
    zram.write(1, 0, &text_page(2)).await.unwrap();

    store.fail_writes(true);
    let err = zram.writeback(WritebackMode::All).await.unwrap_err();
    assert!(matches!(err, ZramError::WritebackIoFailure(_)));
    for i in 0..2 {
        let slot = zram.slot(i).await.unwrap();
        assert!(slot.state.is_resident());
        assert!(!slot.has(SlotFlags::UNDER_WRITEBACK));
    }

    // The next attempt succeeds.
    store.fail_writes(false);
    let summary = zram.writeback(WritebackMode::All).await.unwrap();
    assert_eq!(summary.written, 2);
    assert_eq!(read_back(&zram, 1).await, text_page(2));
}

#[tokio::test]
async fn test_overwrite_of_written_back_slot() {
    let store = Arc::new(MemBackingStore::new(256));
    let zram = device(4, Some(store)).await;
    zram.write(0, 0, &text_page(1)).await.unwrap();
    zram.writeback(WritebackMode::All).await.unwrap();
    assert_eq!(zram.stats().bd_count, 1);

    zram.write(0, 0, &text_page(2)).await.unwrap();
    assert!(zram.slot(0).await.unwrap().state.is_resident());
    assert_eq!(read_back(&zram, 0).await, text_page(2));
    let stats = zram.stats();
    assert_eq!(stats.bd_count, 0);
    assert_eq!(stats.bd_objcnt, 0);
}

#[tokio::test]
async fn test_idle_writeback_with_cutoff() {
    let store = Arc::new(MemBackingStore::new(256));
    let zram = device(4, Some(store)).await;
    zram.write(0, 0, &text_page(1)).await.unwrap();
    zram.write(1, 0, &random_page(4)).await.unwrap();

    assert_eq!(zram.mark_idle(Some(Duration::from_secs(3600))).await.unwrap(), 0);
    assert_eq!(zram.mark_idle(None).await.unwrap(), 2);

    let summary = zram.writeback(WritebackMode::HugeIdle).await.unwrap();
    assert_eq!(summary.written, 1);
    let huge = zram.slot(1).await.unwrap();
    assert!(huge.state.is_written_back());
    assert!(huge.has(SlotFlags::EXPIRE));
    assert!(zram.slot(0).await.unwrap().state.is_resident());
    assert_eq!(zram.stats().bd_expire, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_distinct_indices() {
    let zram = Arc::new(device(64, None).await);
    let mut tasks = Vec::new();
    for t in 0..8u32 {
        let zram = zram.clone();
        tasks.push(tokio::spawn(async move {
            for round in 0..20u8 {
                for i in (t * 8)..(t * 8 + 8) {
                    zram.write(i, 0, &text_page(round.wrapping_add(i as u8))).await.unwrap();
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for i in 0..64u32 {
        assert_eq!(read_back(&zram, i).await, text_page(19u8.wrapping_add(i as u8)));
    }
    assert_eq!(zram.stats().pages_stored, 64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_same_index_last_commit_wins() {
    let zram = Arc::new(device(1, None).await);
    let a = text_page(1);
    let b = random_page(2);
    let mut tasks = Vec::new();
    for page in [a.clone(), b.clone()] {
        let zram = zram.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..50 {
                zram.write(0, 0, &page).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let page = read_back(&zram, 0).await;
    assert!(page == a || page == b);
    let stats = zram.stats();
    assert_eq!(stats.pages_stored, 1);
    assert_eq!(stats.num_writes, 100);
}
