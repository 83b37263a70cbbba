use std::sync::Arc;
use std::thread;
use rand::Rng;
use typhoon::Config;
use typhoon::core::error::Result;
use typhoon::storage::layout::StorageLayout;
use typhoon::storage::page_cache::{PageKey, PageKind};
use typhoon::storage::page_store::PageStore;

const THREADS: u32 = 6;
const KEYS_PER_THREAD: u32 = 3;
const ROUNDS: u32 = 300;

fn retry<T>(mut op: impl FnMut() -> Result<T>) -> T {
    loop {
        match op() {
            Ok(value) => return value,
            Err(err) if err.is_retryable() => thread::yield_now(),
            Err(err) => panic!("page operation failed: {}", err),
        }
    }
}

/// Each thread owns a few keys; all of them compete for a cache smaller than
/// the key set, so loads evict each other's pages constantly.
#[test]
fn concurrent_load_save_evict() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config { page_size: 2048, block_size: 8, ..Config::with_path(dir.path()) };
    let layout = StorageLayout::new(dir.path(), config.page_size).unwrap();
    let store = Arc::new(PageStore::new(layout, &config));

    for pageno in 0..THREADS * KEYS_PER_THREAD {
        store.add_page(PageKey::new(PageKind::DocumentData, 0, pageno), &[0]).unwrap();
    }

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut last = [0u8; KEYS_PER_THREAD as usize];
                for round in 0..ROUNDS {
                    let k = rng.gen_range(0..KEYS_PER_THREAD);
                    let key = PageKey::new(PageKind::DocumentData, 0, t * KEYS_PER_THREAD + k);
                    let value = (round % 250 + 1) as u8;
                    retry(|| store.update_page(key, |page| page.fill(value)));
                    last[k as usize] = value;

                    let probe = rng.gen_range(0..KEYS_PER_THREAD);
                    let key = PageKey::new(PageKind::DocumentData, 0, t * KEYS_PER_THREAD + probe);
                    let (first, uniform) = retry(|| {
                        store.read_page(key, |page| (page[0], page.iter().all(|b| *b == page[0])))
                    });
                    assert_eq!(first, last[probe as usize]);
                    assert!(uniform, "torn page {:?}", key);
                }
                last
            })
        })
        .collect();

    let finals: Vec<[u8; KEYS_PER_THREAD as usize]> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    store.flush().unwrap();
    let stats = store.cache().unwrap().stats();
    assert_eq!(stats.referenced, 0);
    assert_eq!(stats.dirty, 0);
    assert!(stats.evictions > 0);

    for (t, last) in finals.iter().enumerate() {
        for (k, value) in last.iter().enumerate() {
            let key = PageKey::new(PageKind::DocumentData, 0, t as u32 * KEYS_PER_THREAD + k as u32);
            assert_eq!(store.read_page(key, |page| page[0]).unwrap(), *value);
        }
    }
}
