//! Fixed pool of page slots shared by every table of one engine.
//!
//! Slot metadata (hash chains, reference counts, lock and dirty flags,
//! generation stamps) lives behind one short-lived mutex. Page bytes live
//! in a per-slot `RwLock` so copies happen outside the metadata section.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};
use parking_lot::{Condvar, Mutex, RwLock};
use rand::Rng;
use tracing::{debug, warn};
use crate::core::error::{Error, Result};
use crate::core::types::MAX_GENERATION;

const EVICT_CANDIDATES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageKind {
    PhraseData,
    PhraseIndex,
    DocumentData,
    DocumentIndex,
    ForwardIndex,
    InvertedIndex,
    DocumentInfo,
    PhraseInfo,
    ForwardInfo,
    InvertedInfo,
}

impl PageKind {
    pub fn code(self) -> u32 {
        let n: u32 = match self {
            PageKind::PhraseData => 0x01,
            PageKind::PhraseIndex => 0x02,
            PageKind::DocumentData => 0x03,
            PageKind::DocumentIndex => 0x04,
            PageKind::ForwardIndex => 0x05,
            PageKind::InvertedIndex => 0x06,
            PageKind::DocumentInfo => 0x07,
            PageKind::PhraseInfo => 0x08,
            PageKind::ForwardInfo => 0x09,
            PageKind::InvertedInfo => 0x0A,
        };
        n << 24
    }

    /// File name stem of the page files holding this kind.
    pub fn stem(self) -> &'static str {
        match self {
            PageKind::PhraseData => "pdata",
            PageKind::PhraseIndex => "paddr",
            PageKind::DocumentData => "ddata",
            PageKind::DocumentIndex => "daddr",
            PageKind::ForwardIndex => "regindex",
            PageKind::InvertedIndex => "revindex",
            PageKind::DocumentInfo => "dinfo",
            PageKind::PhraseInfo => "pinfo",
            PageKind::ForwardInfo => "reginfo",
            PageKind::InvertedInfo => "revinfo",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub kind: PageKind,
    pub sector: u16,
    pub pageno: u32,
}

impl PageKey {
    pub fn new(kind: PageKind, sector: u16, pageno: u32) -> Self {
        PageKey { kind, sector, pageno }
    }

    fn bucket(&self, hash_size: usize) -> usize {
        let val = self.kind.code() | (self.pageno & 0x00FF_FFFF);
        ((val ^ self.sector as u32) as usize) % hash_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Where evicted dirty pages go.
pub trait PageSink {
    fn write_page(&self, key: &PageKey, data: &[u8]) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
struct Slot {
    key: Option<PageKey>,
    next: Option<usize>,
    refer: u32,
    locked: bool,
    dirty: bool,
    generation: u64,
}

struct CacheState {
    slots: Vec<Slot>,
    buckets: Vec<Option<usize>>,
    free: Vec<usize>,
    barrier: bool,
}

impl CacheState {
    fn lookup(&self, key: &PageKey, hash_size: usize) -> Option<usize> {
        let mut cursor = self.buckets[key.bucket(hash_size)];
        while let Some(idx) = cursor {
            if self.slots[idx].key.as_ref() == Some(key) {
                return Some(idx);
            }
            cursor = self.slots[idx].next;
        }
        None
    }

    fn link(&mut self, idx: usize, key: PageKey, hash_size: usize) {
        let bucket = key.bucket(hash_size);
        self.slots[idx].key = Some(key);
        self.slots[idx].next = self.buckets[bucket];
        self.buckets[bucket] = Some(idx);
    }

    fn unlink(&mut self, idx: usize, hash_size: usize) {
        let Some(key) = self.slots[idx].key else {
            return;
        };
        let bucket = key.bucket(hash_size);
        let next = self.slots[idx].next;
        if self.buckets[bucket] == Some(idx) {
            self.buckets[bucket] = next;
        } else {
            let mut cursor = self.buckets[bucket];
            while let Some(prev) = cursor {
                if self.slots[prev].next == Some(idx) {
                    self.slots[prev].next = next;
                    break;
                }
                cursor = self.slots[prev].next;
            }
        }
        self.slots[idx] = Slot::default();
    }
}

enum Victim {
    Clean(usize),
    Dirty(usize, PageKey),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub capacity: usize,
    pub used: usize,
    pub dirty: usize,
    pub referenced: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct PageCache {
    page_size: usize,
    hash_size: usize,
    lock_wait: Duration,
    state: Mutex<CacheState>,
    released: Condvar,
    data: Vec<RwLock<Vec<u8>>>,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl PageCache {
    pub fn new(block_size: usize, page_size: usize, lock_wait: Duration) -> Self {
        let block_size = block_size.max(1);
        let hash_size = block_size.saturating_sub(1).max(1);
        PageCache {
            page_size,
            hash_size,
            lock_wait,
            state: Mutex::new(CacheState {
                slots: vec![Slot::default(); block_size],
                buckets: vec![None; hash_size],
                free: (0..block_size).rev().collect(),
                barrier: false,
            }),
            released: Condvar::new(),
            data: (0..block_size).map(|_| RwLock::new(vec![0u8; page_size])).collect(),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(AtomicOrdering::Relaxed)
    }

    pub fn set_generation(&self, generation: u64) {
        self.generation.store(generation % MAX_GENERATION, AtomicOrdering::Relaxed);
    }

    /// Advance the recency counter, once per top-level request.
    pub fn next_generation(&self) -> u64 {
        let mut current = self.generation.load(AtomicOrdering::Relaxed);
        loop {
            let next = (current + 1) % MAX_GENERATION;
            match self.generation.compare_exchange_weak(
                current,
                next,
                AtomicOrdering::Relaxed,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(seen) => current = seen,
            }
        }
    }

    /// Hit-only lookup. Waits (bounded) while another holder has the slot locked.
    pub fn load(self: &Arc<Self>, key: PageKey, mode: AccessMode) -> Result<Option<PageGuard>> {
        let deadline = Instant::now() + self.lock_wait;
        let mut state = self.state.lock();
        loop {
            let Some(idx) = state.lookup(&key, self.hash_size) else {
                return Ok(None);
            };
            if state.slots[idx].locked || state.barrier {
                if self.released.wait_until(&mut state, deadline).timed_out() {
                    return Err(Error::busy(format!("page {:?} stayed locked", key)));
                }
                continue;
            }
            self.pin(&mut state.slots[idx], mode);
            self.hits.fetch_add(1, AtomicOrdering::Relaxed);
            return Ok(Some(PageGuard::new(Arc::clone(self), idx, key, mode)));
        }
    }

    /// Load a page, filling a fresh slot from `fill` on a miss.
    pub fn load_or_fill<F>(
        self: &Arc<Self>,
        key: PageKey,
        mode: AccessMode,
        sink: &dyn PageSink,
        fill: F,
    ) -> Result<PageGuard>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        self.acquire(key, mode, sink, fill, false)
    }

    /// Install fresh contents for `key`, replacing any cached copy.
    pub fn acquire_new(
        self: &Arc<Self>,
        key: PageKey,
        mode: AccessMode,
        init: &[u8],
        sink: &dyn PageSink,
    ) -> Result<PageGuard> {
        self.acquire(
            key,
            mode,
            sink,
            |buf| {
                let n = init.len().min(buf.len());
                buf[..n].copy_from_slice(&init[..n]);
                buf[n..].fill(0);
                Ok(())
            },
            true,
        )
    }

    fn acquire<F>(
        self: &Arc<Self>,
        key: PageKey,
        mode: AccessMode,
        sink: &dyn PageSink,
        fill: F,
        overwrite: bool,
    ) -> Result<PageGuard>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        let deadline = Instant::now() + self.lock_wait;
        let mut state = self.state.lock();
        let (idx, hit) = loop {
            if let Some(idx) = state.lookup(&key, self.hash_size) {
                if state.slots[idx].locked || state.barrier {
                    if self.released.wait_until(&mut state, deadline).timed_out() {
                        return Err(Error::busy(format!("page {:?} stayed locked", key)));
                    }
                    continue;
                }
                break (idx, true);
            }
            if state.barrier {
                if self.released.wait_until(&mut state, deadline).timed_out() {
                    return Err(Error::busy("page cache is closing"));
                }
                continue;
            }
            let idx = match state.free.pop() {
                Some(idx) => idx,
                None => match self.evict(&mut state)? {
                    Victim::Clean(idx) => idx,
                    Victim::Dirty(idx, victim) => {
                        // The victim stays claimed while its bytes go out.
                        drop(state);
                        let written = {
                            let data = self.data[idx].read();
                            sink.write_page(&victim, &data)
                        };
                        state = self.state.lock();
                        self.finish_eviction(&mut state, idx, written.is_ok());
                        self.released.notify_all();
                        written?;
                        debug!(?victim, "flushed dirty page on eviction");
                        continue;
                    }
                },
            };
            state.link(idx, key, self.hash_size);
            break (idx, false);
        };

        if hit && !overwrite {
            self.pin(&mut state.slots[idx], mode);
            self.hits.fetch_add(1, AtomicOrdering::Relaxed);
            return Ok(PageGuard::new(Arc::clone(self), idx, key, mode));
        }

        // Claimed for filling: nobody else touches the bytes until we unlock.
        {
            let slot = &mut state.slots[idx];
            slot.refer += 1;
            slot.locked = true;
            slot.dirty = slot.dirty && hit;
            slot.generation = self.generation();
        }
        if !hit {
            self.misses.fetch_add(1, AtomicOrdering::Relaxed);
        }
        drop(state);

        let filled = {
            let mut data = self.data[idx].write();
            fill(&mut data[..])
        };

        let mut state = self.state.lock();
        match filled {
            Ok(()) => {
                if overwrite {
                    state.slots[idx].dirty = false;
                }
                state.slots[idx].locked = mode == AccessMode::ReadWrite;
                drop(state);
                self.released.notify_all();
                Ok(PageGuard::new(Arc::clone(self), idx, key, mode))
            }
            Err(err) => {
                state.unlink(idx, self.hash_size);
                state.free.push(idx);
                drop(state);
                self.released.notify_all();
                Err(err)
            }
        }
    }

    fn pin(&self, slot: &mut Slot, mode: AccessMode) {
        slot.refer += 1;
        slot.locked = mode == AccessMode::ReadWrite;
        slot.generation = self.generation();
    }

    /// Sample unreferenced slots and pick the stalest. A clean victim is freed
    /// at once; a dirty one is claimed and left for the caller to write out.
    fn evict(&self, state: &mut CacheState) -> Result<Victim> {
        let capacity = state.slots.len();
        let current = self.generation();
        let mut rng = rand::thread_rng();
        let mut best: Option<(usize, u64)> = None;
        let mut seen = 0usize;

        for _ in 0..capacity.saturating_mul(2).max(EVICT_CANDIDATES) {
            let idx = rng.gen_range(0..capacity);
            let slot = &state.slots[idx];
            if slot.key.is_none() || slot.locked || slot.refer > 0 {
                continue;
            }
            let age = current.abs_diff(slot.generation);
            if best.is_none_or(|(_, best_age)| age > best_age) {
                best = Some((idx, age));
            }
            seen += 1;
            if seen > EVICT_CANDIDATES {
                break;
            }
        }
        if best.is_none() {
            // Sampling missed; fall back to a scan before giving up.
            best = state
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.key.is_some() && !s.locked && s.refer == 0)
                .map(|(idx, s)| (idx, current.abs_diff(s.generation)))
                .max_by_key(|(_, age)| *age);
        }

        let Some((idx, _)) = best else {
            warn!(capacity, "page cache has no evictable slot");
            return Err(Error::exhausted("no evictable page cache slot"));
        };

        let slot = &mut state.slots[idx];
        if let (Some(victim), true) = (slot.key, slot.dirty) {
            slot.refer += 1;
            slot.locked = true;
            slot.dirty = false;
            return Ok(Victim::Dirty(idx, victim));
        }
        state.unlink(idx, self.hash_size);
        self.evictions.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(Victim::Clean(idx))
    }

    /// Settle a claimed dirty victim: free it once written, keep it otherwise.
    fn finish_eviction(&self, state: &mut CacheState, idx: usize, written: bool) {
        if written {
            state.unlink(idx, self.hash_size);
            state.free.push(idx);
            self.evictions.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            let slot = &mut state.slots[idx];
            slot.refer = slot.refer.saturating_sub(1);
            slot.locked = false;
            slot.dirty = true;
        }
    }

    fn release(&self, idx: usize, mode: AccessMode, written: bool) {
        let mut state = self.state.lock();
        let slot = &mut state.slots[idx];
        if mode == AccessMode::ReadWrite {
            slot.locked = false;
            slot.dirty |= written;
        }
        slot.refer = slot.refer.saturating_sub(1);
        drop(state);
        self.released.notify_all();
    }

    /// Drop a cached page without flushing it. Returns false if it is in use.
    pub fn remove(&self, key: &PageKey) -> bool {
        let mut state = self.state.lock();
        let Some(idx) = state.lookup(key, self.hash_size) else {
            return true;
        };
        if state.slots[idx].locked || state.slots[idx].refer > 0 {
            return false;
        }
        state.unlink(idx, self.hash_size);
        state.free.push(idx);
        true
    }

    /// Shutdown barrier: waits for every slot to be released, then blocks new loads.
    pub fn lock_all(&self) -> bool {
        let deadline = Instant::now() + self.lock_wait;
        let mut state = self.state.lock();
        while state.barrier || state.slots.iter().any(|s| s.locked || s.refer > 0) {
            if self.released.wait_until(&mut state, deadline).timed_out() {
                warn!("page cache barrier not acquired, continuing best-effort");
                return false;
            }
        }
        state.barrier = true;
        true
    }

    pub fn unlock_all(&self) {
        self.state.lock().barrier = false;
        self.released.notify_all();
    }

    /// Write every dirty, unlocked page through `sink`.
    ///
    /// Each page is pinned and marked clean under the metadata lock, then
    /// written from a read guard on its bytes. A writer that pins it in the
    /// meantime marks it dirty again on release.
    pub fn flush(&self, sink: &dyn PageSink) -> Result<usize> {
        let mut written = 0;
        for idx in 0..self.data.len() {
            let key = {
                let mut state = self.state.lock();
                let slot = &mut state.slots[idx];
                match slot.key {
                    Some(key) if slot.dirty && !slot.locked => {
                        slot.refer += 1;
                        slot.dirty = false;
                        key
                    }
                    _ => continue,
                }
            };

            let result = {
                let data = self.data[idx].read();
                sink.write_page(&key, &data)
            };

            let mut state = self.state.lock();
            let slot = &mut state.slots[idx];
            slot.refer = slot.refer.saturating_sub(1);
            if result.is_err() {
                slot.dirty = true;
            }
            drop(state);
            self.released.notify_all();
            result?;
            written += 1;
        }
        Ok(written)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            capacity: state.slots.len(),
            used: state.slots.iter().filter(|s| s.key.is_some()).count(),
            dirty: state.slots.iter().filter(|s| s.dirty).count(),
            referenced: state.slots.iter().filter(|s| s.refer > 0).count(),
            hits: self.hits.load(AtomicOrdering::Relaxed),
            misses: self.misses.load(AtomicOrdering::Relaxed),
            evictions: self.evictions.load(AtomicOrdering::Relaxed),
        }
    }
}

/// Scoped hold on one cached page; released on drop.
pub struct PageGuard {
    cache: Arc<PageCache>,
    slot: usize,
    key: PageKey,
    mode: AccessMode,
    written: bool,
    released: bool,
}

impl PageGuard {
    fn new(cache: Arc<PageCache>, slot: usize, key: PageKey, mode: AccessMode) -> Self {
        PageGuard { cache, slot, key, mode, written: false, released: false }
    }

    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.cache.data[self.slot].read();
        f(&data)
    }

    pub fn write<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        if self.mode != AccessMode::ReadWrite {
            return Err(Error::state(format!("page {:?} is held read-only", self.key)));
        }
        let mut data = self.cache.data[self.slot].write();
        self.written = true;
        Ok(f(&mut data))
    }

    /// Release, marking the page dirty if it was written.
    pub fn save(mut self) {
        self.released = true;
        self.cache.release(self.slot, self.mode, self.written);
    }

    /// Release without recording writes.
    pub fn clear(mut self) {
        self.released = true;
        self.cache.release(self.slot, self.mode, false);
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if !self.released {
            self.cache.release(self.slot, self.mode, self.written);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use crate::core::error::ErrorKind;

    #[derive(Default)]
    struct MemorySink {
        pages: Mutex<HashMap<PageKey, Vec<u8>>>,
    }

    impl PageSink for MemorySink {
        fn write_page(&self, key: &PageKey, data: &[u8]) -> Result<()> {
            self.pages.lock().insert(*key, data.to_vec());
            Ok(())
        }
    }

    impl MemorySink {
        fn fill(&self, key: &PageKey, buf: &mut [u8]) -> Result<()> {
            match self.pages.lock().get(key) {
                Some(page) => buf.copy_from_slice(page),
                None => buf.fill(0),
            }
            Ok(())
        }
    }

    fn cache(slots: usize) -> Arc<PageCache> {
        Arc::new(PageCache::new(slots, 64, Duration::from_millis(20)))
    }

    fn key(pageno: u32) -> PageKey {
        PageKey::new(PageKind::DocumentData, 0, pageno)
    }

    #[test]
    fn write_then_read_hits_cache() {
        let cache = cache(4);
        let sink = MemorySink::default();
        let mut guard = cache
            .load_or_fill(key(1), AccessMode::ReadWrite, &sink, |b| sink.fill(&key(1), b))
            .unwrap();
        guard.write(|b| b[0] = 7).unwrap();
        guard.save();

        let guard = cache.load(key(1), AccessMode::ReadOnly).unwrap().unwrap();
        assert_eq!(guard.read(|b| b[0]), 7);
        drop(guard);
        assert_eq!(cache.stats().dirty, 1);
        assert!(cache.load(key(2), AccessMode::ReadOnly).unwrap().is_none());
    }

    #[test]
    fn read_only_guard_rejects_writes() {
        let cache = cache(2);
        let sink = MemorySink::default();
        let mut guard = cache
            .load_or_fill(key(1), AccessMode::ReadOnly, &sink, |b| sink.fill(&key(1), b))
            .unwrap();
        assert_eq!(guard.write(|b| b[0] = 1).unwrap_err().kind, ErrorKind::InvalidState);
    }

    #[test]
    fn eviction_flushes_dirty_pages() {
        let cache = cache(2);
        let sink = MemorySink::default();
        for pageno in 0..6u32 {
            let mut guard = cache
                .load_or_fill(key(pageno), AccessMode::ReadWrite, &sink, |b| sink.fill(&key(pageno), b))
                .unwrap();
            guard.write(|b| b[0] = pageno as u8 + 1).unwrap();
            guard.save();
            cache.next_generation();
        }
        cache.flush(&sink).unwrap();
        let pages = sink.pages.lock();
        for pageno in 0..6u32 {
            assert_eq!(pages[&key(pageno)][0], pageno as u8 + 1);
        }
        assert!(cache.stats().evictions >= 4);
    }

    #[test]
    fn exhausted_when_everything_is_held() {
        let cache = cache(2);
        let sink = MemorySink::default();
        let a = cache.load_or_fill(key(1), AccessMode::ReadOnly, &sink, |b| sink.fill(&key(1), b)).unwrap();
        let b = cache.load_or_fill(key(2), AccessMode::ReadOnly, &sink, |b| sink.fill(&key(2), b)).unwrap();
        let err = cache
            .load_or_fill(key(3), AccessMode::ReadOnly, &sink, |b| sink.fill(&key(3), b))
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::AllocationExhausted);
        drop((a, b));
        assert!(cache.load_or_fill(key(3), AccessMode::ReadOnly, &sink, |b| sink.fill(&key(3), b)).is_ok());
    }

    #[test]
    fn locked_page_times_out_as_busy() {
        let cache = cache(2);
        let sink = MemorySink::default();
        let _writer = cache
            .load_or_fill(key(1), AccessMode::ReadWrite, &sink, |b| sink.fill(&key(1), b))
            .unwrap();
        let err = cache.load(key(1), AccessMode::ReadOnly).err().unwrap();
        assert!(err.is_retryable());
    }

    #[test]
    fn failed_fill_unhashes_the_slot() {
        let cache = cache(2);
        let sink = MemorySink::default();
        let err = cache
            .load_or_fill(key(1), AccessMode::ReadOnly, &sink, |_| Err(Error::page_io("boom")))
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::PageIo);
        assert!(cache.load(key(1), AccessMode::ReadOnly).unwrap().is_none());
        assert_eq!(cache.stats().used, 0);
    }

    #[test]
    fn barrier_waits_for_holders() {
        let cache = cache(2);
        let sink = MemorySink::default();
        let guard = cache.load_or_fill(key(1), AccessMode::ReadOnly, &sink, |b| sink.fill(&key(1), b)).unwrap();
        assert!(!cache.lock_all());
        drop(guard);
        assert!(cache.lock_all());
        assert!(cache.load(key(1), AccessMode::ReadOnly).is_err());
        cache.unlock_all();
        assert!(cache.load(key(1), AccessMode::ReadOnly).unwrap().is_some());
    }

    /// Signals when a write starts, then stalls it.
    struct SlowSink {
        inner: MemorySink,
        started: std::sync::mpsc::SyncSender<()>,
        delay: Duration,
        fail: bool,
    }

    impl PageSink for SlowSink {
        fn write_page(&self, key: &PageKey, data: &[u8]) -> Result<()> {
            let _ = self.started.try_send(());
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(Error::page_io("disk full"));
            }
            self.inner.write_page(key, data)
        }
    }

    fn slow_sink(fail: bool) -> (Arc<SlowSink>, std::sync::mpsc::Receiver<()>) {
        let (started, rx) = std::sync::mpsc::sync_channel(8);
        let sink = SlowSink { inner: MemorySink::default(), started, delay: Duration::from_millis(400), fail };
        (Arc::new(sink), rx)
    }

    fn dirty(cache: &Arc<PageCache>, sink: &dyn PageSink, pageno: u32, value: u8) {
        let mut guard = cache
            .load_or_fill(key(pageno), AccessMode::ReadWrite, sink, |b| { b.fill(0); Ok(()) })
            .unwrap();
        guard.write(|b| b[0] = value).unwrap();
        guard.save();
    }

    #[test]
    fn slow_flush_does_not_block_other_pages() {
        let cache = cache(4);
        let (sink, started) = slow_sink(false);
        dirty(&cache, sink.as_ref(), 1, 9);
        dirty(&cache, sink.as_ref(), 2, 3);
        cache.flush(&MemorySink::default()).unwrap();
        dirty(&cache, sink.as_ref(), 1, 10);

        let flusher = {
            let cache = Arc::clone(&cache);
            let sink = Arc::clone(&sink);
            std::thread::spawn(move || cache.flush(sink.as_ref()))
        };
        started.recv().unwrap();
        let begin = Instant::now();
        let guard = cache.load(key(2), AccessMode::ReadOnly).unwrap().unwrap();
        assert_eq!(guard.read(|b| b[0]), 3);
        assert!(begin.elapsed() < Duration::from_millis(200));
        drop(guard);

        assert_eq!(flusher.join().unwrap().unwrap(), 1);
        assert_eq!(sink.inner.pages.lock()[&key(1)][0], 10);
        assert_eq!(cache.stats().dirty, 0);
    }

    #[test]
    fn slow_eviction_does_not_block_other_pages() {
        let cache = cache(2);
        let (sink, started) = slow_sink(false);
        dirty(&cache, sink.as_ref(), 1, 5);
        let held = cache
            .load_or_fill(key(2), AccessMode::ReadOnly, sink.as_ref(), |b| { b.fill(4); Ok(()) })
            .unwrap();

        let loader = {
            let cache = Arc::clone(&cache);
            let sink = Arc::clone(&sink);
            std::thread::spawn(move || {
                cache
                    .load_or_fill(key(3), AccessMode::ReadOnly, sink.as_ref(), |b| { b.fill(6); Ok(()) })
                    .map(|guard| guard.read(|b| b[0]))
            })
        };
        started.recv().unwrap();
        let begin = Instant::now();
        let again = cache.load(key(2), AccessMode::ReadOnly).unwrap().unwrap();
        assert_eq!(again.read(|b| b[0]), 4);
        assert!(begin.elapsed() < Duration::from_millis(200));
        drop((again, held));

        assert_eq!(loader.join().unwrap().unwrap(), 6);
        assert_eq!(sink.inner.pages.lock()[&key(1)][0], 5);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn failed_write_keeps_the_page_dirty() {
        let cache = cache(1);
        let (sink, _started) = slow_sink(true);
        dirty(&cache, sink.as_ref(), 1, 8);

        let err = cache.flush(sink.as_ref()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::PageIo);
        assert_eq!(cache.stats().dirty, 1);

        let err = cache
            .load_or_fill(key(2), AccessMode::ReadOnly, sink.as_ref(), |b| { b.fill(0); Ok(()) })
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::PageIo);
        let guard = cache.load(key(1), AccessMode::ReadOnly).unwrap().unwrap();
        assert_eq!(guard.read(|b| b[0]), 8);
        assert_eq!(cache.stats().dirty, 1);
    }

    #[test]
    fn generation_wraps() {
        let cache = cache(1);
        cache.set_generation(MAX_GENERATION - 1);
        assert_eq!(cache.next_generation(), 0);
    }
}
