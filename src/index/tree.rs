//! Generic two-level ordered paged tree.
//!
//! Info pages hold `{count, pageno, level, max}` entries; data pages hold the
//! sorted units of one table. A parent entry's `level` is the level of the
//! page it points at, so `level == 0` entries point at data pages. The root is
//! always an info entry and the first info page is bounded by synthetic
//! `Left`/`Right` sentinels, so descending never meets an open interval.
//!
//! Tables plug in through [`TreeLayout`]: the unit codec, how a batch of
//! sorted items merges into a leaf, and where a leaf may be cut.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use bytes::{Buf, BufMut};
use parking_lot::RwLock;
use tracing::{debug, error};
use crate::core::error::{Error, Result};
use crate::storage::header::TreeState;
use crate::storage::page_cache::{PageKey, PageKind};
use crate::storage::page_store::PageStore;

const TREE_SECTOR: u16 = 0;

pub trait TreeLayout: Send + Sync {
    type Key: Clone + fmt::Debug + Send + Sync;
    type Unit: Clone + fmt::Debug + Send + Sync;
    type Item;

    const NAME: &'static str;
    const DATA_KIND: PageKind;
    const INFO_KIND: PageKind;
    const KEY_SIZE: usize;
    const UNIT_SIZE: usize;

    fn encode_key(&self, key: &Self::Key, out: &mut [u8]);
    fn decode_key(&self, buf: &[u8]) -> Self::Key;
    fn encode_unit(&self, unit: &Self::Unit, out: &mut [u8]);
    fn decode_unit(&self, buf: &[u8]) -> Self::Unit;

    fn compare_key(&self, a: &Self::Key, b: &Self::Key) -> Result<Ordering>;
    fn compare_item(&self, item: &Self::Item, key: &Self::Key) -> Result<Ordering>;

    /// Merge sorted `items` into the units of one leaf.
    fn merge(&self, old: Vec<Self::Unit>, items: &mut [Self::Item]) -> Result<Vec<Self::Unit>>;

    /// Largest key stored in a run of units.
    fn max_key(&self, units: &[Self::Unit]) -> Result<Self::Key>;

    /// Units kept free below the page limit when choosing a split size.
    fn split_headroom(&self) -> usize {
        1
    }

    /// Move a proposed cut in `(start, pos]` so it does not separate framed units.
    fn split_boundary(&self, _units: &[Self::Unit], _start: usize, pos: usize) -> usize {
        pos
    }
}

/// Upper bound of an info entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaxKey<K> {
    Left,
    Key(K),
    Right,
}

const FLAG_KEY: u8 = 0;
const FLAG_LEFT: u8 = 1;
const FLAG_RIGHT: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoEntry<K> {
    pub count: u32,
    pub pageno: u32,
    pub level: u32,
    pub max: MaxKey<K>,
}

impl<K> InfoEntry<K> {
    fn with_count(&self, count: usize) -> Self
    where
        K: Clone,
    {
        InfoEntry { count: count as u32, ..self.clone() }
    }
}

/// A leaf entry and where it sits in its parent info page.
#[derive(Debug, Clone)]
pub struct LeafRef<K> {
    pub entry: InfoEntry<K>,
    pub parent_pageno: u32,
    pub parent_index: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub depth: u32,
    pub leaves: usize,
    pub info_pages: usize,
    pub units: usize,
    pub max_leaf_fill: usize,
    pub max_info_fill: usize,
    pub data_limit: usize,
    pub info_limit: usize,
}

pub struct OrderedPagedTree<L: TreeLayout> {
    layout: L,
    store: Arc<PageStore>,
    root: RwLock<InfoEntry<L::Key>>,
    next_data: AtomicU32,
    next_info: AtomicU32,
    data_limit: usize,
    info_limit: usize,
}

impl<L: TreeLayout> OrderedPagedTree<L> {
    fn entry_size() -> usize {
        13 + L::KEY_SIZE
    }

    fn limits(store: &PageStore, layout: &L) -> Result<(usize, usize)> {
        let page_size = store.page_size();
        let data_limit = page_size / L::UNIT_SIZE;
        let info_limit = page_size / Self::entry_size();
        if info_limit < 3 || data_limit < layout.split_headroom() + 2 {
            return Err(Error::state(format!(
                "{} page size {} is too small for its records",
                L::NAME,
                page_size
            )));
        }
        Ok((data_limit, info_limit))
    }

    /// Initialise an empty tree: one info page of sentinels over one data page.
    pub fn create(layout: L, store: Arc<PageStore>) -> Result<Self> {
        let (data_limit, info_limit) = Self::limits(&store, &layout)?;
        let tree = OrderedPagedTree {
            layout,
            store,
            root: RwLock::new(InfoEntry { count: 2, pageno: 0, level: 1, max: MaxKey::Right }),
            next_data: AtomicU32::new(1),
            next_info: AtomicU32::new(1),
            data_limit,
            info_limit,
        };

        let sentinels = [
            InfoEntry { count: 0, pageno: 0, level: 0, max: MaxKey::Left },
            InfoEntry { count: 0, pageno: 0, level: 0, max: MaxKey::Right },
        ];
        tree.store.add_page(tree.info_key(0), &tree.encode_entries(&sentinels))?;
        tree.store.add_page(tree.data_key(0), &[])?;
        debug!(table = L::NAME, data_limit, info_limit, "created tree");
        Ok(tree)
    }

    pub fn open(layout: L, store: Arc<PageStore>, state: &TreeState) -> Result<Self> {
        let (data_limit, info_limit) = Self::limits(&store, &layout)?;
        if state.root.len() != Self::entry_size() {
            return Err(Error::corrupt(format!("{} root entry has the wrong size", L::NAME)));
        }
        let root = Self::decode_entry(&layout, &state.root)?;
        Ok(OrderedPagedTree {
            layout,
            store,
            root: RwLock::new(root),
            next_data: AtomicU32::new(state.next_data),
            next_info: AtomicU32::new(state.next_info),
            data_limit,
            info_limit,
        })
    }

    pub fn state(&self) -> TreeState {
        let mut root = vec![0u8; Self::entry_size()];
        self.encode_entry(&self.root.read(), &mut root);
        TreeState {
            root,
            next_data: self.next_data.load(AtomicOrdering::Acquire),
            next_info: self.next_info.load(AtomicOrdering::Acquire),
        }
    }

    pub fn layout(&self) -> &L {
        &self.layout
    }

    pub fn store(&self) -> &Arc<PageStore> {
        &self.store
    }

    pub fn data_limit(&self) -> usize {
        self.data_limit
    }

    pub fn info_limit(&self) -> usize {
        self.info_limit
    }

    /// Data pages allocated so far.
    pub fn data_pages(&self) -> u32 {
        self.next_data.load(AtomicOrdering::Acquire)
    }

    pub fn root(&self) -> InfoEntry<L::Key> {
        self.root.read().clone()
    }

    fn data_key(&self, pageno: u32) -> PageKey {
        PageKey::new(L::DATA_KIND, TREE_SECTOR, pageno)
    }

    fn info_key(&self, pageno: u32) -> PageKey {
        PageKey::new(L::INFO_KIND, TREE_SECTOR, pageno)
    }

    fn encode_entry(&self, entry: &InfoEntry<L::Key>, mut out: &mut [u8]) {
        out.put_u32_le(entry.count);
        out.put_u32_le(entry.pageno);
        out.put_u32_le(entry.level);
        match &entry.max {
            MaxKey::Left => out.put_u8(FLAG_LEFT),
            MaxKey::Right => out.put_u8(FLAG_RIGHT),
            MaxKey::Key(key) => {
                out.put_u8(FLAG_KEY);
                self.layout.encode_key(key, &mut out[..L::KEY_SIZE]);
            }
        }
    }

    fn decode_entry(layout: &L, mut buf: &[u8]) -> Result<InfoEntry<L::Key>> {
        let count = buf.get_u32_le();
        let pageno = buf.get_u32_le();
        let level = buf.get_u32_le();
        let max = match buf.get_u8() {
            FLAG_LEFT => MaxKey::Left,
            FLAG_RIGHT => MaxKey::Right,
            FLAG_KEY => MaxKey::Key(layout.decode_key(&buf[..L::KEY_SIZE])),
            flag => return Err(Error::corrupt(format!("{} info entry has flag {}", L::NAME, flag))),
        };
        Ok(InfoEntry { count, pageno, level, max })
    }

    fn encode_entries(&self, entries: &[InfoEntry<L::Key>]) -> Vec<u8> {
        let size = Self::entry_size();
        let mut buf = vec![0u8; entries.len() * size];
        for (i, entry) in entries.iter().enumerate() {
            self.encode_entry(entry, &mut buf[i * size..(i + 1) * size]);
        }
        buf
    }

    fn encode_units(&self, units: &[L::Unit]) -> Vec<u8> {
        let mut buf = vec![0u8; units.len() * L::UNIT_SIZE];
        for (i, unit) in units.iter().enumerate() {
            self.layout.encode_unit(unit, &mut buf[i * L::UNIT_SIZE..(i + 1) * L::UNIT_SIZE]);
        }
        buf
    }

    pub fn read_entries(&self, entry: &InfoEntry<L::Key>) -> Result<Vec<InfoEntry<L::Key>>> {
        let count = entry.count as usize;
        if count > self.info_limit {
            return Err(Error::corrupt(format!(
                "{} info page {} claims {} entries",
                L::NAME,
                entry.pageno,
                count
            )));
        }
        let size = Self::entry_size();
        self.store.read_page(self.info_key(entry.pageno), |buf| {
            (0..count)
                .map(|i| Self::decode_entry(&self.layout, &buf[i * size..(i + 1) * size]))
                .collect::<Result<Vec<_>>>()
        })?
    }

    /// Units `range` of one leaf.
    pub fn read_unit_range(&self, entry: &InfoEntry<L::Key>, range: std::ops::Range<usize>) -> Result<Vec<L::Unit>> {
        if range.end > entry.count as usize || range.start > range.end {
            return Err(Error::invalid_address(format!(
                "{} range {:?} is outside data page {}",
                L::NAME,
                range,
                entry.pageno
            )));
        }
        self.store.read_page(self.data_key(entry.pageno), |buf| {
            range
                .map(|i| self.layout.decode_unit(&buf[i * L::UNIT_SIZE..(i + 1) * L::UNIT_SIZE]))
                .collect()
        })
    }

    pub fn read_units(&self, entry: &InfoEntry<L::Key>) -> Result<Vec<L::Unit>> {
        let count = entry.count as usize;
        if count > self.data_limit {
            return Err(Error::corrupt(format!(
                "{} data page {} claims {} units",
                L::NAME,
                entry.pageno,
                count
            )));
        }
        self.store.read_page(self.data_key(entry.pageno), |buf| {
            (0..count)
                .map(|i| self.layout.decode_unit(&buf[i * L::UNIT_SIZE..(i + 1) * L::UNIT_SIZE]))
                .collect()
        })
    }

    /// Number of leading `items` that belong under `max`.
    fn partition(&self, items: &[L::Item], max: &MaxKey<L::Key>) -> Result<usize> {
        let bound = match max {
            MaxKey::Left => return Ok(0),
            MaxKey::Right => return Ok(items.len()),
            MaxKey::Key(bound) => bound,
        };
        let (mut lo, mut hi) = (0, items.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.layout.compare_item(&items[mid], bound)? == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }

    /// Merge a batch of items sorted in key order.
    pub fn insert(&self, items: &mut [L::Item]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let root = self.root();
        let mut parts = self.insert_info(&root, items)?;
        let mut level = root.level;
        while parts.len() > 1 {
            level += 1;
            let pageno = self.next_info.fetch_add(1, AtomicOrdering::AcqRel);
            self.store.add_page(self.info_key(pageno), &[])?;
            let wrapper = InfoEntry { count: 0, pageno, level, max: MaxKey::Right };
            parts = self.store_entries(&wrapper, parts)?;
            debug!(table = L::NAME, level, pageno, "tree grew a level");
        }
        if let Some(new_root) = parts.pop() {
            *self.root.write() = new_root;
        }
        Ok(())
    }

    fn insert_node(&self, entry: &InfoEntry<L::Key>, items: &mut [L::Item]) -> Result<Vec<InfoEntry<L::Key>>> {
        if entry.level == 0 {
            let old = self.read_units(entry)?;
            let merged = self.layout.merge(old, items)?;
            self.store_units(entry, merged)
        } else {
            self.insert_info(entry, items)
        }
    }

    fn insert_info(&self, entry: &InfoEntry<L::Key>, items: &mut [L::Item]) -> Result<Vec<InfoEntry<L::Key>>> {
        let children = self.read_entries(entry)?;
        let mut out = Vec::with_capacity(children.len() + 1);
        let mut start = 0;
        for child in children {
            let end = start + self.partition(&items[start..], &child.max)?;
            if end == start {
                out.push(child);
                continue;
            }
            match self.insert_node(&child, &mut items[start..end]) {
                Ok(parts) => out.extend(parts),
                Err(err) => {
                    // The subtree keeps its previous contents; these items are dropped.
                    error!(
                        table = L::NAME,
                        pageno = child.pageno,
                        level = child.level,
                        dropped = end - start,
                        error = %err,
                        "subtree insert failed"
                    );
                    out.push(child);
                }
            }
            start = end;
        }
        self.store_entries(entry, out)
    }

    fn split_size(total: usize, limit: usize, headroom: usize) -> usize {
        let cap = limit.saturating_sub(headroom).max(1);
        let mut i = 2;
        while total.div_ceil(i) > cap {
            i += 1;
        }
        total.div_ceil(i)
    }

    fn store_units(&self, entry: &InfoEntry<L::Key>, units: Vec<L::Unit>) -> Result<Vec<InfoEntry<L::Key>>> {
        if units.is_empty() {
            if matches!(entry.max, MaxKey::Right) {
                return Ok(vec![entry.with_count(0)]);
            }
            return Ok(Vec::new());
        }

        if units.len() <= self.data_limit {
            let bytes = self.encode_units(&units);
            self.write_page(self.data_key(entry.pageno), &bytes)?;
            return Ok(vec![entry.with_count(units.len())]);
        }

        let n = units.len();
        let split_pos = Self::split_size(n, self.data_limit, self.layout.split_headroom());
        let mut cuts = Vec::new();
        let mut start = 0;
        while n - start > split_pos {
            let cut = self.layout.split_boundary(&units, start, start + split_pos);
            if cut <= start || cut > start + split_pos {
                return Err(Error::corrupt(format!(
                    "{} failed to split data page {} at {}",
                    L::NAME,
                    entry.pageno,
                    start + split_pos
                )));
            }
            cuts.push(start..cut);
            start = cut;
        }
        cuts.push(start..n);

        let last = cuts.len() - 1;
        let mut parts = Vec::with_capacity(cuts.len());
        for (i, range) in cuts.into_iter().enumerate() {
            let chunk = &units[range];
            let bytes = self.encode_units(chunk);
            let pageno = if i == 0 {
                self.write_page(self.data_key(entry.pageno), &bytes)?;
                entry.pageno
            } else {
                let pageno = self.next_data.fetch_add(1, AtomicOrdering::AcqRel);
                self.store.add_page(self.data_key(pageno), &bytes)?;
                pageno
            };
            let max = if i == last {
                entry.max.clone()
            } else {
                MaxKey::Key(self.layout.max_key(chunk)?)
            };
            parts.push(InfoEntry { count: chunk.len() as u32, pageno, level: 0, max });
        }
        debug!(table = L::NAME, pageno = entry.pageno, pages = parts.len(), "split data page");
        Ok(parts)
    }

    fn store_entries(
        &self,
        entry: &InfoEntry<L::Key>,
        entries: Vec<InfoEntry<L::Key>>,
    ) -> Result<Vec<InfoEntry<L::Key>>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        if entries.len() <= self.info_limit {
            let bytes = self.encode_entries(&entries);
            self.write_page(self.info_key(entry.pageno), &bytes)?;
            return Ok(vec![entry.with_count(entries.len())]);
        }

        let split_pos = Self::split_size(entries.len(), self.info_limit, 1);
        let chunks: Vec<&[InfoEntry<L::Key>]> = entries.chunks(split_pos).collect();
        let last = chunks.len() - 1;
        let mut parts = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.into_iter().enumerate() {
            let bytes = self.encode_entries(chunk);
            let pageno = if i == 0 {
                self.write_page(self.info_key(entry.pageno), &bytes)?;
                entry.pageno
            } else {
                let pageno = self.next_info.fetch_add(1, AtomicOrdering::AcqRel);
                self.store.add_page(self.info_key(pageno), &bytes)?;
                pageno
            };
            let max = match (i == last, chunk.last()) {
                (false, Some(tail)) => tail.max.clone(),
                _ => entry.max.clone(),
            };
            parts.push(InfoEntry { count: chunk.len() as u32, pageno, level: entry.level, max });
        }
        debug!(table = L::NAME, pageno = entry.pageno, pages = parts.len(), "split info page");
        Ok(parts)
    }

    fn write_page(&self, key: PageKey, bytes: &[u8]) -> Result<()> {
        self.store.update_page(key, |page| {
            page[..bytes.len()].copy_from_slice(bytes);
            page[bytes.len()..].fill(0);
        })
    }

    /// Leaf whose range covers `probe`: the first child with `probe <= max`.
    pub fn find_leaf(&self, probe: &L::Key) -> Result<InfoEntry<L::Key>> {
        self.find_leaf_by(|max| self.layout.compare_key(probe, max))
    }

    /// Like [`find_leaf`](Self::find_leaf) for probes that are not stored keys.
    /// `probe(k)` orders the probe against the stored key `k`.
    pub fn find_leaf_by<F>(&self, probe: F) -> Result<InfoEntry<L::Key>>
    where
        F: Fn(&L::Key) -> Result<Ordering>,
    {
        let mut entry = self.root();
        while entry.level > 0 {
            let children = self.read_entries(&entry)?;
            let (mut lo, mut hi) = (0, children.len());
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                if Self::against_max(&probe, &children[mid].max)? == Ordering::Greater {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            entry = children
                .into_iter()
                .nth(lo)
                .ok_or_else(|| Error::corrupt(format!("{} info page has no right bound", L::NAME)))?;
        }
        Ok(entry)
    }

    fn against_max<F>(probe: &F, max: &MaxKey<L::Key>) -> Result<Ordering>
    where
        F: Fn(&L::Key) -> Result<Ordering>,
    {
        match max {
            MaxKey::Left => Ok(Ordering::Greater),
            MaxKey::Right => Ok(Ordering::Less),
            MaxKey::Key(key) => probe(key),
        }
    }

    /// Every leaf that may hold keys in `[lo, hi]`, in key order.
    pub fn collect_leaves(&self, lo: &L::Key, hi: &L::Key) -> Result<Vec<LeafRef<L::Key>>> {
        self.collect_leaves_by(
            |max| self.layout.compare_key(lo, max),
            |max| self.layout.compare_key(hi, max),
        )
    }

    /// Range form of [`find_leaf_by`](Self::find_leaf_by).
    pub fn collect_leaves_by<F, G>(&self, lo: F, hi: G) -> Result<Vec<LeafRef<L::Key>>>
    where
        F: Fn(&L::Key) -> Result<Ordering>,
        G: Fn(&L::Key) -> Result<Ordering>,
    {
        let mut out = Vec::new();
        self.collect_from(&self.root(), &lo, &hi, &mut out)?;
        Ok(out)
    }

    fn collect_from<F, G>(
        &self,
        entry: &InfoEntry<L::Key>,
        lo: &F,
        hi: &G,
        out: &mut Vec<LeafRef<L::Key>>,
    ) -> Result<()>
    where
        F: Fn(&L::Key) -> Result<Ordering>,
        G: Fn(&L::Key) -> Result<Ordering>,
    {
        let children = self.read_entries(entry)?;
        for (i, child) in children.iter().enumerate() {
            if Self::against_max(lo, &child.max)? == Ordering::Greater {
                continue;
            }
            if i > 0 && Self::against_max(hi, &children[i - 1].max)? == Ordering::Less {
                break;
            }
            if child.level == 0 {
                out.push(LeafRef {
                    entry: child.clone(),
                    parent_pageno: entry.pageno,
                    parent_index: i,
                });
            } else {
                self.collect_from(child, lo, hi, out)?;
            }
        }
        Ok(())
    }

    /// Rewrite one leaf in place after units were excised. No rebalancing.
    pub fn rewrite_leaf(&self, leaf: &LeafRef<L::Key>, units: &[L::Unit]) -> Result<()> {
        if units.len() > self.data_limit {
            return Err(Error::state(format!("{} rewrite would overflow a leaf", L::NAME)));
        }
        self.write_page(self.data_key(leaf.entry.pageno), &self.encode_units(units))?;
        let updated = leaf.entry.with_count(units.len());
        let size = Self::entry_size();
        let mut bytes = vec![0u8; size];
        self.encode_entry(&updated, &mut bytes);
        let offset = leaf.parent_index * size;
        self.store.update_page(self.info_key(leaf.parent_pageno), |page| {
            page[offset..offset + size].copy_from_slice(&bytes);
        })
    }

    /// Leaf entries in key order.
    pub fn leaves(&self) -> Result<Vec<InfoEntry<L::Key>>> {
        let mut out = Vec::new();
        self.walk(&self.root(), &mut |entry, _| {
            if entry.level == 0 {
                out.push(entry.clone());
            }
        })?;
        Ok(out)
    }

    /// Every stored unit, leaf by leaf.
    pub fn units(&self) -> Result<Vec<L::Unit>> {
        let mut units = Vec::new();
        for leaf in self.leaves()? {
            units.extend(self.read_units(&leaf)?);
        }
        Ok(units)
    }

    pub fn stats(&self) -> Result<TreeStats> {
        let root = self.root();
        let mut stats = TreeStats {
            depth: root.level + 1,
            data_limit: self.data_limit,
            info_limit: self.info_limit,
            ..TreeStats::default()
        };
        self.walk(&root, &mut |entry, _| {
            if entry.level == 0 {
                stats.leaves += 1;
                stats.units += entry.count as usize;
                stats.max_leaf_fill = stats.max_leaf_fill.max(entry.count as usize);
            } else {
                stats.info_pages += 1;
                stats.max_info_fill = stats.max_info_fill.max(entry.count as usize);
            }
        })?;
        stats.info_pages += 1;
        stats.max_info_fill = stats.max_info_fill.max(root.count as usize);
        Ok(stats)
    }

    fn walk(&self, entry: &InfoEntry<L::Key>, visit: &mut dyn FnMut(&InfoEntry<L::Key>, usize)) -> Result<()> {
        for (i, child) in self.read_entries(entry)?.iter().enumerate() {
            if matches!(child.max, MaxKey::Left) {
                continue;
            }
            visit(child, i);
            if child.level > 0 {
                self.walk(child, visit)?;
            }
        }
        Ok(())
    }
}
