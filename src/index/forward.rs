use std::cmp::Ordering;
use std::sync::Arc;
use crate::core::error::{Error, Result};
use crate::core::types::{Address, MAX_REGULAR_INDEX_BLOCK};
use crate::index::codec::{self, ForwardRun, forward};
use crate::index::tree::{OrderedPagedTree, TreeLayout, TreeStats};
use crate::storage::header::TreeState;
use crate::storage::page_cache::PageKind;
use crate::storage::page_store::PageStore;

/// The phrases of one document, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardItem {
    pub doc: Address,
    pub phrases: Vec<Address>,
}

pub struct ForwardLayout;

impl TreeLayout for ForwardLayout {
    type Key = Address;
    type Unit = u32;
    type Item = ForwardItem;

    const NAME: &'static str = "forward";
    const DATA_KIND: PageKind = PageKind::ForwardIndex;
    const INFO_KIND: PageKind = PageKind::ForwardInfo;
    const KEY_SIZE: usize = Address::ENCODED_SIZE;
    const UNIT_SIZE: usize = 4;

    fn encode_key(&self, key: &Address, out: &mut [u8]) {
        key.encode(out);
    }

    fn decode_key(&self, buf: &[u8]) -> Address {
        Address::decode(buf)
    }

    fn encode_unit(&self, unit: &u32, out: &mut [u8]) {
        out[..4].copy_from_slice(&unit.to_le_bytes());
    }

    fn decode_unit(&self, buf: &[u8]) -> u32 {
        u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
    }

    fn compare_key(&self, a: &Address, b: &Address) -> Result<Ordering> {
        Ok(a.cmp(b))
    }

    fn compare_item(&self, item: &ForwardItem, key: &Address) -> Result<Ordering> {
        Ok(item.doc.cmp(key))
    }

    /// Replace the runs of every document in `items`; an empty phrase list drops the run.
    fn merge(&self, old: Vec<u32>, items: &mut [ForwardItem]) -> Result<Vec<u32>> {
        let mut runs = forward::decode(&old)?.into_iter().peekable();
        let mut out = Vec::new();
        for item in items.iter() {
            while runs.peek().is_some_and(|r| r.doc < item.doc) {
                out.extend(runs.next());
            }
            while runs.peek().is_some_and(|r| r.doc == item.doc) {
                runs.next();
            }
            if !item.phrases.is_empty() {
                out.push(ForwardRun { doc: item.doc, phrases: item.phrases.clone() });
            }
        }
        out.extend(runs);
        forward::encode(&out)
    }

    fn max_key(&self, units: &[u32]) -> Result<Address> {
        let last = units
            .iter()
            .rposition(|w| codec::is_header_first(*w))
            .ok_or_else(|| Error::corrupt("forward run without a header"))?;
        forward::doc_at(units, last)
    }

    fn split_headroom(&self) -> usize {
        MAX_REGULAR_INDEX_BLOCK + 2
    }

    /// Cut at a header, preferring one that starts a new document.
    fn split_boundary(&self, units: &[u32], start: usize, pos: usize) -> usize {
        let mut last_header = None;
        let mut last_doc_start = None;
        let mut prev_doc = None;
        for i in start..=pos.min(units.len().saturating_sub(1)) {
            if !codec::is_header_first(units[i]) {
                continue;
            }
            let doc = forward::doc_at(units, i).ok();
            if i > start {
                last_header = Some(i);
                if doc != prev_doc {
                    last_doc_start = Some(i);
                }
            }
            prev_doc = doc;
        }
        match last_doc_start {
            Some(cut) if cut >= start + (pos - start) / 2 => cut,
            _ => last_header.unwrap_or(start),
        }
    }
}

/// Document address to the phrases it contains.
pub struct ForwardIndex {
    tree: OrderedPagedTree<ForwardLayout>,
}

impl ForwardIndex {
    pub fn create(store: Arc<PageStore>) -> Result<Self> {
        Ok(ForwardIndex { tree: OrderedPagedTree::create(ForwardLayout, store)? })
    }

    pub fn open(store: Arc<PageStore>, state: &TreeState) -> Result<Self> {
        Ok(ForwardIndex { tree: OrderedPagedTree::open(ForwardLayout, store, state)? })
    }

    pub fn state(&self) -> TreeState {
        self.tree.state()
    }

    /// Insert runs; items are sorted by document and the last duplicate wins.
    pub fn insert(&self, items: &mut Vec<ForwardItem>) -> Result<()> {
        items.sort_by_key(|item| item.doc);
        items.reverse();
        items.dedup_by_key(|item| item.doc);
        items.reverse();
        self.tree.insert(items)
    }

    pub fn find(&self, doc: Address) -> Result<Vec<Address>> {
        let mut phrases = Vec::new();
        for leaf in self.tree.collect_leaves(&doc, &doc)? {
            for run in forward::decode(&self.tree.read_units(&leaf.entry)?)? {
                if run.doc == doc {
                    phrases.extend(run.phrases);
                }
            }
        }
        Ok(phrases)
    }

    /// Excise a document's runs and return the phrases they held.
    pub fn remove(&self, doc: Address) -> Result<Vec<Address>> {
        let mut phrases = Vec::new();
        for leaf in self.tree.collect_leaves(&doc, &doc)? {
            let runs = forward::decode(&self.tree.read_units(&leaf.entry)?)?;
            if !runs.iter().any(|r| r.doc == doc) {
                continue;
            }
            let (gone, kept): (Vec<ForwardRun>, Vec<ForwardRun>) = runs.into_iter().partition(|r| r.doc == doc);
            phrases.extend(gone.into_iter().flat_map(|r| r.phrases));
            self.tree.rewrite_leaf(&leaf, &forward::encode(&kept)?)?;
        }
        Ok(phrases)
    }

    pub fn stats(&self) -> Result<TreeStats> {
        self.tree.stats()
    }
}
