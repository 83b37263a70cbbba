//! Phrase to postings index.
//!
//! Postings are kept in search order: document sector, phrase value, document
//! sort key (descending), document id (descending), position. A scan of one
//! phrase range inside one sector therefore yields hits already sorted.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use parking_lot::RwLock;
use crate::core::error::{Error, Result};
use crate::core::types::{Address, DocumentRecord, MAX_PHRASE_POS, MAX_REVERSE_INDEX_BLOCK, PhraseValue, record_order};
use crate::index::codec::{self, Posting, inverted};
use crate::index::document::DocumentHeap;
use crate::index::phrase::PhraseHeap;
use crate::index::tree::{InfoEntry, OrderedPagedTree, TreeLayout, TreeStats};
use crate::storage::header::TreeState;
use crate::storage::page_cache::PageKind;
use crate::storage::page_store::PageStore;

/// Bound key of an inverted leaf: its last posting with the record it was placed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingKey {
    pub phrase: Address,
    pub doc: Address,
    pub pos: u8,
    pub record: DocumentRecord,
}

/// A posting to add, or a `(phrase, document)` group to drop.
#[derive(Debug, Clone)]
pub struct InvertedItem {
    pub phrase: Address,
    pub value: PhraseValue,
    pub doc: Address,
    pub record: DocumentRecord,
    pub pos: u8,
    pub delete: bool,
}

impl InvertedItem {
    pub fn insert(phrase: Address, value: PhraseValue, doc: Address, record: DocumentRecord, pos: u8) -> Self {
        InvertedItem { phrase, value, doc, record, pos, delete: false }
    }

    /// Drop markers for every posting of `phrase` in `doc`. One marker sits at
    /// each end of the position range so both leaves of a group that spans a
    /// page cut receive one.
    pub fn delete_group(phrase: Address, value: PhraseValue, doc: Address, record: DocumentRecord) -> [Self; 2] {
        let low = InvertedItem { phrase, value, doc, record, pos: 0, delete: true };
        let high = InvertedItem { pos: MAX_PHRASE_POS as u8, ..low.clone() };
        [low, high]
    }

    /// Search order, deletes before inserts at equal positions.
    pub fn cmp_order(&self, other: &Self) -> Ordering {
        self.doc
            .sector
            .cmp(&other.doc.sector)
            .then_with(|| self.value.cmp(&other.value))
            .then_with(|| record_order(&self.record.sortkey, self.record.id, &other.record.sortkey, other.record.id))
            .then_with(|| self.pos.cmp(&other.pos))
            .then_with(|| other.delete.cmp(&self.delete))
    }
}

/// A posting decoded together with the values it sorts by.
#[derive(Debug, Clone)]
struct Resolved {
    posting: Posting,
    value: PhraseValue,
    record: DocumentRecord,
}

/// Contiguous words of one phrase within one leaf, starting at a header.
#[derive(Debug, Clone)]
pub struct ScanRange {
    pub phrase: Address,
    pub leaf: InfoEntry<PostingKey>,
    pub start: usize,
    pub end: usize,
    pub bodies: usize,
}

/// What the running batch changed, needed to order postings correctly.
#[derive(Default)]
struct BatchContext {
    placed: HashMap<Address, DocumentRecord>,
    inserted: HashSet<(Address, Address, u8)>,
}

pub struct InvertedLayout {
    phrases: Arc<PhraseHeap>,
    documents: Arc<DocumentHeap>,
    batch: RwLock<BatchContext>,
}

impl InvertedLayout {
    fn new(phrases: Arc<PhraseHeap>, documents: Arc<DocumentHeap>) -> Self {
        InvertedLayout { phrases, documents, batch: RwLock::new(BatchContext::default()) }
    }

    /// Record a stored posting was ordered by. Documents updated in the
    /// running batch resolve to their previous record.
    fn placed_record(&self, doc: Address) -> Result<DocumentRecord> {
        if let Some(record) = self.batch.read().placed.get(&doc) {
            return Ok(*record);
        }
        self.documents.read(doc)
    }

    /// Record of a posting in merged output: new postings sort by the current record.
    fn key_record(&self, posting: &Posting) -> Result<DocumentRecord> {
        let fresh = self
            .batch
            .read()
            .inserted
            .contains(&(posting.phrase, posting.doc, posting.pos));
        if fresh {
            self.documents.read(posting.doc)
        } else {
            self.placed_record(posting.doc)
        }
    }

    fn compare_parts(
        &self,
        (sector, value, record, pos): (u16, &PhraseValue, &DocumentRecord, u8),
        key: &PostingKey,
    ) -> Result<Ordering> {
        let ord = sector.cmp(&key.doc.sector);
        if ord != Ordering::Equal {
            return Ok(ord);
        }
        let ord = value.cmp(&self.phrases.read(key.phrase)?);
        if ord != Ordering::Equal {
            return Ok(ord);
        }
        Ok(record_order(&record.sortkey, record.id, &key.record.sortkey, key.record.id).then(pos.cmp(&key.pos)))
    }

    fn resolve(&self, postings: Vec<Posting>) -> Result<Vec<Resolved>> {
        let mut values: HashMap<Address, PhraseValue> = HashMap::new();
        let mut records: HashMap<Address, DocumentRecord> = HashMap::new();
        postings
            .into_iter()
            .map(|posting| {
                let value = match values.get(&posting.phrase) {
                    Some(v) => v.clone(),
                    None => {
                        let v = self.phrases.read(posting.phrase)?;
                        values.insert(posting.phrase, v.clone());
                        v
                    }
                };
                let record = match records.get(&posting.doc) {
                    Some(r) => *r,
                    None => {
                        let r = self.placed_record(posting.doc)?;
                        records.insert(posting.doc, r);
                        r
                    }
                };
                Ok(Resolved { posting, value, record })
            })
            .collect()
    }

    fn cmp_resolved(a: &Resolved, item: &InvertedItem) -> Ordering {
        a.posting
            .doc
            .sector
            .cmp(&item.doc.sector)
            .then_with(|| a.value.cmp(&item.value))
            .then_with(|| record_order(&a.record.sortkey, a.record.id, &item.record.sortkey, item.record.id))
            .then_with(|| a.posting.pos.cmp(&item.pos))
    }
}

impl TreeLayout for InvertedLayout {
    type Key = PostingKey;
    type Unit = u32;
    type Item = InvertedItem;

    const NAME: &'static str = "inverted";
    const DATA_KIND: PageKind = PageKind::InvertedIndex;
    const INFO_KIND: PageKind = PageKind::InvertedInfo;
    const KEY_SIZE: usize = 2 * Address::ENCODED_SIZE + 1 + DocumentRecord::ENCODED_SIZE;
    const UNIT_SIZE: usize = 4;

    fn encode_key(&self, key: &PostingKey, out: &mut [u8]) {
        const A: usize = Address::ENCODED_SIZE;
        key.phrase.encode(&mut out[..A]);
        key.doc.encode(&mut out[A..2 * A]);
        out[2 * A] = key.pos;
        key.record.encode(&mut out[2 * A + 1..]);
    }

    fn decode_key(&self, buf: &[u8]) -> PostingKey {
        const A: usize = Address::ENCODED_SIZE;
        PostingKey {
            phrase: Address::decode(&buf[..A]),
            doc: Address::decode(&buf[A..2 * A]),
            pos: buf[2 * A],
            record: DocumentRecord::decode(&buf[2 * A + 1..]),
        }
    }

    fn encode_unit(&self, unit: &u32, out: &mut [u8]) {
        out[..4].copy_from_slice(&unit.to_le_bytes());
    }

    fn decode_unit(&self, buf: &[u8]) -> u32 {
        u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
    }

    fn compare_key(&self, a: &PostingKey, b: &PostingKey) -> Result<Ordering> {
        let value = self.phrases.read(a.phrase)?;
        self.compare_parts((a.doc.sector, &value, &a.record, a.pos), b)
    }

    fn compare_item(&self, item: &InvertedItem, key: &PostingKey) -> Result<Ordering> {
        self.compare_parts((item.doc.sector, &item.value, &item.record, item.pos), key)
    }

    /// Drop deleted groups, then merge the inserts in.
    fn merge(&self, old: Vec<u32>, items: &mut [InvertedItem]) -> Result<Vec<u32>> {
        let doomed: HashSet<(Address, Address)> = items
            .iter()
            .filter(|item| item.delete)
            .map(|item| (item.phrase, item.doc))
            .collect();
        let stored: Vec<Posting> = inverted::decode(&old)?
            .into_iter()
            .filter(|p| !doomed.contains(&(p.phrase, p.doc)))
            .collect();
        let stored = self.resolve(stored)?;

        let mut out: Vec<Posting> = Vec::with_capacity(stored.len() + items.len());
        let mut stored = stored.into_iter().peekable();
        let mut last_insert: Option<&InvertedItem> = None;
        for item in items.iter().filter(|item| !item.delete) {
            while stored.peek().is_some_and(|s| Self::cmp_resolved(s, item) == Ordering::Less) {
                out.extend(stored.next().map(|s| s.posting));
            }
            if stored.peek().is_some_and(|s| Self::cmp_resolved(s, item) == Ordering::Equal) {
                continue;
            }
            if last_insert.is_some_and(|prev| prev.cmp_order(item) == Ordering::Equal) {
                continue;
            }
            out.push(Posting { phrase: item.phrase, doc: item.doc, pos: item.pos, weight: 0 });
            last_insert = Some(item);
        }
        out.extend(stored.map(|s| s.posting));
        inverted::encode(&out)
    }

    fn max_key(&self, units: &[u32]) -> Result<PostingKey> {
        let last = units
            .iter()
            .rposition(|w| codec::is_body(*w))
            .ok_or_else(|| Error::corrupt("inverted run without postings"))?;
        let posting = inverted::posting_at(units, last)?;
        Ok(PostingKey {
            phrase: posting.phrase,
            doc: posting.doc,
            pos: posting.pos,
            record: self.key_record(&posting)?,
        })
    }

    fn split_headroom(&self) -> usize {
        MAX_REVERSE_INDEX_BLOCK + 2
    }

    fn split_boundary(&self, units: &[u32], start: usize, pos: usize) -> usize {
        (start + 1..=pos.min(units.len().saturating_sub(1)))
            .rev()
            .find(|i| codec::is_header_first(units[*i]))
            .unwrap_or(start)
    }
}

/// Phrase value to `(document, position)` postings.
pub struct InvertedIndex {
    tree: OrderedPagedTree<InvertedLayout>,
}

impl InvertedIndex {
    pub fn create(store: Arc<PageStore>, phrases: Arc<PhraseHeap>, documents: Arc<DocumentHeap>) -> Result<Self> {
        let layout = InvertedLayout::new(phrases, documents);
        Ok(InvertedIndex { tree: OrderedPagedTree::create(layout, store)? })
    }

    pub fn open(
        store: Arc<PageStore>,
        phrases: Arc<PhraseHeap>,
        documents: Arc<DocumentHeap>,
        state: &TreeState,
    ) -> Result<Self> {
        let layout = InvertedLayout::new(phrases, documents);
        Ok(InvertedIndex { tree: OrderedPagedTree::open(layout, store, state)? })
    }

    pub fn state(&self) -> TreeState {
        self.tree.state()
    }

    /// Data pages allocated so far.
    pub fn data_pages(&self) -> u32 {
        self.tree.data_pages()
    }

    /// Apply deletes and inserts. `placed` maps documents updated in this
    /// batch to the record their stored postings were ordered by.
    pub fn insert(&self, items: &mut [InvertedItem], placed: HashMap<Address, DocumentRecord>) -> Result<()> {
        items.sort_by(|a, b| a.cmp_order(b));
        let inserted = items
            .iter()
            .filter(|item| !item.delete)
            .map(|item| (item.phrase, item.doc, item.pos))
            .collect();
        *self.tree.layout().batch.write() = BatchContext { placed, inserted };
        let result = self.tree.insert(items);
        *self.tree.layout().batch.write() = BatchContext::default();
        result
    }

    /// Word ranges holding postings of phrases in `[lo, hi]` within one document
    /// sector. A range never spans two phrases, so each one reads in result order.
    pub fn find_ranges(&self, lo: &PhraseValue, hi: &PhraseValue, sector: u16) -> Result<Vec<ScanRange>> {
        let layout = self.tree.layout();
        let leaves = self.tree.collect_leaves_by(
            |key| {
                Ok(sector
                    .cmp(&key.doc.sector)
                    .then(lo.cmp(&layout.phrases.read(key.phrase)?))
                    .then(Ordering::Less))
            },
            |key| {
                Ok(sector
                    .cmp(&key.doc.sector)
                    .then(hi.cmp(&layout.phrases.read(key.phrase)?))
                    .then(Ordering::Greater))
            },
        )?;

        let mut ranges = Vec::new();
        let mut values: HashMap<Address, PhraseValue> = HashMap::new();
        for leaf in leaves {
            let words = self.tree.read_units(&leaf.entry)?;
            let mut current: Option<ScanRange> = None;
            let mut i = 0;
            while i < words.len() {
                if !codec::is_header_first(words[i]) {
                    return Err(Error::corrupt(format!("inverted page {} lost its framing at {}", leaf.entry.pageno, i)));
                }
                let (phrase, dsec) = inverted::header_at(&words, i)?;
                let mut end = i + 2;
                while end < words.len() && codec::is_body(words[end]) {
                    end += 1;
                }
                let matches = dsec == sector && {
                    let value = match values.get(&phrase) {
                        Some(v) => v.clone(),
                        None => {
                            let v = layout.phrases.read(phrase)?;
                            values.insert(phrase, v.clone());
                            v
                        }
                    };
                    *lo <= value && value <= *hi
                };
                if matches {
                    let bodies = end - i - 2;
                    match current.as_mut() {
                        Some(range) if range.end == i && range.phrase == phrase => {
                            range.end = end;
                            range.bodies += bodies;
                        }
                        _ => {
                            ranges.extend(current.take());
                            current = Some(ScanRange { phrase, leaf: leaf.entry.clone(), start: i, end, bodies });
                        }
                    }
                }
                i = end;
            }
            ranges.extend(current);
        }
        Ok(ranges)
    }

    /// Postings of one scan range, in stored order.
    pub fn read_range(&self, range: &ScanRange) -> Result<Vec<Posting>> {
        let words = self.tree.read_unit_range(&range.leaf, range.start..range.end)?;
        inverted::decode(&words)
    }

    /// Every posting of `value` in one sector.
    pub fn find(&self, value: &PhraseValue, sector: u16) -> Result<Vec<Posting>> {
        let mut postings = Vec::new();
        for range in self.find_ranges(value, value, sector)? {
            postings.extend(self.read_range(&range)?);
        }
        Ok(postings)
    }

    pub fn postings(&self) -> Result<Vec<Posting>> {
        inverted::decode(&self.tree.units()?)
    }

    pub fn stats(&self) -> Result<TreeStats> {
        self.tree.stats()
    }
}
