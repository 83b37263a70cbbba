use std::cmp::Ordering;
use std::sync::Arc;
use parking_lot::Mutex;
use tracing::info;
use crate::core::error::{Error, Result};
use crate::core::types::{Address, MAX_SECTOR, PhraseValue};
use crate::index::tree::{OrderedPagedTree, TreeLayout, TreeStats};
use crate::storage::header::TreeState;
use crate::storage::page_cache::{PageKey, PageKind};
use crate::storage::page_store::PageStore;

/// Variable-length phrase records. A record never crosses a page boundary.
pub struct PhraseHeap {
    store: Arc<PageStore>,
    next: Mutex<Address>,
    sector_limit: u32,
}

impl PhraseHeap {
    pub fn new(store: Arc<PageStore>, next: Address, sector_limit: u32) -> Self {
        PhraseHeap {
            store,
            next: Mutex::new(next),
            sector_limit,
        }
    }

    pub fn next(&self) -> Address {
        *self.next.lock()
    }

    fn page_size(&self) -> usize {
        self.store.page_size()
    }

    fn locate(&self, addr: Address) -> (PageKey, usize) {
        let page_size = self.page_size() as u32;
        (
            PageKey::new(PageKind::PhraseData, addr.sector, addr.offset / page_size),
            (addr.offset % page_size) as usize,
        )
    }

    pub fn append(&self, value: &PhraseValue) -> Result<Address> {
        let len = value.encoded_len();
        let page_size = self.page_size();
        if len > page_size {
            return Err(Error::state(format!("phrase of {} bytes exceeds a page", len)));
        }

        let mut next = self.next.lock();
        let mut offset = next.offset as usize;
        let within = offset % page_size;
        if within + len > page_size {
            offset += page_size - within;
        }
        if offset + len > self.sector_limit as usize {
            if next.sector >= MAX_SECTOR {
                return Err(Error::exhausted("phrase heap ran out of sectors"));
            }
            next.sector += 1;
            offset = 0;
            info!(sector = next.sector, "phrase heap moved to a new sector");
        }

        let addr = Address::new(next.sector, offset as u32);
        let (key, at) = self.locate(addr);
        let mut bytes = vec![0u8; len];
        value.encode(&mut bytes);
        if at == 0 {
            self.store.add_page(key, &bytes)?;
        } else {
            self.store.update_page(key, |page| page[at..at + len].copy_from_slice(&bytes))?;
        }
        next.offset = (offset + len) as u32;
        Ok(addr)
    }

    pub fn read(&self, addr: Address) -> Result<PhraseValue> {
        if addr.is_null() || addr >= self.next() {
            return Err(Error::invalid_address(format!("phrase address {:?} is out of range", addr)));
        }
        let (key, at) = self.locate(addr);
        self.store.read_page(key, |page| PhraseValue::decode(&page[at..]))?
    }
}

/// A phrase to intern; `addr` is filled in by the insert.
#[derive(Debug, Clone)]
pub struct InsertPhrase {
    pub value: PhraseValue,
    pub addr: Address,
}

impl InsertPhrase {
    pub fn new(value: PhraseValue) -> Self {
        InsertPhrase { value, addr: Address::NULL }
    }
}

/// Leaves hold heap addresses ordered by the values they point at.
pub struct PhraseLayout {
    heap: Arc<PhraseHeap>,
}

impl TreeLayout for PhraseLayout {
    type Key = Address;
    type Unit = Address;
    type Item = InsertPhrase;

    const NAME: &'static str = "phrases";
    const DATA_KIND: PageKind = PageKind::PhraseIndex;
    const INFO_KIND: PageKind = PageKind::PhraseInfo;
    const KEY_SIZE: usize = Address::ENCODED_SIZE;
    const UNIT_SIZE: usize = Address::ENCODED_SIZE;

    fn encode_key(&self, key: &Address, out: &mut [u8]) {
        key.encode(out);
    }

    fn decode_key(&self, buf: &[u8]) -> Address {
        Address::decode(buf)
    }

    fn encode_unit(&self, unit: &Address, out: &mut [u8]) {
        unit.encode(out);
    }

    fn decode_unit(&self, buf: &[u8]) -> Address {
        Address::decode(buf)
    }

    fn compare_key(&self, a: &Address, b: &Address) -> Result<Ordering> {
        if a == b {
            return Ok(Ordering::Equal);
        }
        Ok(self.heap.read(*a)?.cmp(&self.heap.read(*b)?))
    }

    fn compare_item(&self, item: &InsertPhrase, key: &Address) -> Result<Ordering> {
        Ok(item.value.cmp(&self.heap.read(*key)?))
    }

    fn merge(&self, old: Vec<Address>, items: &mut [InsertPhrase]) -> Result<Vec<Address>> {
        let old = old
            .into_iter()
            .map(|addr| Ok((self.heap.read(addr)?, addr)))
            .collect::<Result<Vec<_>>>()?;

        let mut out: Vec<(PhraseValue, Address)> = Vec::with_capacity(old.len() + items.len());
        let mut old = old.into_iter().peekable();
        for item in items.iter_mut() {
            while old.peek().is_some_and(|(v, _)| *v < item.value) {
                out.extend(old.next());
            }
            if old.peek().is_some_and(|(v, _)| *v == item.value) {
                out.extend(old.next());
            }
            match out.last() {
                Some((value, addr)) if *value == item.value => item.addr = *addr,
                _ => {
                    let addr = self.heap.append(&item.value)?;
                    item.addr = addr;
                    out.push((item.value.clone(), addr));
                }
            }
        }
        out.extend(old);
        Ok(out.into_iter().map(|(_, addr)| addr).collect())
    }

    fn max_key(&self, units: &[Address]) -> Result<Address> {
        units.last().copied().ok_or_else(|| Error::state("empty phrase run"))
    }
}

/// Phrase value to stable address. Phrases are never removed.
pub struct PhraseTable {
    heap: Arc<PhraseHeap>,
    tree: OrderedPagedTree<PhraseLayout>,
}

impl PhraseTable {
    pub fn create(store: Arc<PageStore>, sector_limit: u32) -> Result<Self> {
        let heap = Arc::new(PhraseHeap::new(Arc::clone(&store), Address::new(0, 0), sector_limit));
        let tree = OrderedPagedTree::create(PhraseLayout { heap: Arc::clone(&heap) }, store)?;
        Ok(PhraseTable { heap, tree })
    }

    pub fn open(store: Arc<PageStore>, sector_limit: u32, state: &TreeState, next: Address) -> Result<Self> {
        let heap = Arc::new(PhraseHeap::new(Arc::clone(&store), next, sector_limit));
        let tree = OrderedPagedTree::open(PhraseLayout { heap: Arc::clone(&heap) }, store, state)?;
        Ok(PhraseTable { heap, tree })
    }

    pub fn state(&self) -> (TreeState, Address) {
        (self.tree.state(), self.heap.next())
    }

    pub fn heap(&self) -> &Arc<PhraseHeap> {
        &self.heap
    }

    /// Intern phrases; each item's `addr` is set to the stored address.
    pub fn insert(&self, items: &mut [InsertPhrase]) -> Result<()> {
        items.sort_by(|a, b| a.value.cmp(&b.value));
        self.tree.insert(items)
    }

    pub fn find_addr(&self, value: &PhraseValue) -> Result<Option<Address>> {
        let heap = &self.heap;
        let leaf = self.tree.find_leaf_by(|key| Ok(value.cmp(&heap.read(*key)?)))?;
        let units = self.tree.read_units(&leaf)?;
        let (mut lo, mut hi) = (0, units.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match heap.read(units[mid])?.cmp(value) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Some(units[mid])),
            }
        }
        Ok(None)
    }

    pub fn read(&self, addr: Address) -> Result<PhraseValue> {
        self.heap.read(addr)
    }

    pub fn values(&self) -> Result<Vec<PhraseValue>> {
        self.tree
            .units()?
            .into_iter()
            .map(|addr| self.heap.read(addr))
            .collect()
    }

    pub fn stats(&self) -> Result<TreeStats> {
        self.tree.stats()
    }
}
