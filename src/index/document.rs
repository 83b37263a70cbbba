use std::cmp::Ordering;
use std::sync::Arc;
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use tracing::info;
use crate::core::error::{Error, Result};
use crate::core::types::{Address, DocId, DocumentRecord, MAX_SECTOR};
use crate::index::tree::{OrderedPagedTree, TreeLayout, TreeStats};
use crate::storage::header::TreeState;
use crate::storage::page_cache::{PageKey, PageKind};
use crate::storage::page_store::PageStore;

/// Fixed-size document records addressed by `(sector, record number)`.
pub struct DocumentHeap {
    store: Arc<PageStore>,
    next: Mutex<Address>,
    per_page: u32,
    sector_limit: u32,
}

impl DocumentHeap {
    pub fn new(store: Arc<PageStore>, next: Address, sector_limit: u32) -> Self {
        let per_page = (store.page_size() / DocumentRecord::ENCODED_SIZE) as u32;
        DocumentHeap {
            store,
            next: Mutex::new(next),
            per_page,
            sector_limit,
        }
    }

    /// Address the next appended record will get.
    pub fn next(&self) -> Address {
        *self.next.lock()
    }

    fn locate(&self, addr: Address) -> (PageKey, usize) {
        let pageno = addr.offset / self.per_page;
        let slot = (addr.offset % self.per_page) as usize;
        (
            PageKey::new(PageKind::DocumentData, addr.sector, pageno),
            slot * DocumentRecord::ENCODED_SIZE,
        )
    }

    fn roll_sector(next: &mut Address) -> Result<()> {
        if next.sector >= MAX_SECTOR {
            return Err(Error::exhausted("document heap ran out of sectors"));
        }
        next.sector += 1;
        next.offset = 0;
        info!(sector = next.sector, "document heap moved to a new sector");
        Ok(())
    }

    pub fn append(&self, record: &DocumentRecord) -> Result<Address> {
        let mut next = self.next.lock();
        if next.offset >= self.sector_limit {
            Self::roll_sector(&mut next)?;
        }
        let addr = *next;
        let (key, at) = self.locate(addr);
        let mut bytes = [0u8; DocumentRecord::ENCODED_SIZE];
        record.encode(&mut bytes);
        if at == 0 {
            self.store.add_page(key, &bytes)?;
        } else {
            self.store.update_page(key, |page| {
                page[at..at + DocumentRecord::ENCODED_SIZE].copy_from_slice(&bytes)
            })?;
        }
        next.offset += 1;
        Ok(addr)
    }

    fn check(&self, addr: Address) -> Result<()> {
        if addr.is_null() || addr >= self.next() {
            return Err(Error::invalid_address(format!("document address {:?} is out of range", addr)));
        }
        Ok(())
    }

    pub fn update(&self, addr: Address, record: &DocumentRecord) -> Result<()> {
        self.check(addr)?;
        let (key, at) = self.locate(addr);
        let mut bytes = [0u8; DocumentRecord::ENCODED_SIZE];
        record.encode(&mut bytes);
        self.store.update_page(key, |page| {
            page[at..at + DocumentRecord::ENCODED_SIZE].copy_from_slice(&bytes)
        })
    }

    pub fn read(&self, addr: Address) -> Result<DocumentRecord> {
        self.check(addr)?;
        let (key, at) = self.locate(addr);
        self.store
            .read_page(key, |page| DocumentRecord::decode(&page[at..at + DocumentRecord::ENCODED_SIZE]))
    }

    /// Start appending in a fresh sector.
    pub fn advance_sector(&self) -> Result<()> {
        let mut next = self.next.lock();
        if next.offset == 0 {
            return Ok(());
        }
        Self::roll_sector(&mut next)
    }
}

/// Leaf unit of the document tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocEntry {
    pub id: DocId,
    pub addr: Address,
}

/// A document to upsert; `addr` is filled in by the insert.
#[derive(Debug, Clone)]
pub struct InsertDocument {
    pub record: DocumentRecord,
    pub addr: Address,
}

impl InsertDocument {
    pub fn new(record: DocumentRecord) -> Self {
        InsertDocument { record, addr: Address::NULL }
    }
}

pub struct DocumentLayout {
    heap: Arc<DocumentHeap>,
}

impl TreeLayout for DocumentLayout {
    type Key = DocId;
    type Unit = DocEntry;
    type Item = InsertDocument;

    const NAME: &'static str = "documents";
    const DATA_KIND: PageKind = PageKind::DocumentIndex;
    const INFO_KIND: PageKind = PageKind::DocumentInfo;
    const KEY_SIZE: usize = 8;
    const UNIT_SIZE: usize = 8 + Address::ENCODED_SIZE;

    fn encode_key(&self, key: &DocId, mut out: &mut [u8]) {
        out.put_u64_le(key.0);
    }

    fn decode_key(&self, mut buf: &[u8]) -> DocId {
        DocId(buf.get_u64_le())
    }

    fn encode_unit(&self, unit: &DocEntry, mut out: &mut [u8]) {
        out.put_u64_le(unit.id.0);
        unit.addr.encode(out);
    }

    fn decode_unit(&self, mut buf: &[u8]) -> DocEntry {
        let id = DocId(buf.get_u64_le());
        DocEntry { id, addr: Address::decode(buf) }
    }

    fn compare_key(&self, a: &DocId, b: &DocId) -> Result<Ordering> {
        Ok(a.cmp(b))
    }

    fn compare_item(&self, item: &InsertDocument, key: &DocId) -> Result<Ordering> {
        Ok(item.record.id.cmp(key))
    }

    fn merge(&self, old: Vec<DocEntry>, items: &mut [InsertDocument]) -> Result<Vec<DocEntry>> {
        let mut out = Vec::with_capacity(old.len() + items.len());
        let mut old = old.into_iter().peekable();
        for item in items.iter_mut() {
            let id = item.record.id;
            while old.peek().is_some_and(|e| e.id < id) {
                out.extend(old.next());
            }
            if old.peek().is_some_and(|e| e.id == id) {
                out.extend(old.next());
            }
            match out.last() {
                Some(last) if last.id == id => {
                    self.heap.update(last.addr, &item.record)?;
                    item.addr = last.addr;
                }
                _ => {
                    let addr = self.heap.append(&item.record)?;
                    item.addr = addr;
                    out.push(DocEntry { id, addr });
                }
            }
        }
        out.extend(old);
        Ok(out)
    }

    fn max_key(&self, units: &[DocEntry]) -> Result<DocId> {
        units
            .last()
            .map(|e| e.id)
            .ok_or_else(|| Error::state("empty document run"))
    }
}

/// Primary key to fixed document record.
pub struct DocumentTable {
    heap: Arc<DocumentHeap>,
    tree: OrderedPagedTree<DocumentLayout>,
}

impl DocumentTable {
    pub fn create(store: Arc<PageStore>, sector_limit: u32) -> Result<Self> {
        let heap = Arc::new(DocumentHeap::new(Arc::clone(&store), Address::new(0, 0), sector_limit));
        let tree = OrderedPagedTree::create(DocumentLayout { heap: Arc::clone(&heap) }, store)?;
        Ok(DocumentTable { heap, tree })
    }

    pub fn open(store: Arc<PageStore>, sector_limit: u32, state: &TreeState, next: Address) -> Result<Self> {
        let heap = Arc::new(DocumentHeap::new(Arc::clone(&store), next, sector_limit));
        let tree = OrderedPagedTree::open(DocumentLayout { heap: Arc::clone(&heap) }, store, state)?;
        Ok(DocumentTable { heap, tree })
    }

    pub fn state(&self) -> (TreeState, Address) {
        (self.tree.state(), self.heap.next())
    }

    pub fn heap(&self) -> &Arc<DocumentHeap> {
        &self.heap
    }

    /// Upsert records; each item's `addr` is set to its stable address.
    pub fn insert(&self, items: &mut [InsertDocument]) -> Result<()> {
        items.sort_by_key(|item| item.record.id);
        self.tree.insert(items)
    }

    pub fn find_addr(&self, id: DocId) -> Result<Option<Address>> {
        let leaf = self.tree.find_leaf(&id)?;
        let units = self.tree.read_units(&leaf)?;
        Ok(units
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(|idx| units[idx].addr))
    }

    pub fn find(&self, id: DocId) -> Result<Option<DocumentRecord>> {
        match self.find_addr(id)? {
            Some(addr) => Ok(Some(self.heap.read(addr)?)),
            None => Ok(None),
        }
    }

    pub fn read(&self, addr: Address) -> Result<DocumentRecord> {
        self.heap.read(addr)
    }

    pub fn entries(&self) -> Result<Vec<DocEntry>> {
        self.tree.units()
    }

    pub fn stats(&self) -> Result<TreeStats> {
        self.tree.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use crate::core::error::ErrorKind;
    use crate::index::tree::tests::small_store;

    fn record(id: u64, key: u32) -> DocumentRecord {
        DocumentRecord::new(DocId(id), [key, 0, 0, 0])
    }

    #[test]
    fn random_order_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let table = DocumentTable::create(small_store(dir.path(), 256), 0x00FF_FFFF).unwrap();
        let mut ids: Vec<u64> = (1..=300).collect();
        ids.shuffle(&mut rand::thread_rng());
        for chunk in ids.chunks(7) {
            let mut batch: Vec<InsertDocument> =
                chunk.iter().map(|id| InsertDocument::new(record(*id, *id as u32 * 2))).collect();
            table.insert(&mut batch).unwrap();
        }
        for id in 1..=300u64 {
            assert_eq!(table.find(DocId(id)).unwrap(), Some(record(id, id as u32 * 2)));
        }
        assert_eq!(table.find(DocId(301)).unwrap(), None);
        let stats = table.stats().unwrap();
        assert_eq!(stats.units, 300);
        assert!(stats.max_leaf_fill <= stats.data_limit);
    }

    #[test]
    fn update_keeps_address() {
        let dir = tempfile::tempdir().unwrap();
        let table = DocumentTable::create(small_store(dir.path(), 256), 0x00FF_FFFF).unwrap();
        let mut batch = vec![InsertDocument::new(record(5, 1)), InsertDocument::new(record(6, 1))];
        table.insert(&mut batch).unwrap();
        let addr = table.find_addr(DocId(5)).unwrap().unwrap();

        let mut batch = vec![InsertDocument::new(record(5, 9))];
        table.insert(&mut batch).unwrap();
        assert_eq!(batch[0].addr, addr);
        assert_eq!(table.find(DocId(5)).unwrap().unwrap().sortkey[0], 9);
        assert_eq!(table.stats().unwrap().units, 2);
        assert_eq!(table.heap().next(), Address::new(0, 2));
    }

    #[test]
    fn duplicates_in_one_batch_collapse_last_wins() {
        let dir = tempfile::tempdir().unwrap();
        let table = DocumentTable::create(small_store(dir.path(), 256), 0x00FF_FFFF).unwrap();
        let mut batch = vec![InsertDocument::new(record(3, 1)), InsertDocument::new(record(3, 2))];
        table.insert(&mut batch).unwrap();
        assert_eq!(batch[0].addr, batch[1].addr);
        assert_eq!(table.find(DocId(3)).unwrap().unwrap().sortkey[0], 2);
        assert_eq!(table.entries().unwrap().len(), 1);
    }

    #[test]
    fn heap_rolls_sectors_and_rejects_unknown_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let heap = DocumentHeap::new(small_store(dir.path(), 256), Address::new(0, 0), 3);
        let addrs: Vec<Address> = (0..5).map(|i| heap.append(&record(i, 0)).unwrap()).collect();
        assert_eq!(addrs[2], Address::new(0, 2));
        assert_eq!(addrs[3], Address::new(1, 0));
        assert_eq!(heap.read(addrs[4]).unwrap().id, DocId(4));
        assert_eq!(heap.read(Address::new(1, 2)).unwrap_err().kind, ErrorKind::InvalidAddress);

        heap.advance_sector().unwrap();
        assert_eq!(heap.next(), Address::new(2, 0));
        heap.advance_sector().unwrap();
        assert_eq!(heap.next(), Address::new(2, 0));
    }
}
