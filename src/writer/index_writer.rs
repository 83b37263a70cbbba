use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use crate::core::error::{Error, Result};
use crate::core::types::{Address, DocId, DocumentRecord, PhraseValue};
use crate::index::document::{DocumentTable, InsertDocument};
use crate::index::forward::{ForwardIndex, ForwardItem};
use crate::index::inverted::{InvertedIndex, InvertedItem};
use crate::index::phrase::{InsertPhrase, PhraseTable};
use crate::writer::parser::IndexRequest;

/// The four tables an index mutation touches.
#[derive(Clone)]
pub struct Tables {
    pub documents: Arc<DocumentTable>,
    pub phrases: Arc<PhraseTable>,
    pub forward: Arc<ForwardIndex>,
    pub inverted: Arc<InvertedIndex>,
}

/// Applies request batches in five ordered phases.
pub struct IndexWriter {
    tables: Tables,
    block_size: usize,
}

/// Postings that must go away before a document is re-indexed.
#[derive(Default)]
struct Removal {
    deletes: Vec<InvertedItem>,
    placed: HashMap<Address, DocumentRecord>,
}

impl IndexWriter {
    pub fn new(tables: Tables, block_size: usize) -> Self {
        IndexWriter { tables, block_size }
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Index a batch. Later requests for the same id win.
    pub fn apply(&self, batch: &[IndexRequest]) -> Result<()> {
        let batch = latest_per_id(batch);
        if batch.is_empty() {
            return Ok(());
        }

        let removal = self.remove_stale(&batch)?;
        debug!(requests = batch.len(), deletes = removal.deletes.len(), "removed stale postings");

        self.check_sector()?;
        let documents = self.insert_documents(&batch)?;
        debug!(documents = documents.len(), "documents upserted");

        let phrases = self.insert_phrases(&batch)?;
        debug!(phrases = phrases.len(), "phrases interned");

        let mut forward = Vec::with_capacity(batch.len());
        let mut inverted = removal.deletes;
        for request in &batch {
            let doc = lookup_document(&documents, request.id())?;
            let mut addrs: Vec<Address> = Vec::with_capacity(request.phrases.len());
            for phrase in &request.phrases {
                let addr = lookup_phrase(&phrases, &phrase.value)?;
                if !addrs.contains(&addr) {
                    addrs.push(addr);
                }
                inverted.push(InvertedItem::insert(addr, phrase.value.clone(), doc, request.record, phrase.pos));
            }
            forward.push(ForwardItem { doc, phrases: addrs });
        }

        self.tables.forward.insert(&mut forward)?;
        debug!(documents = forward.len(), "forward index updated");

        self.tables.inverted.insert(&mut inverted, removal.placed)?;
        debug!(postings = inverted.len(), "inverted index updated");
        Ok(())
    }

    /// Phase 1: drop forward runs of known ids and collect group deletes.
    fn remove_stale(&self, batch: &[&IndexRequest]) -> Result<Removal> {
        let mut removal = Removal::default();
        for request in batch {
            let Some(doc) = self.tables.documents.find_addr(request.id())? else {
                continue;
            };
            let old = self.tables.documents.read(doc)?;
            for phrase in self.tables.forward.remove(doc)? {
                let value = self.tables.phrases.read(phrase)?;
                removal.deletes.extend(InvertedItem::delete_group(phrase, value, doc, old));
            }
            removal.placed.insert(doc, old);
        }
        Ok(removal)
    }

    /// Move document appends to a new sector once the inverted index outgrows it.
    fn check_sector(&self) -> Result<()> {
        if self.block_size == 0 {
            return Ok(());
        }
        let pages = self.tables.inverted.data_pages() as usize;
        let heap = self.tables.documents.heap();
        if pages / self.block_size > heap.next().sector as usize {
            heap.advance_sector()?;
            info!(sector = heap.next().sector, pages, "document sector advanced");
        }
        Ok(())
    }

    /// Phase 2: upsert records, sorted by id.
    fn insert_documents(&self, batch: &[&IndexRequest]) -> Result<Vec<InsertDocument>> {
        let mut items: Vec<InsertDocument> = batch.iter().map(|r| InsertDocument::new(r.record)).collect();
        self.tables.documents.insert(&mut items)?;
        Ok(items)
    }

    /// Phase 3: intern the union of the batch's phrases, sorted by value.
    fn insert_phrases(&self, batch: &[&IndexRequest]) -> Result<Vec<InsertPhrase>> {
        let mut items: Vec<InsertPhrase> = batch
            .iter()
            .flat_map(|r| r.phrases.iter())
            .map(|p| InsertPhrase::new(p.value.clone()))
            .collect();
        items.sort_by(|a, b| a.value.cmp(&b.value));
        items.dedup_by(|a, b| a.value == b.value);
        self.tables.phrases.insert(&mut items)?;
        Ok(items)
    }
}

fn latest_per_id(batch: &[IndexRequest]) -> Vec<&IndexRequest> {
    let mut latest: HashMap<DocId, usize> = HashMap::with_capacity(batch.len());
    for (i, request) in batch.iter().enumerate() {
        latest.insert(request.id(), i);
    }
    let mut order: Vec<usize> = latest.into_values().collect();
    order.sort_unstable();
    order.into_iter().map(|i| &batch[i]).collect()
}

fn lookup_document(items: &[InsertDocument], id: DocId) -> Result<Address> {
    items
        .binary_search_by_key(&id, |item| item.record.id)
        .map(|i| items[i].addr)
        .map_err(|_| Error::state(format!("document {} lost its address", id)))
}

fn lookup_phrase(items: &[InsertPhrase], value: &PhraseValue) -> Result<Address> {
    items
        .binary_search_by(|item| item.value.cmp(value))
        .map(|i| items[i].addr)
        .map_err(|_| Error::state(format!("phrase {:?} lost its address", value)))
}
