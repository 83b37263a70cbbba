use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use crate::core::error::Result;
use crate::core::types::{DocId, SortKey, record_order};
use crate::index::codec::Posting;
use crate::index::document::DocumentHeap;
use crate::index::inverted::{InvertedIndex, ScanRange};
use crate::query::ast::LeafSource;
use crate::schema::{OrderKey, Schema};

/// One matching posting, keyed the way results are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub sortkey: SortKey,
    pub id: DocId,
    pub pos: u8,
}

impl Hit {
    /// Document order only.
    pub fn weak_cmp(&self, other: &Hit) -> Ordering {
        record_order(&self.sortkey, self.id, &other.sortkey, other.id)
    }

    /// Document order, then position.
    pub fn strong_cmp(&self, other: &Hit) -> Ordering {
        self.weak_cmp(other).then(self.pos.cmp(&other.pos))
    }
}

/// Tables and ordering shared by every cursor of one search.
pub struct SearchContext {
    pub inverted: Arc<InvertedIndex>,
    pub documents: Arc<DocumentHeap>,
    pub schema: Arc<Schema>,
    pub order: Vec<OrderKey>,
}

impl SearchContext {
    fn hit(&self, posting: &Posting) -> Result<Hit> {
        let record = self.documents.read(posting.doc)?;
        let sortkey = if self.order.is_empty() {
            record.sortkey
        } else {
            self.schema.reorder(&self.order, &record.sortkey)
        };
        Ok(Hit { sortkey, id: record.id, pos: posting.pos })
    }

    fn hits(&self, postings: &[Posting]) -> Result<Vec<Hit>> {
        postings.iter().map(|p| self.hit(p)).collect()
    }

    /// Sectors the document heap has written so far.
    fn sectors(&self) -> std::ops::RangeInclusive<u16> {
        0..=self.documents.next().sector
    }
}

/// Scan ranges of one phrase in one document sector, loaded one range at a time.
struct Partial {
    ranges: VecDeque<ScanRange>,
    hits: Vec<Hit>,
    next: usize,
    total: usize,
    consumed: usize,
    loaded: usize,
}

impl Partial {
    fn new(ranges: Vec<ScanRange>) -> Self {
        let total = ranges.iter().map(|r| r.bodies).sum();
        Partial {
            ranges: ranges.into(),
            hits: Vec::new(),
            next: 0,
            total,
            consumed: 0,
            loaded: 0,
        }
    }

    /// Current head, loading the next range when the loaded one is spent.
    fn head(&mut self, ctx: &SearchContext) -> Result<Option<Hit>> {
        while self.next >= self.hits.len() {
            let Some(range) = self.ranges.pop_front() else {
                return Ok(None);
            };
            self.consumed += self.loaded;
            self.loaded = range.bodies;
            self.hits = ctx.hits(&ctx.inverted.read_range(&range)?)?;
            self.next = 0;
        }
        Ok(Some(self.hits[self.next]))
    }

    fn progress(&self) -> usize {
        if self.hits.is_empty() {
            return self.consumed;
        }
        self.consumed + self.loaded * self.next / self.hits.len()
    }
}

/// Head of one partial in the merge heap; the smallest hit in strong order
/// sits on top.
struct Head {
    hit: Hit,
    partial: usize,
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .hit
            .strong_cmp(&self.hit)
            .then_with(|| other.partial.cmp(&self.partial))
    }
}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

enum Source {
    /// Per-phrase runs already in result order, merged through a heap.
    Merge {
        partials: Vec<Partial>,
        heads: BinaryHeap<Head>,
        last: Option<Hit>,
    },
    /// Everything loaded up front and sorted.
    Sorted { hits: Vec<Hit>, next: usize },
}

/// Produces the hits of one leaf condition in strong order.
pub struct LeafCursor {
    source: Source,
}

impl LeafCursor {
    pub fn open(leaf: &LeafSource, ctx: &SearchContext) -> Result<Self> {
        let (lo, hi) = leaf.bounds();
        if ctx.order.is_empty() {
            let mut partials = Vec::new();
            for sector in ctx.sectors() {
                let mut run: Vec<ScanRange> = Vec::new();
                for range in ctx.inverted.find_ranges(&lo, &hi, sector)? {
                    if run.last().is_some_and(|r| r.phrase != range.phrase) {
                        partials.push(Partial::new(std::mem::take(&mut run)));
                    }
                    run.push(range);
                }
                if !run.is_empty() {
                    partials.push(Partial::new(run));
                }
            }
            let mut heads = BinaryHeap::with_capacity(partials.len());
            for (i, partial) in partials.iter_mut().enumerate() {
                if let Some(hit) = partial.head(ctx)? {
                    heads.push(Head { hit, partial: i });
                }
            }
            return Ok(LeafCursor { source: Source::Merge { partials, heads, last: None } });
        }

        // A custom order does not follow the stored order, so sort everything.
        let mut hits = Vec::new();
        for sector in ctx.sectors() {
            for range in ctx.inverted.find_ranges(&lo, &hi, sector)? {
                hits.extend(ctx.hits(&ctx.inverted.read_range(&range)?)?);
            }
        }
        hits.sort_by(|a, b| a.strong_cmp(b));
        hits.dedup();
        Ok(LeafCursor { source: Source::Sorted { hits, next: 0 } })
    }

    pub fn next(&mut self, ctx: &SearchContext) -> Result<Option<Hit>> {
        match &mut self.source {
            Source::Sorted { hits, next } => {
                let hit = hits.get(*next).copied();
                if hit.is_some() {
                    *next += 1;
                }
                Ok(hit)
            }
            Source::Merge { partials, heads, last } => {
                while let Some(Head { hit, partial: i }) = heads.pop() {
                    let partial = &mut partials[i];
                    partial.next += 1;
                    if let Some(head) = partial.head(ctx)? {
                        heads.push(Head { hit: head, partial: i });
                    }
                    // Two phrases of one range can share a document and position.
                    if *last == Some(hit) {
                        continue;
                    }
                    *last = Some(hit);
                    return Ok(Some(hit));
                }
                Ok(None)
            }
        }
    }

    /// `(postings in total, postings consumed so far)`.
    pub fn progress(&self) -> (usize, usize) {
        match &self.source {
            Source::Sorted { hits, next } => (hits.len(), *next),
            Source::Merge { partials, .. } => partials
                .iter()
                .fold((0, 0), |(total, current), p| (total + p.total, current + p.progress())),
        }
    }
}
