use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;
use crate::core::config::Config;
use crate::core::error::Result;
use crate::index::document::DocumentHeap;
use crate::index::inverted::InvertedIndex;
use crate::query::ast::{Condition, SearchRequest};
use crate::schema::Schema;
use crate::search::cursor::{Hit, LeafCursor, SearchContext};
use crate::search::results::SearchResponse;

/// Below this many consumed postings the lazy estimate is padded.
const MIN_SAMPLE: usize = 20;

/// Pull-based merge tree built from a condition.
pub enum Node {
    Leaf(LeafCursor),
    And {
        left: Box<Node>,
        right: Box<Node>,
        adjacent: bool,
        left_hit: Option<Hit>,
        right_hit: Option<Hit>,
    },
    Or {
        left: Box<Node>,
        right: Box<Node>,
        left_hit: Option<Hit>,
        right_hit: Option<Hit>,
    },
}

impl Node {
    pub fn build(condition: &Condition, ctx: &SearchContext) -> Result<Self> {
        Ok(match condition {
            Condition::Leaf(source) => Node::Leaf(LeafCursor::open(source, ctx)?),
            Condition::And { left, right, adjacent } => Node::And {
                left: Box::new(Node::build(left, ctx)?),
                right: Box::new(Node::build(right, ctx)?),
                adjacent: *adjacent,
                left_hit: None,
                right_hit: None,
            },
            Condition::Or { left, right } => Node::Or {
                left: Box::new(Node::build(left, ctx)?),
                right: Box::new(Node::build(right, ctx)?),
                left_hit: None,
                right_hit: None,
            },
        })
    }

    /// Next hit in result order, `None` once exhausted.
    pub fn pull(&mut self, ctx: &SearchContext) -> Result<Option<Hit>> {
        match self {
            Node::Leaf(cursor) => cursor.next(ctx),
            Node::And { left, right, adjacent, left_hit, right_hit } => loop {
                if left_hit.is_none() {
                    *left_hit = left.pull(ctx)?;
                }
                if right_hit.is_none() {
                    *right_hit = right.pull(ctx)?;
                }
                let (Some(l), Some(r)) = (*left_hit, *right_hit) else {
                    return Ok(None);
                };
                let mut ord = l.weak_cmp(&r);
                let follows = u16::from(r.pos) + 1;
                if ord == Ordering::Equal && *adjacent && u16::from(l.pos) != follows {
                    ord = u16::from(l.pos).cmp(&follows);
                }
                match ord {
                    // Without adjacency the right hit stays, so further positions
                    // of the same document on the left still match it.
                    Ordering::Equal if !*adjacent => return Ok(left_hit.take()),
                    Ordering::Equal => {
                        *right_hit = None;
                        return Ok(left_hit.take());
                    }
                    Ordering::Less => *left_hit = None,
                    Ordering::Greater => *right_hit = None,
                }
            },
            Node::Or { left, right, left_hit, right_hit } => {
                if left_hit.is_none() {
                    *left_hit = left.pull(ctx)?;
                }
                if right_hit.is_none() {
                    *right_hit = right.pull(ctx)?;
                }
                Ok(match (*left_hit, *right_hit) {
                    (None, None) => None,
                    (Some(_), None) => left_hit.take(),
                    (None, Some(_)) => right_hit.take(),
                    (Some(l), Some(r)) => match l.weak_cmp(&r) {
                        Ordering::Less => left_hit.take(),
                        Ordering::Greater => right_hit.take(),
                        Ordering::Equal => {
                            *right_hit = None;
                            left_hit.take()
                        }
                    },
                })
            }
        }
    }

    /// Summed leaf progress, `(total, consumed)`.
    pub fn progress(&self) -> (usize, usize) {
        match self {
            Node::Leaf(cursor) => cursor.progress(),
            Node::And { left, right, .. } | Node::Or { left, right, .. } => {
                let (lt, lc) = left.progress();
                let (rt, rc) = right.progress();
                (lt + rt, lc + rc)
            }
        }
    }
}

/// Runs parsed search requests against the inverted index.
pub struct Searcher {
    inverted: Arc<InvertedIndex>,
    documents: Arc<DocumentHeap>,
    schema: Arc<Schema>,
    lazy_count_threshold: usize,
}

impl Searcher {
    pub fn new(inverted: Arc<InvertedIndex>, documents: Arc<DocumentHeap>, schema: Arc<Schema>, config: &Config) -> Self {
        Searcher {
            inverted,
            documents,
            schema,
            lazy_count_threshold: config.lazy_count_threshold,
        }
    }

    pub fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let Some(condition) = &request.conditions else {
            return Ok(SearchResponse::empty());
        };
        let ctx = SearchContext {
            inverted: Arc::clone(&self.inverted),
            documents: Arc::clone(&self.documents),
            schema: Arc::clone(&self.schema),
            order: request.order.clone(),
        };
        let mut root = Node::build(condition, &ctx)?;
        let (hits, count) = self.do_search(&mut root, &ctx, request)?;
        debug!(leaves = condition.leaves(), count, returned = hits.len(), "search finished");
        Ok(SearchResponse::new(count, hits.iter().map(|h| h.id.0).collect()))
    }

    /// Pull the requested page and count the rest, exactly or by estimate.
    fn do_search(&self, root: &mut Node, ctx: &SearchContext, request: &SearchRequest) -> Result<(Vec<Hit>, usize)> {
        let want = request.offset + request.limit;
        let mut hits: Vec<Hit> = Vec::with_capacity(want.min(1024));
        let mut exhausted = false;
        while hits.len() < want {
            match root.pull(ctx)? {
                None => {
                    exhausted = true;
                    break;
                }
                Some(hit) => {
                    if hits.last().is_none_or(|last| last.weak_cmp(&hit) != Ordering::Equal) {
                        hits.push(hit);
                    }
                }
            }
        }

        let mut count = hits.len();
        if !exhausted {
            if request.lazy_count {
                let guess = estimate(root, hits.len());
                if guess > self.lazy_count_threshold {
                    return Ok((page(hits, request), guess));
                }
            }
            let mut last = hits.last().copied();
            while let Some(hit) = root.pull(ctx)? {
                if last.is_none_or(|prev| prev.weak_cmp(&hit) != Ordering::Equal) {
                    count += 1;
                }
                last = Some(hit);
            }
        }
        Ok((page(hits, request), count))
    }
}

/// Extrapolate the final count from how far the leaves have read.
fn estimate(root: &Node, found: usize) -> usize {
    let (total, current) = root.progress();
    extrapolate(found, total, current)
}

/// `found` scaled from `current` read postings to `total`, never below `found`.
fn extrapolate(found: usize, total: usize, mut current: usize) -> usize {
    if current < MIN_SAMPLE {
        current += 2;
    }
    (found * total / current).max(found)
}

fn page(hits: Vec<Hit>, request: &SearchRequest) -> Vec<Hit> {
    hits.into_iter().skip(request.offset).take(request.limit).collect()
}
