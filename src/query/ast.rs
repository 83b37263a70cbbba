use crate::core::types::PhraseValue;
use crate::schema::OrderKey;

/// Where a leaf's postings come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafSource {
    Equal(PhraseValue),
    Prefix(PhraseValue),
    Between(PhraseValue, PhraseValue),
}

impl LeafSource {
    /// Inclusive phrase value range the leaf scans.
    pub fn bounds(&self) -> (PhraseValue, PhraseValue) {
        match self {
            LeafSource::Equal(v) => (v.clone(), v.clone()),
            LeafSource::Prefix(v) if v.is_string() => (v.clone(), v.prefix_upper_bound()),
            LeafSource::Prefix(v) => (v.clone(), v.clone()),
            LeafSource::Between(lo, hi) => (lo.clone(), hi.clone()),
        }
    }
}

/// Boolean condition tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Leaf(LeafSource),
    And {
        left: Box<Condition>,
        right: Box<Condition>,
        adjacent: bool,   // left hit must sit one position after the right hit
    },
    Or {
        left: Box<Condition>,
        right: Box<Condition>,
    },
}

impl Condition {
    pub fn and(left: Condition, right: Condition, adjacent: bool) -> Self {
        Condition::And { left: Box::new(left), right: Box::new(right), adjacent }
    }

    pub fn or(left: Condition, right: Condition) -> Self {
        Condition::Or { left: Box::new(left), right: Box::new(right) }
    }

    pub fn leaves(&self) -> usize {
        match self {
            Condition::Leaf(_) => 1,
            Condition::And { left, right, .. } | Condition::Or { left, right } => left.leaves() + right.leaves(),
        }
    }
}

/// A parsed search request.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub conditions: Option<Condition>,
    pub order: Vec<OrderKey>,
    pub offset: usize,
    pub limit: usize,
    pub lazy_count: bool,
}
