use std::cmp::Ordering;
use std::fmt;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, Result};

pub const MAX_GENERATION: u64 = 100_000_000;
pub const MAX_PHRASE_LENGTH: usize = 1000;
pub const MAX_DOC_PHRASE: usize = 10_000;
pub const MAX_SECTOR: u16 = 0x7FFF;
pub const MAX_REVERSE_INDEX_BLOCK: usize = 20;
pub const MAX_REGULAR_INDEX_BLOCK: usize = 100;
pub const MAX_PHRASE_POS: u32 = 0x7F;
pub const MAX_FILE_SIZE: u64 = 1_000_000_000;
pub const MAX_SORT_BITS: u32 = 128;
pub const SORT_KEY_COUNT: usize = 4;

pub const SECTOR_LEFT: u16 = 0x8000;
pub const SECTOR_RIGHT: u16 = 0x8001;
pub const NULL_OFFSET: u32 = 0x8000_0000;

pub const ATTR_TYPE_STRING: u8 = 0x00;
pub const ATTR_TYPE_INTEGER: u8 = 0x80;

/// Phrase header: top bit is the value type, low 7 bits the attribute id.
pub fn attr_header(id: u8, attr_type: u8) -> u8 {
    (attr_type & 0x80) | (id & 0x7F)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocId(pub u64);

impl DocId {
    pub fn new(id: u64) -> Self {
        DocId(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for DocId {
    fn from(id: u64) -> Self {
        DocId(id)
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `(sector, offset)` pointer into a record heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub sector: u16,
    pub offset: u32,
}

pub type DocumentAddr = Address;
pub type PhraseAddr = Address;

impl Address {
    pub const ENCODED_SIZE: usize = 6;
    pub const NULL: Address = Address { sector: 0, offset: NULL_OFFSET };
    pub const LEFT: Address = Address { sector: SECTOR_LEFT, offset: NULL_OFFSET };
    pub const RIGHT: Address = Address { sector: SECTOR_RIGHT, offset: NULL_OFFSET };

    pub fn new(sector: u16, offset: u32) -> Self {
        Address { sector, offset }
    }

    pub fn is_null(&self) -> bool {
        self.offset == NULL_OFFSET
    }

    pub fn encode(&self, mut out: &mut [u8]) {
        out.put_u16_le(self.sector);
        out.put_u32_le(self.offset);
    }

    pub fn decode(mut buf: &[u8]) -> Self {
        let sector = buf.get_u16_le();
        let offset = buf.get_u32_le();
        Address { sector, offset }
    }
}

/// Sentinel-aware sector ordering: LEFT sorts before every sector, RIGHT after.
pub fn sector_cmp(a: u16, b: u16) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    if a == SECTOR_LEFT || b == SECTOR_RIGHT {
        Ordering::Less
    } else if a == SECTOR_RIGHT || b == SECTOR_LEFT {
        Ordering::Greater
    } else {
        a.cmp(&b)
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        match sector_cmp(self.sector, other.sector) {
            Ordering::Equal => {}
            ord => return ord,
        }
        if self.offset == other.offset {
            Ordering::Equal
        } else if self.offset == NULL_OFFSET {
            Ordering::Less
        } else if other.offset == NULL_OFFSET {
            Ordering::Greater
        } else {
            self.offset.cmp(&other.offset)
        }
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub type SortKey = [u32; SORT_KEY_COUNT];

/// Fixed-size document heap record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocId,
    pub sortkey: SortKey,
}

impl DocumentRecord {
    pub const ENCODED_SIZE: usize = 8 + 4 * SORT_KEY_COUNT;

    pub fn new(id: DocId, sortkey: SortKey) -> Self {
        DocumentRecord { id, sortkey }
    }

    pub fn encode(&self, mut out: &mut [u8]) {
        out.put_u64_le(self.id.0);
        for word in self.sortkey {
            out.put_u32_le(word);
        }
    }

    pub fn decode(mut buf: &[u8]) -> Self {
        let id = DocId(buf.get_u64_le());
        let mut sortkey = [0u32; SORT_KEY_COUNT];
        for word in sortkey.iter_mut() {
            *word = buf.get_u32_le();
        }
        DocumentRecord { id, sortkey }
    }
}

/// Search order: larger packed sort keys first, then larger ids.
pub fn record_order(a_sortkey: &SortKey, a_id: DocId, b_sortkey: &SortKey, b_id: DocId) -> Ordering {
    b_sortkey.cmp(a_sortkey).then_with(|| b_id.cmp(&a_id))
}

/// An indexed value: one header byte then either a string or an i32.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PhraseValue {
    header: u8,
    payload: Vec<u8>,
}

impl PhraseValue {
    pub fn string(header: u8, text: &str) -> Self {
        let bytes = text.as_bytes();
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        PhraseValue {
            header: header & 0x7F,
            payload: bytes[..end].to_vec(),
        }
    }

    pub fn integer(header: u8, value: i32) -> Self {
        PhraseValue {
            header: header | ATTR_TYPE_INTEGER,
            payload: value.to_le_bytes().to_vec(),
        }
    }

    pub fn header(&self) -> u8 {
        self.header
    }

    pub fn is_string(&self) -> bool {
        self.header & ATTR_TYPE_INTEGER == 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn as_str(&self) -> Option<&str> {
        if self.is_string() {
            std::str::from_utf8(&self.payload).ok()
        } else {
            None
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        if self.is_string() || self.payload.len() != 4 {
            return None;
        }
        let mut buf = &self.payload[..];
        Some(buf.get_i32_le())
    }

    /// Bytes the value occupies in the phrase heap.
    pub fn encoded_len(&self) -> usize {
        1 + self.payload.len() + usize::from(self.is_string())
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[0] = self.header;
        out[1..1 + self.payload.len()].copy_from_slice(&self.payload);
        if self.is_string() {
            out[1 + self.payload.len()] = 0;
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let Some((&header, rest)) = buf.split_first() else {
            return Err(Error::corrupt("empty phrase record"));
        };
        if header & ATTR_TYPE_INTEGER == 0 {
            let end = rest
                .iter()
                .position(|b| *b == 0)
                .ok_or_else(|| Error::corrupt("unterminated phrase record"))?;
            Ok(PhraseValue { header, payload: rest[..end].to_vec() })
        } else {
            if rest.len() < 4 {
                return Err(Error::corrupt("truncated integer phrase record"));
            }
            Ok(PhraseValue { header, payload: rest[..4].to_vec() })
        }
    }

    /// Smallest value above every string that starts with this prefix.
    pub fn prefix_upper_bound(&self) -> Self {
        let mut payload = self.payload.clone();
        payload.extend_from_slice(&[0xFF, 0xFF, 0xFF]);
        PhraseValue { header: self.header, payload }
    }
}

impl Ord for PhraseValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.header.cmp(&other.header) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match (self.as_int(), other.as_int()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.payload.cmp(&other.payload),
        }
    }
}

impl PartialOrd for PhraseValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for PhraseValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.as_int() {
            Some(v) => write!(f, "PhraseValue({:#04x}, {})", self.header, v),
            None => write!(
                f,
                "PhraseValue({:#04x}, {:?})",
                self.header,
                String::from_utf8_lossy(&self.payload)
            ),
        }
    }
}
