//! Packed 32-bit word streams of the forward and inverted indexes.
//!
//! Both formats frame runs of body words with a header pair:
//!
//! ```text
//! header-first   10.. ....  (format specific)
//! header-second  11pp pppp pppp pppp pddd dddd dddd dddd   p = phrase sector, d = document sector
//! body           0... ....  (format specific)
//! ```
//!
//! Forward words: header-first carries the document offset (bits 0-23) and
//! a position field (bits 24-30); bodies carry a weight (bits 28-29) and a
//! phrase offset (bits 0-27).
//!
//! Inverted words: header-first carries a weight (bits 28-29) and the phrase
//! offset (bits 0-27); bodies carry the position (bits 24-30) and the document
//! offset (bits 0-23).

use crate::core::error::{Error, Result};
use crate::core::types::{Address, MAX_PHRASE_POS, MAX_REGULAR_INDEX_BLOCK, MAX_REVERSE_INDEX_BLOCK};

const TAG_MASK: u32 = 0xC000_0000;
const TAG_HEADER_FIRST: u32 = 0x8000_0000;
const TAG_HEADER_SECOND: u32 = 0xC000_0000;

const DOC_OFFSET_MASK: u32 = 0x00FF_FFFF;
const PHRASE_OFFSET_MASK: u32 = 0x0FFF_FFFF;
const SECTOR_MASK: u32 = 0x7FFF;

pub fn is_header_first(word: u32) -> bool {
    word & TAG_MASK == TAG_HEADER_FIRST
}

pub fn is_header_second(word: u32) -> bool {
    word & TAG_MASK == TAG_HEADER_SECOND
}

pub fn is_body(word: u32) -> bool {
    word & 0x8000_0000 == 0
}

pub fn phrase_sector(word: u32) -> u16 {
    ((word & 0x3FFF_8000) >> 15) as u16
}

pub fn doc_sector(word: u32) -> u16 {
    (word & SECTOR_MASK) as u16
}

pub fn pos(word: u32) -> u8 {
    ((word & 0x7F00_0000) >> 24) as u8
}

pub fn weight(word: u32) -> u8 {
    ((word & 0x3000_0000) >> 28) as u8
}

pub fn header_second(phrase_sector: u16, doc_sector: u16) -> u32 {
    TAG_HEADER_SECOND | ((phrase_sector as u32 & SECTOR_MASK) << 15) | (doc_sector as u32 & SECTOR_MASK)
}

fn check_offset(offset: u32, mask: u32, what: &str) -> Result<u32> {
    if offset & !mask != 0 {
        return Err(Error::exhausted(format!("{} offset {:#x} does not fit the packed word", what, offset)));
    }
    Ok(offset)
}

/// Index of the header-first word owning the word at `idx`.
pub fn find_header(words: &[u32], idx: usize, max_block: usize) -> Result<usize> {
    let mut cursor = idx;
    for _ in 0..=max_block + 2 {
        if is_header_first(words[cursor]) {
            return Ok(cursor);
        }
        if cursor == 0 {
            break;
        }
        cursor -= 1;
    }
    Err(Error::corrupt(format!("no header within {} words before word {}", max_block + 2, idx)))
}

fn header_pair(words: &[u32], i: usize) -> Result<(u32, u32)> {
    let first = words[i];
    match words.get(i + 1) {
        Some(&second) if is_header_second(second) => Ok((first, second)),
        _ => Err(Error::corrupt(format!("header word {} is not followed by its sector word", i))),
    }
}

/// One forward record: a document and the phrases it contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRun {
    pub doc: Address,
    pub phrases: Vec<Address>,
}

pub mod forward {
    use super::*;

    pub fn header_first(pos: u32, doc_offset: u32) -> u32 {
        TAG_HEADER_FIRST | ((pos & MAX_PHRASE_POS) << 24) | (doc_offset & DOC_OFFSET_MASK)
    }

    pub fn body(weight: u8, phrase_offset: u32) -> u32 {
        ((weight as u32 & 3) << 28) | (phrase_offset & PHRASE_OFFSET_MASK)
    }

    pub fn doc_offset(header_first: u32) -> u32 {
        header_first & DOC_OFFSET_MASK
    }

    pub fn phrase_offset(body: u32) -> u32 {
        body & PHRASE_OFFSET_MASK
    }

    /// Document owning the header pair that starts at `i`.
    pub fn doc_at(words: &[u32], i: usize) -> Result<Address> {
        let (first, second) = header_pair(words, i)?;
        Ok(Address::new(doc_sector(second), doc_offset(first)))
    }

    /// Encode runs in order. Headers repeat on each new document, each phrase
    /// sector change and after a full block of bodies.
    pub fn encode(runs: &[ForwardRun]) -> Result<Vec<u32>> {
        let mut words = Vec::new();
        for run in runs {
            check_offset(run.doc.offset, DOC_OFFSET_MASK, "document")?;
            let mut sector = None;
            let mut block = 0usize;
            for phrase in &run.phrases {
                check_offset(phrase.offset, PHRASE_OFFSET_MASK, "phrase")?;
                if sector != Some(phrase.sector) || block >= MAX_REGULAR_INDEX_BLOCK {
                    words.push(header_first(0, run.doc.offset));
                    words.push(header_second(phrase.sector, run.doc.sector));
                    sector = Some(phrase.sector);
                    block = 0;
                }
                words.push(body(0, phrase.offset));
                block += 1;
            }
        }
        Ok(words)
    }

    /// Decode a page of words, joining consecutive runs of the same document.
    pub fn decode(words: &[u32]) -> Result<Vec<ForwardRun>> {
        let mut runs: Vec<ForwardRun> = Vec::new();
        let mut current: Option<(Address, u16)> = None;
        let mut i = 0;
        while i < words.len() {
            let word = words[i];
            if is_header_first(word) {
                let (first, second) = header_pair(words, i)?;
                let doc = Address::new(doc_sector(second), doc_offset(first));
                current = Some((doc, phrase_sector(second)));
                if runs.last().map(|r| r.doc) != Some(doc) {
                    runs.push(ForwardRun { doc, phrases: Vec::new() });
                }
                i += 2;
                continue;
            }
            let Some((_, psec)) = current else {
                return Err(Error::corrupt(format!("forward word {} precedes any header", i)));
            };
            if !is_body(word) {
                return Err(Error::corrupt(format!("stray sector word {} in forward page", i)));
            }
            if let Some(run) = runs.last_mut() {
                run.phrases.push(Address::new(psec, phrase_offset(word)));
            }
            i += 1;
        }
        Ok(runs)
    }
}

/// One inverted posting: a phrase occurring in a document at a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    pub phrase: Address,
    pub doc: Address,
    pub pos: u8,
    pub weight: u8,
}

pub mod inverted {
    use super::*;

    pub fn header_first(weight: u8, phrase_offset: u32) -> u32 {
        TAG_HEADER_FIRST | ((weight as u32 & 3) << 28) | (phrase_offset & PHRASE_OFFSET_MASK)
    }

    pub fn body(pos: u8, doc_offset: u32) -> u32 {
        ((pos as u32 & MAX_PHRASE_POS) << 24) | (doc_offset & DOC_OFFSET_MASK)
    }

    pub fn phrase_offset(header_first: u32) -> u32 {
        header_first & PHRASE_OFFSET_MASK
    }

    pub fn doc_offset(body: u32) -> u32 {
        body & DOC_OFFSET_MASK
    }

    /// Phrase and document sector of the header pair starting at `i`.
    pub fn header_at(words: &[u32], i: usize) -> Result<(Address, u16)> {
        let (first, second) = header_pair(words, i)?;
        Ok((Address::new(phrase_sector(second), phrase_offset(first)), doc_sector(second)))
    }

    /// Decode the posting carried by body word `i`, scanning back for its header.
    pub fn posting_at(words: &[u32], i: usize) -> Result<Posting> {
        let word = words[i];
        if !is_body(word) {
            return Err(Error::corrupt(format!("word {} is not a posting body", i)));
        }
        let h = find_header(words, i, MAX_REVERSE_INDEX_BLOCK)?;
        let (phrase, dsec) = header_at(words, h)?;
        Ok(Posting {
            phrase,
            doc: Address::new(dsec, doc_offset(word)),
            pos: pos(word),
            weight: weight(words[h]),
        })
    }

    /// Encode postings in order. Headers repeat on phrase change, document
    /// sector change and after a full block of bodies.
    pub fn encode(postings: &[Posting]) -> Result<Vec<u32>> {
        let mut words = Vec::with_capacity(postings.len() + postings.len() / 4 + 2);
        let mut framed: Option<(Address, u16)> = None;
        let mut block = 0usize;
        for p in postings {
            check_offset(p.phrase.offset, PHRASE_OFFSET_MASK, "phrase")?;
            check_offset(p.doc.offset, DOC_OFFSET_MASK, "document")?;
            if framed != Some((p.phrase, p.doc.sector)) || block >= MAX_REVERSE_INDEX_BLOCK {
                words.push(header_first(p.weight, p.phrase.offset));
                words.push(header_second(p.phrase.sector, p.doc.sector));
                framed = Some((p.phrase, p.doc.sector));
                block = 0;
            }
            words.push(body(p.pos, p.doc.offset));
            block += 1;
        }
        Ok(words)
    }

    pub fn decode(words: &[u32]) -> Result<Vec<Posting>> {
        let mut postings = Vec::with_capacity(words.len());
        let mut header: Option<(Address, u16, u8)> = None;
        let mut i = 0;
        while i < words.len() {
            let word = words[i];
            if is_header_first(word) {
                let (phrase, dsec) = header_at(words, i)?;
                header = Some((phrase, dsec, weight(word)));
                i += 2;
                continue;
            }
            if !is_body(word) {
                return Err(Error::corrupt(format!("stray sector word {} in inverted page", i)));
            }
            let Some((phrase, dsec, weight)) = header else {
                return Err(Error::corrupt(format!("inverted word {} precedes any header", i)));
            };
            postings.push(Posting {
                phrase,
                doc: Address::new(dsec, doc_offset(word)),
                pos: pos(word),
                weight,
            });
            i += 1;
        }
        Ok(postings)
    }
}
