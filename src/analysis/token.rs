use serde::{Serialize, Deserialize};

/// Token produced by a tokenizer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub text: String,          // Normalized surface
    pub position: u32,         // Index among indexable tokens
    pub offset: usize,         // Byte offset in original text
    pub length: usize,         // Surface length in bytes
    pub index: bool,           // Word-like segment
    pub ignore: bool,          // Never becomes a phrase
    pub before_boundary: bool, // A separator precedes this token
    pub after_boundary: bool,  // A separator follows this token
}

impl Token {
    pub fn word(text: String, position: u32, offset: usize) -> Self {
        let length = text.len();
        Token {
            text,
            position,
            offset,
            length,
            index: true,
            ignore: false,
            before_boundary: false,
            after_boundary: false,
        }
    }

    pub fn separator(text: String, offset: usize) -> Self {
        let length = text.len();
        Token {
            text,
            position: 0,
            offset,
            length,
            index: false,
            ignore: true,
            before_boundary: false,
            after_boundary: false,
        }
    }

    /// True when the token should be stored as a phrase.
    pub fn is_phrase(&self) -> bool {
        self.index && !self.ignore
    }
}
