use crate::analysis::token::Token;
use crate::core::types::MAX_PHRASE_LENGTH;
use unicode_segmentation::UnicodeSegmentation;

pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<Token>;

    fn name(&self) -> &str;
}

/// Standard Unicode tokenizer
#[derive(Clone)]
pub struct StandardTokenizer {
    pub lowercase: bool,
    pub max_token_length: usize,
}

impl Default for StandardTokenizer {
    fn default() -> Self {
        StandardTokenizer {
            lowercase: true,
            max_token_length: MAX_PHRASE_LENGTH,
        }
    }
}

impl Tokenizer for StandardTokenizer {
    fn tokenize(&self, text: &str) -> Vec<Token> {
        let mut tokens: Vec<Token> = Vec::new();
        let mut position = 0u32;
        let mut pending_boundary = false;

        for (offset, segment) in text.split_word_bound_indices() {
            if segment.chars().all(char::is_whitespace) {
                continue;
            }

            if !segment.chars().any(char::is_alphanumeric) {
                // Punctuation breaks adjacency on both sides.
                if let Some(prev) = tokens.iter_mut().rev().find(|t| t.index) {
                    prev.after_boundary = true;
                }
                tokens.push(Token::separator(segment.to_string(), offset));
                pending_boundary = true;
                continue;
            }

            let surface = if self.lowercase {
                segment.to_lowercase()
            } else {
                segment.to_string()
            };
            let mut token = Token::word(surface, position, offset);
            token.before_boundary = pending_boundary;
            if token.length > self.max_token_length {
                token.ignore = true;
            } else {
                position += 1;
            }
            pending_boundary = false;
            tokens.push(token);
        }

        tokens
    }

    fn name(&self) -> &str {
        "standard"
    }
}
