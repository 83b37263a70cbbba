use std::collections::HashSet;
use std::sync::Arc;
use serde_json::Value;
use tracing::warn;
use crate::analysis::tokenizer::Tokenizer;
use crate::core::error::{Error, Result};
use crate::core::types::{
    ATTR_TYPE_STRING, DocId, DocumentRecord, MAX_DOC_PHRASE, MAX_PHRASE_LENGTH, PhraseValue, attr_header,
};
use crate::schema::value::{integer_value, key_value, string_value};
use crate::schema::{Column, Schema};

/// Fulltext positions are bucketed into this many slots.
const POSITION_SLOTS: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPhrase {
    pub value: PhraseValue,
    pub pos: u8,
}

/// A parsed document ready for the apply pipeline.
#[derive(Debug, Clone)]
pub struct IndexRequest {
    pub record: DocumentRecord,
    pub phrases: Vec<RequestPhrase>,
}

impl IndexRequest {
    pub fn id(&self) -> DocId {
        self.record.id
    }
}

/// Turns attribute maps into index requests.
pub struct RequestParser {
    schema: Arc<Schema>,
    tokenizer: Arc<dyn Tokenizer>,
}

impl RequestParser {
    pub fn new(schema: Arc<Schema>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        RequestParser { schema, tokenizer }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    pub fn parse(&self, data: &Value) -> Result<IndexRequest> {
        let attrs = data
            .as_object()
            .ok_or_else(|| Error::request("document data must be an object"))?;

        let pkey = self.schema.primary_key()?;
        let raw = attrs
            .get(&pkey.name)
            .ok_or_else(|| Error::request(format!("primary key '{}' is missing", pkey.name)))?;
        let id = key_value(raw).ok_or_else(|| {
            Error::request(format!("primary key {} is not an unsigned 64-bit integer", raw))
        })?;

        let sortkey = self
            .schema
            .pack_sortkey(|column| attrs.get(&column.name).map(integer_value).unwrap_or(0));

        let mut phrases = Vec::new();
        for (name, value) in attrs {
            match self.schema.column(name) {
                None => default_phrases(&mut phrases, name, value),
                Some(column) if !column.indexed => {}
                Some(column) if column.is_fulltext() => self.fulltext_phrases(&mut phrases, column, value),
                Some(column) => attr_phrases(&mut phrases, column, value),
            }
        }

        let mut seen = HashSet::new();
        phrases.retain(|p: &RequestPhrase| seen.insert((p.value.clone(), p.pos)));
        if phrases.len() > MAX_DOC_PHRASE {
            warn!(id, phrases = phrases.len(), "document has too many phrases, truncated");
            phrases.truncate(MAX_DOC_PHRASE);
        }

        Ok(IndexRequest {
            record: DocumentRecord::new(DocId(id), sortkey),
            phrases,
        })
    }

    fn fulltext_phrases(&self, out: &mut Vec<RequestPhrase>, column: &Column, value: &Value) {
        let texts: Vec<String> = match value {
            Value::Array(items) => items.iter().map(string_value).collect(),
            other => vec![string_value(other)],
        };
        let words: Vec<String> = texts
            .iter()
            .flat_map(|text| self.tokenizer.tokenize(text))
            .filter(|token| token.is_phrase())
            .map(|token| token.text)
            .collect();

        let word_block = 1 + words.len() / POSITION_SLOTS;
        for (p, word) in words.iter().enumerate() {
            out.push(RequestPhrase {
                value: PhraseValue::string(column.header(), word),
                pos: (p / word_block) as u8,
            });
        }
    }
}

fn attr_phrases(out: &mut Vec<RequestPhrase>, column: &Column, value: &Value) {
    if let Value::Array(items) = value {
        for item in items {
            attr_phrases(out, column, item);
        }
        return;
    }
    let phrase = if column.is_integer() {
        PhraseValue::integer(column.header(), integer_value(value))
    } else {
        PhraseValue::string(column.header(), &string_value(value))
    };
    push_checked(out, phrase);
}

/// Attributes outside the schema are indexed as `"name\tvalue"` under header 0.
fn default_phrases(out: &mut Vec<RequestPhrase>, name: &str, value: &Value) {
    if let Value::Array(items) = value {
        for item in items {
            default_phrases(out, name, item);
        }
        return;
    }
    push_checked(out, default_phrase(0, name, value));
}

/// `"name\tvalue"` phrase used for unknown and non-indexed attributes.
pub fn default_phrase(id: u8, name: &str, value: &Value) -> PhraseValue {
    let text = format!("{}\t{}", name, string_value(value));
    PhraseValue::string(attr_header(id, ATTR_TYPE_STRING), &text)
}

fn push_checked(out: &mut Vec<RequestPhrase>, value: PhraseValue) {
    if value.payload().len() > MAX_PHRASE_LENGTH {
        warn!(len = value.payload().len(), "phrase exceeds the length limit, skipped");
        return;
    }
    out.push(RequestPhrase { value, pos: 0 });
}

/// Parse a JSON-lines document stream; blank lines are skipped.
pub fn parse_lines(parser: &RequestParser, lines: &[String]) -> Vec<Result<IndexRequest>> {
    use rayon::prelude::*;

    lines
        .par_iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let data: Value = serde_json::from_str(line)?;
            let data = match data.get("data") {
                Some(inner) if data.get("command").is_some() => inner.clone(),
                _ => data,
            };
            parser.parse(&data)
        })
        .collect()
}
