use std::sync::Arc;
use serde_json::Value;
use crate::analysis::tokenizer::Tokenizer;
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::types::PhraseValue;
use crate::query::ast::{Condition, LeafSource, SearchRequest};
use crate::schema::value::{integer_value, string_value};
use crate::schema::{Column, OrderKey, Schema};
use crate::writer::parser::default_phrase;

/// Parses search requests into condition trees.
///
/// `conditions` nests at most two array levels:
/// - `["col", "op", value...]` is a single leaf,
/// - `[[leaf], [leaf], ...]` is an AND of its children,
/// - a child that is itself `[[leaf], [leaf], ...]` is an OR of those leaves.
pub struct QueryParser {
    schema: Arc<Schema>,
    tokenizer: Arc<dyn Tokenizer>,
}

impl QueryParser {
    pub fn new(schema: Arc<Schema>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        QueryParser { schema, tokenizer }
    }

    pub fn parse(&self, request: &Value, config: &Config) -> Result<SearchRequest> {
        let request = request
            .as_object()
            .ok_or_else(|| invalid("request must be an object"))?;

        let offset = clamp(request.get("offset"), 0, config.max_offset)?;
        let limit = clamp(request.get("limit"), config.default_limit, config.max_limit)?;
        let lazy_count = match request.get("lazy_count") {
            None | Some(Value::Null) => true,
            Some(Value::Bool(b)) => *b,
            Some(other) => integer_value(other) != 0,
        };

        Ok(SearchRequest {
            conditions: self.parse_conditions(request.get("conditions"))?,
            order: self.parse_order(request.get("order"))?,
            offset,
            limit,
            lazy_count,
        })
    }

    pub fn parse_conditions(&self, value: Option<&Value>) -> Result<Option<Condition>> {
        let items = match value {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Array(items)) => items,
            Some(_) => return Err(invalid("conditions must be an array")),
        };
        match items.first() {
            None => Ok(None),
            Some(Value::String(_)) => self.parse_leaf(items),
            Some(Value::Array(_)) => {
                let mut current = None;
                for child in items {
                    let node = self.parse_level1(child)?;
                    current = combine(current, node, |l, r| Condition::and(l, r, false));
                }
                Ok(current)
            }
            Some(_) => Err(invalid("condition must start with a column name or a list")),
        }
    }

    fn parse_level1(&self, value: &Value) -> Result<Option<Condition>> {
        let items = value
            .as_array()
            .ok_or_else(|| invalid("condition group must be an array"))?;
        match items.first() {
            None => Ok(None),
            Some(Value::String(_)) => self.parse_leaf(items),
            Some(Value::Array(_)) => {
                let mut current = None;
                for child in items {
                    let leaf = child
                        .as_array()
                        .ok_or_else(|| invalid("OR member must be a condition"))?;
                    let node = self.parse_leaf(leaf)?;
                    current = combine(current, node, Condition::or);
                }
                Ok(current)
            }
            Some(_) => Err(invalid("condition group must hold conditions")),
        }
    }

    fn parse_leaf(&self, items: &[Value]) -> Result<Option<Condition>> {
        if items.len() < 3 {
            return Err(invalid("condition needs a column, an operator and a value"));
        }
        let name = items[0]
            .as_str()
            .ok_or_else(|| invalid("condition column must be a string"))?;
        let op = items[1]
            .as_str()
            .ok_or_else(|| invalid("condition operator must be a string"))?;
        let column = self.schema.column(name);

        if let Some(column) = column.filter(|c| c.is_fulltext() && c.indexed) {
            if op == "equal" {
                return Ok(self.fulltext_chain(column, &items[2]));
            }
        }

        let source = match op {
            "equal" => LeafSource::Equal(phrase_for(name, column, &items[2])),
            "prefix" => LeafSource::Prefix(phrase_for(name, column, &items[2])),
            "between" => {
                let hi = items
                    .get(3)
                    .ok_or_else(|| invalid("between needs two values"))?;
                LeafSource::Between(phrase_for(name, column, &items[2]), phrase_for(name, column, hi))
            }
            other => return Err(invalid(&format!("unknown operator '{}'", other))),
        };
        Ok(Some(Condition::Leaf(source)))
    }

    /// Every word must match, and consecutive words must be adjacent unless
    /// separated by punctuation.
    fn fulltext_chain(&self, column: &Column, value: &Value) -> Option<Condition> {
        let text = string_value(value);
        let mut chain: Option<Condition> = None;
        let mut adjacent = true;
        for token in self.tokenizer.tokenize(&text) {
            if !token.is_phrase() {
                adjacent = false;
                continue;
            }
            let leaf = Condition::Leaf(LeafSource::Equal(PhraseValue::string(column.header(), &token.text)));
            let check = adjacent && !token.before_boundary;
            chain = Some(match chain {
                None => leaf,
                Some(prev) => Condition::and(leaf, prev, check),
            });
            adjacent = true;
        }
        chain
    }

    pub fn parse_order(&self, value: Option<&Value>) -> Result<Vec<OrderKey>> {
        let items = match value {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::Array(items)) => items,
            Some(_) => return Err(invalid("order must be an array")),
        };
        items
            .iter()
            .map(|item| {
                let text = item.as_str().ok_or_else(|| invalid("order entry must be a string"))?;
                let parts: Vec<&str> = text.split(',').map(str::trim).collect();
                if parts.is_empty() || parts.len() > 2 {
                    return Err(invalid("order entry must be 'column[,asc|desc]'"));
                }
                let column = self
                    .schema
                    .column(parts[0])
                    .filter(|c| c.sort.is_some())
                    .ok_or_else(|| invalid(&format!("'{}' is not a sort key", parts[0])))?;
                let descending = match parts.get(1) {
                    None | Some(&"asc") => false,
                    Some(&"desc") => true,
                    Some(other) => return Err(invalid(&format!("unknown direction '{}'", other))),
                };
                Ok(OrderKey { column: column.clone(), descending })
            })
            .collect()
    }
}

/// Phrase a condition value maps to for one column.
fn phrase_for(name: &str, column: Option<&Column>, value: &Value) -> PhraseValue {
    match column {
        Some(c) if c.indexed && c.is_integer() => PhraseValue::integer(c.header(), integer_value(value)),
        Some(c) if c.indexed => PhraseValue::string(c.header(), &string_value(value)),
        Some(c) => default_phrase(c.id, name, value),
        None => default_phrase(0, name, value),
    }
}

fn combine(
    current: Option<Condition>,
    node: Option<Condition>,
    join: impl FnOnce(Condition, Condition) -> Condition,
) -> Option<Condition> {
    match (current, node) {
        (Some(right), Some(left)) => Some(join(left, right)),
        (current, None) => current,
        (None, node) => node,
    }
}

fn clamp(value: Option<&Value>, default: usize, max: usize) -> Result<usize> {
    let n = match value {
        None | Some(Value::Null) => return Ok(default.min(max)),
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(_) => return Err(invalid("offset and limit must be numbers")),
    };
    Ok((n.max(0) as usize).min(max))
}

fn invalid(detail: &str) -> Error {
    Error::request(format!("failed to parse request: {}", detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::tokenizer::StandardTokenizer;
    use crate::core::error::ErrorKind;
    use serde_json::json;

    fn parser() -> QueryParser {
        let schema = Schema::from_settings(&json!({
            "columns": {"id": "pkey", "rank": "int", "title": "string", "body": "fulltext", "memo": "string,noindex"},
            "sortkeys": ["rank,desc"]
        }))
        .unwrap();
        QueryParser::new(Arc::new(schema), Arc::new(StandardTokenizer::default()))
    }

    fn title(text: &str) -> Condition {
        let p = parser();
        let header = p.schema.column("title").unwrap().header();
        Condition::Leaf(LeafSource::Equal(PhraseValue::string(header, text)))
    }

    #[test]
    fn test_defaults_and_clamps() {
        let config = Config::default();
        let req = parser().parse(&json!({}), &config).unwrap();
        assert!(req.conditions.is_none());
        assert_eq!((req.offset, req.limit), (0, config.default_limit));
        assert!(req.lazy_count);

        let req = parser()
            .parse(&json!({"offset": -4, "limit": 999_999, "lazy_count": false, "conditions": []}), &config)
            .unwrap();
        assert_eq!((req.offset, req.limit), (0, config.max_limit));
        assert!(!req.lazy_count);
        assert!(req.conditions.is_none());
    }

    #[test]
    fn test_single_leaf_and_groups() {
        let p = parser();
        let single = p.parse_conditions(Some(&json!(["title", "equal", "x"]))).unwrap();
        assert_eq!(single, Some(title("x")));

        let and = p
            .parse_conditions(Some(&json!([["title", "equal", "a"], ["title", "equal", "b"]])))
            .unwrap()
            .unwrap();
        assert_eq!(and, Condition::and(title("b"), title("a"), false));

        let or = p
            .parse_conditions(Some(&json!([[["title", "equal", "a"], ["title", "equal", "b"]]])))
            .unwrap()
            .unwrap();
        assert_eq!(or, Condition::or(title("b"), title("a")));
        assert_eq!(or.leaves(), 2);
    }

    #[test]
    fn test_value_mapping() {
        let p = parser();
        let rank = p.schema.column("rank").unwrap().header();
        let leaf = p.parse_conditions(Some(&json!(["rank", "equal", "12"]))).unwrap();
        assert_eq!(leaf, Some(Condition::Leaf(LeafSource::Equal(PhraseValue::integer(rank, 12)))));

        let unknown = p.parse_conditions(Some(&json!(["color", "equal", "red"]))).unwrap();
        let expected = PhraseValue::string(0, "color\tred");
        assert_eq!(unknown, Some(Condition::Leaf(LeafSource::Equal(expected))));

        let between = p
            .parse_conditions(Some(&json!(["title", "between", "a", "c"])))
            .unwrap()
            .unwrap();
        assert!(matches!(between, Condition::Leaf(LeafSource::Between(_, _))));
    }

    #[test]
    fn test_fulltext_equal_builds_adjacent_chain() {
        let p = parser();
        let header = p.schema.column("body").unwrap().header();
        let word = |w: &str| Condition::Leaf(LeafSource::Equal(PhraseValue::string(header, w)));

        let chain = p.parse_conditions(Some(&json!(["body", "equal", "aaa bbb"]))).unwrap().unwrap();
        assert_eq!(chain, Condition::and(word("bbb"), word("aaa"), true));

        let split = p.parse_conditions(Some(&json!(["body", "equal", "aaa, bbb"]))).unwrap().unwrap();
        assert_eq!(split, Condition::and(word("bbb"), word("aaa"), false));
    }

    #[test]
    fn test_order_parsing() {
        let p = parser();
        let order = p.parse_order(Some(&json!(["rank,desc"]))).unwrap();
        assert_eq!(order.len(), 1);
        assert!(order[0].descending);
        assert!(!p.parse_order(Some(&json!(["rank"]))).unwrap()[0].descending);

        for bad in [json!("rank"), json!(["title"]), json!(["nope"]), json!([1]), json!(["rank,up"])] {
            let err = p.parse_order(Some(&bad)).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidRequest);
            assert!(err.context.starts_with("failed to parse request"));
        }
    }

    #[test]
    fn test_malformed_conditions() {
        let p = parser();
        assert!(p.parse_conditions(Some(&json!("title"))).is_err());
        assert!(p.parse_conditions(Some(&json!(["title", "equal"]))).is_err());
        assert!(p.parse_conditions(Some(&json!(["title", "like", "x"]))).is_err());
        assert!(p.parse_conditions(Some(&json!(["title", "between", "x"]))).is_err());
    }
}
