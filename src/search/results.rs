use serde::{Deserialize, Serialize};

/// Reply to a search request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub count: usize,
    pub result: Vec<u64>,
    pub error: Option<String>,
}

impl SearchResponse {
    pub fn new(count: usize, result: Vec<u64>) -> Self {
        SearchResponse { count, result, error: None }
    }

    pub fn empty() -> Self {
        SearchResponse::new(0, Vec::new())
    }

    pub fn failure(message: impl Into<String>) -> Self {
        SearchResponse {
            count: 0,
            result: Vec::new(),
            error: Some(message.into()),
        }
    }
}

/// Reply to an index request or an unknown command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub error: bool,
    pub message: String,
}

impl CommandResponse {
    pub fn success(message: impl Into<String>) -> Self {
        CommandResponse { error: false, message: message.into() }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        CommandResponse { error: true, message: message.into() }
    }
}
