pub mod ast;
pub mod parser;

pub use ast::{Condition, LeafSource, SearchRequest};
pub use parser::QueryParser;
