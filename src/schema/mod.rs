pub mod schema;
pub mod value;

pub use schema::{Column, ColumnKind, OrderKey, Schema, SortSpec};
