pub mod cursor;
pub mod executor;
pub mod results;

pub use executor::Searcher;
pub use results::{CommandResponse, SearchResponse};
