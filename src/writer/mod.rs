pub mod parser;
pub mod index_writer;
pub mod batch;
