pub mod codec;
pub mod tree;
pub mod document;
pub mod phrase;
pub mod forward;
pub mod inverted;
