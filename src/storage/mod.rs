pub mod layout;
pub mod file_lock;
pub mod header;
pub mod page_cache;
pub mod page_store;
