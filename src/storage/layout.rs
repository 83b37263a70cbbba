use std::fs;
use std::path::{Path, PathBuf};
use crate::core::error::Result;
use crate::storage::page_cache::PageKind;
use crate::core::types::MAX_FILE_SIZE;

/// Directory structure for data files
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base_dir: PathBuf,
    pub page_size: usize,
    pub page_carry: u32,        // pages per data file
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>, page_size: usize) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;

        let page_carry = ((MAX_FILE_SIZE / page_size as u64).max(1)).min(u32::MAX as u64) as u32;
        Ok(StorageLayout {
            base_dir,
            page_size,
            page_carry,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `{stem}.dat.{fileno:08x}.{sector:04x}`
    pub fn page_file(&self, kind: PageKind, sector: u16, pageno: u32) -> PathBuf {
        let fileno = pageno / self.page_carry;
        self.base_dir
            .join(format!("{}.dat.{:08x}.{:04x}", kind.stem(), fileno, sector))
    }

    /// Byte offset of a page inside its data file.
    pub fn page_offset(&self, pageno: u32) -> u64 {
        (pageno % self.page_carry) as u64 * self.page_size as u64
    }

    pub fn header_path(&self) -> PathBuf {
        self.base_dir.join("shm.dat")
    }

    pub fn schema_path(&self) -> PathBuf {
        self.base_dir.join("info.dat")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base_dir.join("indexer.lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_files_roll_over() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path(), 65536).unwrap();
        assert_eq!(layout.page_carry, 15258);

        let first = layout.page_file(PageKind::DocumentData, 3, 0);
        assert!(first.ends_with("ddata.dat.00000000.0003"));
        let rolled = layout.page_file(PageKind::DocumentData, 3, 15258);
        assert!(rolled.ends_with("ddata.dat.00000001.0003"));
        assert_eq!(layout.page_offset(15259), 65536);
    }
}
