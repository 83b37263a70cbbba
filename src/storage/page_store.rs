use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;
use parking_lot::Mutex;
use tracing::debug;
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::mmap::mmap_file::MmapFile;
use crate::storage::layout::StorageLayout;
use crate::storage::page_cache::{AccessMode, PageCache, PageGuard, PageKey, PageSink};

/// A loaded page: a cache slot, or a direct mapping when no cache is attached.
pub enum PageHandle {
    Cached(PageGuard),
    Mapped { key: PageKey, map: MmapFile },
}

impl PageHandle {
    pub fn key(&self) -> PageKey {
        match self {
            PageHandle::Cached(guard) => guard.key(),
            PageHandle::Mapped { key, .. } => *key,
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match self {
            PageHandle::Cached(guard) => guard.read(f),
            PageHandle::Mapped { map, .. } => f(map.data()),
        }
    }

    pub fn write<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        match self {
            PageHandle::Cached(guard) => guard.write(f),
            PageHandle::Mapped { map, .. } => Ok(f(map.data_mut()?)),
        }
    }
}

/// Page files on disk, fronted by an optional shared [`PageCache`].
pub struct PageStore {
    layout: StorageLayout,
    cache: Option<Arc<PageCache>>,
    files: Mutex<HashMap<PathBuf, Arc<File>>>,
}

impl PageStore {
    pub fn new(layout: StorageLayout, config: &Config) -> Self {
        let cache = (config.block_size > 0).then(|| {
            Arc::new(PageCache::new(config.block_size, config.page_size, config.lock_wait()))
        });
        PageStore {
            layout,
            cache,
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn page_size(&self) -> usize {
        self.layout.page_size
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn cache(&self) -> Option<&Arc<PageCache>> {
        self.cache.as_ref()
    }

    fn file(&self, path: PathBuf) -> Result<Arc<File>> {
        let mut files = self.files.lock();
        if let Some(file) = files.get(&path) {
            return Ok(Arc::clone(file));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::page_io(format!("{}: {}", path.display(), e)))?;
        let file = Arc::new(file);
        files.insert(path, Arc::clone(&file));
        Ok(file)
    }

    fn read_from_file(&self, key: &PageKey, buf: &mut [u8]) -> Result<()> {
        let path = self.layout.page_file(key.kind, key.sector, key.pageno);
        let offset = self.layout.page_offset(key.pageno);
        let file = self.file(path)?;
        if file.metadata()?.len() < offset + buf.len() as u64 {
            return Err(Error::invalid_address(format!("page {:?} was never written", key)));
        }
        file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_to_file(&self, key: &PageKey, data: &[u8]) -> Result<()> {
        let path = self.layout.page_file(key.kind, key.sector, key.pageno);
        let offset = self.layout.page_offset(key.pageno);
        let file = self.file(path)?;
        file.write_all_at(data, offset)?;
        Ok(())
    }

    pub fn load_page(&self, key: PageKey, mode: AccessMode) -> Result<PageHandle> {
        match &self.cache {
            Some(cache) => {
                let guard = cache.load_or_fill(key, mode, self, |buf| self.read_from_file(&key, buf))?;
                Ok(PageHandle::Cached(guard))
            }
            None => {
                let path = self.layout.page_file(key.kind, key.sector, key.pageno);
                let offset = self.layout.page_offset(key.pageno);
                let map = match mode {
                    AccessMode::ReadOnly => MmapFile::open_read_only(path, offset, self.page_size())?,
                    AccessMode::ReadWrite => MmapFile::open_read_write(path, offset, self.page_size())?,
                };
                Ok(PageHandle::Mapped { key, map })
            }
        }
    }

    /// Release a handle, recording any writes.
    pub fn save_page(&self, handle: PageHandle) -> Result<()> {
        match handle {
            PageHandle::Cached(guard) => {
                guard.save();
                Ok(())
            }
            PageHandle::Mapped { map, .. } => map.flush(),
        }
    }

    /// Release a handle without flush intent.
    pub fn clear_page(&self, handle: PageHandle) {
        match handle {
            PageHandle::Cached(guard) => guard.clear(),
            PageHandle::Mapped { .. } => {}
        }
    }

    /// Write a brand-new page (zero padded) and seed the cache with it.
    pub fn add_page(&self, key: PageKey, bytes: &[u8]) -> Result<()> {
        let page_size = self.page_size();
        if bytes.len() > page_size {
            return Err(Error::state(format!(
                "page {:?} content of {} bytes exceeds page size {}",
                key,
                bytes.len(),
                page_size
            )));
        }
        let mut page = vec![0u8; page_size];
        page[..bytes.len()].copy_from_slice(bytes);
        self.write_to_file(&key, &page)?;

        if let Some(cache) = &self.cache {
            cache.acquire_new(key, AccessMode::ReadOnly, &page, self)?.clear();
        }
        debug!(?key, "added page");
        Ok(())
    }

    /// Read a page under a read-only hold.
    pub fn read_page<R>(&self, key: PageKey, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let handle = self.load_page(key, AccessMode::ReadOnly)?;
        let out = handle.read(f);
        self.clear_page(handle);
        Ok(out)
    }

    /// Mutate a page under a write hold and save it.
    pub fn update_page<R>(&self, key: PageKey, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut handle = self.load_page(key, AccessMode::ReadWrite)?;
        let out = handle.write(f)?;
        self.save_page(handle)?;
        Ok(out)
    }

    /// Persist every dirty cached page.
    pub fn flush(&self) -> Result<usize> {
        let written = match &self.cache {
            Some(cache) => cache.flush(self)?,
            None => 0,
        };
        for file in self.files.lock().values() {
            file.sync_data()?;
        }
        Ok(written)
    }
}

impl PageSink for PageStore {
    fn write_page(&self, key: &PageKey, data: &[u8]) -> Result<()> {
        self.write_to_file(key, data)
    }
}
