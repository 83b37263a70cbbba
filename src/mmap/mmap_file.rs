use std::fs::OpenOptions;
use std::path::Path;
use memmap2::{Mmap, MmapMut, MmapOptions};
use crate::core::error::{Error, Result};

enum Mapping {
    Read(Mmap),
    Write(MmapMut),
}

/// Memory-mapped window over one page of a page file.
pub struct MmapFile {
    mapping: Mapping,
    pub offset: u64,
    pub len: usize,
}

impl MmapFile {
    pub fn open_read_only<P: AsRef<Path>>(path: P, offset: u64, len: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).open(path)?;
        if file.metadata()?.len() < offset + len as u64 {
            return Err(Error::invalid_address(format!(
                "{} has no page at byte {}",
                path.display(),
                offset
            )));
        }

        let mmap = unsafe { MmapOptions::new().offset(offset).len(len).map(&file)? };
        Ok(MmapFile { mapping: Mapping::Read(mmap), offset, len })
    }

    /// Map for writing, growing the file to cover the window.
    pub fn open_read_write<P: AsRef<Path>>(path: P, offset: u64, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        let end = offset + len as u64;
        if file.metadata()?.len() < end {
            file.set_len(end)?;
        }

        let mmap = unsafe { MmapOptions::new().offset(offset).len(len).map_mut(&file)? };
        Ok(MmapFile { mapping: Mapping::Write(mmap), offset, len })
    }

    pub fn read_only(&self) -> bool {
        matches!(self.mapping, Mapping::Read(_))
    }

    pub fn data(&self) -> &[u8] {
        match &self.mapping {
            Mapping::Read(m) => &m[..],
            Mapping::Write(m) => &m[..],
        }
    }

    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        match &mut self.mapping {
            Mapping::Read(_) => Err(Error::state("mapping is read-only")),
            Mapping::Write(m) => Ok(&mut m[..]),
        }
    }

    pub fn flush(&self) -> Result<()> {
        if let Mapping::Write(m) = &self.mapping {
            m.flush()?;
        }
        Ok(())
    }
}
