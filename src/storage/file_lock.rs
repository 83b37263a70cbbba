use std::fs::{File, OpenOptions};
use crate::core::error::{Error, Result};
use crate::storage::layout::StorageLayout;

/// Single indexer per storage directory.
pub struct FileLock {
    pub file: File,
}

impl FileLock {
    pub fn acquire(storage: &StorageLayout) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(storage.lock_path())?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            use libc::{flock, LOCK_EX, LOCK_NB};

            let fd = file.as_raw_fd();
            unsafe {
                if flock(fd, LOCK_EX | LOCK_NB) != 0 {
                    return Err(Error::state(format!(
                        "storage {} is locked by another indexer",
                        storage.base_dir.display()
                    )));
                }
            }
        }

        Ok(FileLock { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            use libc::{flock, LOCK_UN};

            let fd = self.file.as_raw_fd();
            unsafe {
                flock(fd, LOCK_UN);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    #[test]
    fn second_indexer_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path(), 4096).unwrap();
        let first = FileLock::acquire(&layout).unwrap();
        let err = FileLock::acquire(&layout).err().unwrap();
        assert_eq!(err.kind, ErrorKind::InvalidState);
        drop(first);
        assert!(FileLock::acquire(&layout).is_ok());
    }
}
