use std::path::PathBuf;
use std::time::Duration;
use crate::core::error::{Error, Result};
use crate::core::types::{MAX_PHRASE_LENGTH, MAX_REGULAR_INDEX_BLOCK};

#[derive(Debug, Clone)]
pub struct Config {
    pub storage_path: PathBuf,
    pub page_size: usize,
    pub block_size: usize,

    // search clamps
    pub max_offset: usize,
    pub max_limit: usize,
    pub default_limit: usize,
    pub lazy_count_threshold: usize,

    // writer
    pub batch_size: usize,
    pub document_sector_limit: u32,
    pub phrase_sector_limit: u32,

    // page cache waits
    pub lock_retry: u32,
    pub lock_retry_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage_path: PathBuf::from("./data"),
            page_size: 16 * 4096,                        // 64KB pages
            block_size: 1024,                            // 64MB of cached pages

            max_offset: 10_000,
            max_limit: 10_000,
            default_limit: 10,
            lazy_count_threshold: 1000,                  // estimate instead of counting above this

            batch_size: 100,                             // pending requests before an implicit flush
            document_sector_limit: 0x00FF_FFFF,          // records per sector, fits 24 offset bits
            phrase_sector_limit: 0x0FFF_FFFF,            // bytes per sector, fits 28 offset bits

            lock_retry: 100,
            lock_retry_interval: Duration::from_micros(500),
        }
    }
}

impl Config {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Config {
            storage_path: path.into(),
            ..Config::default()
        }
    }

    /// Smallest page that still holds one maximum-length phrase record and
    /// several header-framed forward index runs after a split.
    pub fn min_page_size() -> usize {
        let phrase = MAX_PHRASE_LENGTH + 2;
        let forward = (MAX_REGULAR_INDEX_BLOCK + 2) * 4 * 4;
        phrase.max(forward).next_power_of_two()
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size % 4 != 0 {
            return Err(Error::schema(format!("page size {} is not word aligned", self.page_size)));
        }
        if self.page_size < Self::min_page_size() {
            return Err(Error::schema(format!(
                "page size {} is below the minimum of {}",
                self.page_size,
                Self::min_page_size()
            )));
        }
        if self.block_size != 0 && self.block_size < 2 {
            return Err(Error::schema("page cache needs at least two slots".to_string()));
        }
        if self.document_sector_limit == 0 || self.document_sector_limit > 0x00FF_FFFF {
            return Err(Error::schema("document sector limit must fit 24 bits".to_string()));
        }
        if self.phrase_sector_limit == 0 || self.phrase_sector_limit > 0x0FFF_FFFF {
            return Err(Error::schema("phrase sector limit must fit 28 bits".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::schema("batch size must be positive".to_string()));
        }
        Ok(())
    }

    pub fn lock_wait(&self) -> Duration {
        self.lock_retry_interval * self.lock_retry
    }
}
