use std::fs;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, Result};
use crate::core::types::Address;
use crate::storage::layout::StorageLayout;

const HEADER_MAGIC: u32 = 0x5459_5048;
const HEADER_VERSION: u32 = 1;

/// Persisted state of one ordered paged tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeState {
    pub root: Vec<u8>,      // encoded root info entry
    pub next_data: u32,
    pub next_info: u32,
}

/// Contents of `shm.dat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineHeader {
    pub magic: u32,
    pub version: u32,
    pub page_size: usize,
    pub block_size: usize,
    pub generation: u64,
    pub documents: TreeState,
    pub phrases: TreeState,
    pub forward: TreeState,
    pub inverted: TreeState,
    pub document_heap: Address,
    pub phrase_heap: Address,
    pub saved_at: DateTime<Utc>,
}

impl EngineHeader {
    pub fn new(page_size: usize, block_size: usize) -> Self {
        EngineHeader {
            magic: HEADER_MAGIC,
            version: HEADER_VERSION,
            page_size,
            block_size,
            generation: 0,
            documents: TreeState::default(),
            phrases: TreeState::default(),
            forward: TreeState::default(),
            inverted: TreeState::default(),
            document_heap: Address::new(0, 0),
            phrase_heap: Address::new(0, 0),
            saved_at: Utc::now(),
        }
    }

    /// Load header from disk, `None` for a fresh directory.
    pub fn load(storage: &StorageLayout) -> Result<Option<Self>> {
        let path = storage.header_path();
        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read(&path)?;
        if data.len() < 4 {
            return Err(Error::corrupt(format!("{} is truncated", path.display())));
        }
        let (checksum, payload) = data.split_at(4);
        let expected = u32::from_le_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);
        if crc32fast::hash(payload) != expected {
            return Err(Error::corrupt(format!("{} checksum mismatch", path.display())));
        }

        let header: EngineHeader = bincode::deserialize(payload)?;
        if header.magic != HEADER_MAGIC || header.version != HEADER_VERSION {
            return Err(Error::corrupt(format!("{} is not an index header", path.display())));
        }
        Ok(Some(header))
    }

    /// Save header to disk, replacing the previous one atomically.
    pub fn save(&mut self, storage: &StorageLayout) -> Result<()> {
        self.saved_at = Utc::now();
        let payload = bincode::serialize(self)?;
        let mut data = Vec::with_capacity(payload.len() + 4);
        data.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        data.extend_from_slice(&payload);

        let path = storage.header_path();
        let tmp = path.with_extension("dat.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}
