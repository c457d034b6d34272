//! Plumecoin Blockchain Storage
//!
//! Two halves: append-only block (`blk?????.dat`) and undo (`rev?????.dat`)
//! files managed by [`BlockFileManager`], and the SQLite-backed key-value
//! [`IndexDb`] holding block metadata, the coin and token state, the
//! optional tx/address/spent/timestamp indices, and store flags. The
//! [`DiskStore`] facade owns both and enforces the flush ordering: data
//! files are synced before any index batch commits.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod blockfiles;
pub mod indexdb;
pub mod keys;

pub use blockfiles::BlockFileManager;
pub use indexdb::{IndexDb, WriteBatch};

/// Storage error types
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Consensus encoding error
    #[error("Encoding error: {0}")]
    Encoding(#[from] plumecoin_core::SerError),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored data failed its checksum or framing
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// The requested data was pruned away
    #[error("Block data pruned: {0}")]
    Pruned(String),
}

/// Where a block or undo record sits on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocation {
    /// Block file number
    pub file: u32,
    /// Byte offset of the payload (past the magic and length framing)
    pub offset: u64,
}

/// Aggregate information about one block file pair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFileInfo {
    /// Number of blocks stored
    pub blocks: u32,
    /// Bytes used in the block file
    pub size: u64,
    /// Bytes used in the undo file
    pub undo_size: u64,
    /// Lowest block height in the file
    pub height_first: u64,
    /// Highest block height in the file
    pub height_last: u64,
}

impl BlockFileInfo {
    /// Fold a newly stored block into the aggregate
    pub fn add_block(&mut self, height: u64, added_size: u64) {
        if self.blocks == 0 || height < self.height_first {
            self.height_first = height;
        }
        if self.blocks == 0 || height > self.height_last {
            self.height_last = height;
        }
        self.blocks += 1;
        self.size += added_size;
    }
}

/// Store flags persisted in the index database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFlag {
    TxIndex,
    AddressIndex,
    TokenIndex,
    TimestampIndex,
    SpentIndex,
    PrunedBlockFiles,
}

impl StoreFlag {
    pub fn name(&self) -> &'static str {
        match self {
            StoreFlag::TxIndex => "txindex",
            StoreFlag::AddressIndex => "addressindex",
            StoreFlag::TokenIndex => "tokenindex",
            StoreFlag::TimestampIndex => "timestampindex",
            StoreFlag::SpentIndex => "spentindex",
            StoreFlag::PrunedBlockFiles => "prunedblockfiles",
        }
    }
}

/// The on-disk store: block/undo files plus the index database
pub struct DiskStore {
    files: BlockFileManager,
    index: Arc<IndexDb>,
    data_dir: PathBuf,
}

impl DiskStore {
    /// Open (or create) the store under a data directory
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StorageError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(data_dir.join("blocks"))?;
        let index = Arc::new(IndexDb::open(data_dir.join("index.db"))?);
        let files = BlockFileManager::open(data_dir.join("blocks"), &index)?;
        Ok(DiskStore {
            files,
            index,
            data_dir,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn index(&self) -> &IndexDb {
        &self.index
    }

    /// Shared handle for the coin and token view stacks
    pub fn index_arc(&self) -> Arc<IndexDb> {
        self.index.clone()
    }

    pub fn files(&self) -> &BlockFileManager {
        &self.files
    }

    pub fn files_mut(&mut self) -> &mut BlockFileManager {
        &mut self.files
    }

    /// Operations per index transaction during a flush
    pub const FLUSH_CHUNK_OPS: usize = 8192;

    /// Sync data files, then commit an index batch in chunks.
    ///
    /// The ordering is what makes a crash replayable: block and undo bytes
    /// are durable before any index entry can reference them, and the
    /// head-block markers written at the front of the batch cover a crash
    /// between chunks.
    pub fn flush(&mut self, batch: WriteBatch) -> Result<(), StorageError> {
        self.files.sync_all()?;
        self.index.commit_chunked(batch, Self::FLUSH_CHUNK_OPS)?;
        Ok(())
    }

    /// Delete the block and undo files listed, marking the store pruned
    pub fn prune_files(&mut self, file_numbers: &[u32]) -> Result<(), StorageError> {
        if file_numbers.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        for &n in file_numbers {
            self.files.delete_file_pair(n)?;
            batch.delete(keys::file_info_key(n));
        }
        batch.put_flag(StoreFlag::PrunedBlockFiles, true);
        self.index.commit(batch)?;
        info!("pruned {} block file pair(s)", file_numbers.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_file_info_aggregates() {
        let mut info = BlockFileInfo::default();
        info.add_block(10, 500);
        info.add_block(8, 300);
        info.add_block(12, 200);
        assert_eq!(info.blocks, 3);
        assert_eq!(info.size, 1000);
        assert_eq!(info.height_first, 8);
        assert_eq!(info.height_last, 12);
    }

    #[test]
    fn test_disk_store_open_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        assert!(store.data_dir().join("blocks").is_dir());
        assert!(store.data_dir().join("index.db").exists());
    }
}
