//! Block and Undo File Management
//!
//! Blocks append to `blk?????.dat`, their undo records to the parallel
//! `rev?????.dat`. Every record is framed `magic(4) ‖ size(4 LE) ‖ bytes`;
//! undo records additionally carry a trailing
//! `sha256d(prev_block_hash ‖ undo_bytes)` checksum so a torn write is
//! detected before a disconnect trusts it.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info};

use plumecoin_core::ser::sha256d;
use plumecoin_core::Hash;

use crate::indexdb::{IndexDb, WriteBatch};
use crate::{keys, BlockFileInfo, BlockLocation, StorageError};

/// Frame magic for block and undo records
pub const BLOCK_FILE_MAGIC: [u8; 4] = [0x50, 0x4c, 0x4d, 0xc0];

/// Rotation threshold for block files
pub const MAX_BLOCKFILE_SIZE: u64 = 32 * 1024 * 1024;

/// Manages the numbered block/undo file pairs in one directory
pub struct BlockFileManager {
    dir: PathBuf,
    current_file: u32,
    infos: HashMap<u32, BlockFileInfo>,
    dirty_files: HashSet<u32>,
}

impl BlockFileManager {
    /// Open the manager over a directory, restoring file info from the
    /// index database
    pub fn open<P: AsRef<Path>>(dir: P, index: &IndexDb) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut infos = HashMap::new();
        let mut current_file = 0;
        for (key, value) in index.scan_prefix(&keys::FILE_INFO_PREFIX)? {
            if key.len() != 5 {
                continue;
            }
            let mut n_bytes = [0u8; 4];
            n_bytes.copy_from_slice(&key[1..5]);
            let n = u32::from_be_bytes(n_bytes);
            let info: BlockFileInfo = serde_json::from_slice(&value)?;
            current_file = current_file.max(n);
            infos.insert(n, info);
        }
        debug!(
            "block file manager: {} file(s), current {}",
            infos.len(),
            current_file
        );
        Ok(BlockFileManager {
            dir,
            current_file,
            infos,
            dirty_files: HashSet::new(),
        })
    }

    fn block_path(&self, file: u32) -> PathBuf {
        self.dir.join(format!("blk{file:05}.dat"))
    }

    fn undo_path(&self, file: u32) -> PathBuf {
        self.dir.join(format!("rev{file:05}.dat"))
    }

    pub fn current_file(&self) -> u32 {
        self.current_file
    }

    pub fn info(&self, file: u32) -> Option<&BlockFileInfo> {
        self.infos.get(&file)
    }

    /// Persist every file-info record into a batch
    pub fn file_info_batch(&self, batch: &mut WriteBatch) -> Result<(), StorageError> {
        for (n, info) in &self.infos {
            batch.put_json(keys::file_info_key(*n), info)?;
        }
        Ok(())
    }

    /// Append a block, rotating to a fresh file when the current one is full
    pub fn write_block(
        &mut self,
        block_bytes: &[u8],
        height: u64,
    ) -> Result<BlockLocation, StorageError> {
        let framed = 8 + block_bytes.len() as u64;
        let rotate = self
            .infos
            .get(&self.current_file)
            .map(|info| info.blocks > 0 && info.size + framed > MAX_BLOCKFILE_SIZE)
            .unwrap_or(false);
        if rotate {
            self.current_file += 1;
            info!("rotating to block file {}", self.current_file);
        }
        let file_no = self.current_file;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.block_path(file_no))?;
        let start = file.seek(SeekFrom::End(0))?;
        file.write_all(&BLOCK_FILE_MAGIC)?;
        file.write_u32::<LittleEndian>(block_bytes.len() as u32)?;
        file.write_all(block_bytes)?;

        self.infos.entry(file_no).or_default().add_block(height, framed);
        self.dirty_files.insert(file_no);
        Ok(BlockLocation {
            file: file_no,
            offset: start + 8,
        })
    }

    /// Read a block's bytes back from its location
    pub fn read_block(&self, loc: &BlockLocation) -> Result<Vec<u8>, StorageError> {
        let path = self.block_path(loc.file);
        let mut file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::Pruned(format!("block file {} missing", loc.file))
            } else {
                StorageError::Io(e)
            }
        })?;
        file.seek(SeekFrom::Start(loc.offset - 8))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if magic != BLOCK_FILE_MAGIC {
            return Err(StorageError::Corrupt(format!(
                "bad magic in {}",
                path.display()
            )));
        }
        let size = file.read_u32::<LittleEndian>()? as usize;
        let mut bytes = vec![0u8; size];
        file.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Append an undo record to the rev file paired with `file`.
    ///
    /// `prev_hash` is the predecessor of the block being undone; it salts
    /// the checksum so a record cannot be replayed against the wrong block.
    pub fn write_undo(
        &mut self,
        file_no: u32,
        prev_hash: &Hash,
        undo_bytes: &[u8],
    ) -> Result<u64, StorageError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.undo_path(file_no))?;
        let start = file.seek(SeekFrom::End(0))?;
        file.write_all(&BLOCK_FILE_MAGIC)?;
        file.write_u32::<LittleEndian>(undo_bytes.len() as u32)?;
        file.write_all(undo_bytes)?;

        let mut salted = Vec::with_capacity(32 + undo_bytes.len());
        salted.extend_from_slice(prev_hash);
        salted.extend_from_slice(undo_bytes);
        file.write_all(&sha256d(&salted))?;

        let info = self.infos.entry(file_no).or_default();
        info.undo_size += 8 + undo_bytes.len() as u64 + 32;
        self.dirty_files.insert(file_no);
        Ok(start + 8)
    }

    /// Read an undo record and verify its checksum
    pub fn read_undo(
        &self,
        file_no: u32,
        offset: u64,
        prev_hash: &Hash,
    ) -> Result<Vec<u8>, StorageError> {
        let path = self.undo_path(file_no);
        let mut file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::Pruned(format!("undo file {file_no} missing"))
            } else {
                StorageError::Io(e)
            }
        })?;
        file.seek(SeekFrom::Start(offset - 8))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if magic != BLOCK_FILE_MAGIC {
            return Err(StorageError::Corrupt(format!(
                "bad magic in {}",
                path.display()
            )));
        }
        let size = file.read_u32::<LittleEndian>()? as usize;
        let mut bytes = vec![0u8; size];
        file.read_exact(&mut bytes)?;
        let mut checksum = [0u8; 32];
        file.read_exact(&mut checksum)?;

        let mut salted = Vec::with_capacity(32 + bytes.len());
        salted.extend_from_slice(prev_hash);
        salted.extend_from_slice(&bytes);
        if sha256d(&salted) != checksum {
            return Err(StorageError::Corrupt(format!(
                "undo checksum mismatch in {}",
                path.display()
            )));
        }
        Ok(bytes)
    }

    /// fsync every file touched since the last sync
    pub fn sync_all(&mut self) -> Result<(), StorageError> {
        for file_no in self.dirty_files.drain() {
            for path in [
                self.dir.join(format!("blk{file_no:05}.dat")),
                self.dir.join(format!("rev{file_no:05}.dat")),
            ] {
                if path.exists() {
                    File::open(&path)?.sync_all()?;
                }
            }
        }
        Ok(())
    }

    /// Remove a block/undo file pair and its in-memory info
    pub fn delete_file_pair(&mut self, file_no: u32) -> Result<(), StorageError> {
        for path in [self.block_path(file_no), self.undo_path(file_no)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
        self.infos.remove(&file_no);
        self.dirty_files.remove(&file_no);
        Ok(())
    }

    /// Files (excluding the current one) whose every block is below `height`
    pub fn files_entirely_below(&self, height: u64) -> Vec<u32> {
        let mut files: Vec<u32> = self
            .infos
            .iter()
            .filter(|(n, info)| **n != self.current_file && info.blocks > 0 && info.height_last < height)
            .map(|(n, _)| *n)
            .collect();
        files.sort_unstable();
        files
    }

    /// Total bytes across all block and undo files
    pub fn total_bytes(&self) -> u64 {
        self.infos
            .values()
            .map(|info| info.size + info.undo_size)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, IndexDb, BlockFileManager) {
        let dir = tempfile::tempdir().unwrap();
        let db = IndexDb::open(dir.path().join("index.db")).unwrap();
        let files = BlockFileManager::open(dir.path().join("blocks"), &db).unwrap();
        (dir, db, files)
    }

    #[test]
    fn test_block_write_read_roundtrip() {
        let (_dir, _db, mut files) = open_temp();
        let payload = vec![0xabu8; 500];
        let loc = files.write_block(&payload, 1).unwrap();
        assert_eq!(loc.file, 0);
        assert_eq!(files.read_block(&loc).unwrap(), payload);

        let second = vec![0xcdu8; 300];
        let loc2 = files.write_block(&second, 2).unwrap();
        assert_eq!(files.read_block(&loc2).unwrap(), second);
        // First record still intact.
        assert_eq!(files.read_block(&loc).unwrap(), payload);
    }

    #[test]
    fn test_undo_checksum_detects_wrong_prev_hash() {
        let (_dir, _db, mut files) = open_temp();
        let prev = [3u8; 32];
        let undo = vec![1u8, 2, 3, 4];
        let offset = files.write_undo(0, &prev, &undo).unwrap();
        assert_eq!(files.read_undo(0, offset, &prev).unwrap(), undo);
        assert!(matches!(
            files.read_undo(0, offset, &[4u8; 32]),
            Err(StorageError::Corrupt(_))
        ));
    }

    #[test]
    fn test_file_info_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = IndexDb::open(dir.path().join("index.db")).unwrap();
        {
            let mut files = BlockFileManager::open(dir.path().join("blocks"), &db).unwrap();
            files.write_block(&[1u8; 100], 5).unwrap();
            let mut batch = WriteBatch::new();
            files.file_info_batch(&mut batch).unwrap();
            db.commit(batch).unwrap();
        }
        let files = BlockFileManager::open(dir.path().join("blocks"), &db).unwrap();
        let info = files.info(0).unwrap();
        assert_eq!(info.blocks, 1);
        assert_eq!(info.height_first, 5);
    }

    #[test]
    fn test_prune_selection_skips_current_file() {
        let (_dir, _db, mut files) = open_temp();
        files.write_block(&[0u8; 10], 1).unwrap();
        // Everything lives in the current file; nothing is prunable.
        assert!(files.files_entirely_below(100).is_empty());
    }

    #[test]
    fn test_missing_file_reports_pruned() {
        let (_dir, _db, files) = open_temp();
        let loc = BlockLocation { file: 9, offset: 8 };
        assert!(matches!(
            files.read_block(&loc),
            Err(StorageError::Pruned(_))
        ));
    }
}
