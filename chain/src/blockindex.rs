//! Block Index
//!
//! An arena of header metadata entries addressed by `u32` handles. Entries
//! point upward through `prev` and a skip pointer for O(log n) ancestor
//! walks; the candidate set orders everything eligible to become tip by
//! `(cumulative work desc, sequence asc, handle asc)`. Mutated entries land
//! in a dirty set drained into the next index-database flush.

use std::collections::{BTreeSet, HashMap, HashSet};

use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Serialize};

use plumecoin_core::{BlockHeader, Hash};
use plumecoin_storage::BlockLocation;

use crate::error::ChainError;

/// Validity levels, strictly ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Validity {
    /// Nothing verified yet
    Unknown = 0,
    /// Header parsed, parent found, PoW/PoS target plausible
    Tree = 1,
    /// Context-free transaction checks passed; implies a known tx count
    Transactions = 2,
    /// All contextual checks up to amounts passed
    Chain = 3,
    /// Scripts verified; the block fully connected at least once
    Scripts = 4,
}

/// Status bitfield of a block index entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockStatus(pub u32);

impl BlockStatus {
    const VALIDITY_MASK: u32 = 0x07;
    pub const HAVE_DATA: u32 = 1 << 3;
    pub const HAVE_UNDO: u32 = 1 << 4;
    pub const OPT_WITNESS: u32 = 1 << 5;
    pub const FAILED_VALID: u32 = 1 << 6;
    pub const FAILED_CHILD: u32 = 1 << 7;

    pub fn validity(&self) -> Validity {
        match self.0 & Self::VALIDITY_MASK {
            1 => Validity::Tree,
            2 => Validity::Transactions,
            3 => Validity::Chain,
            4 => Validity::Scripts,
            _ => Validity::Unknown,
        }
    }

    /// Raise the validity level; levels never go down through this call
    pub fn raise_validity(&mut self, level: Validity) -> bool {
        if self.validity() < level {
            self.0 = (self.0 & !Self::VALIDITY_MASK) | level as u32;
            true
        } else {
            false
        }
    }

    /// Drop back to a bare level, used only by explicit invalidation
    pub fn reset_validity(&mut self, level: Validity) {
        self.0 = (self.0 & !Self::VALIDITY_MASK) | level as u32;
    }

    pub fn has(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }

    pub fn clear(&mut self, flag: u32) {
        self.0 &= !flag;
    }

    pub fn failed(&self) -> bool {
        self.has(Self::FAILED_VALID | Self::FAILED_CHILD)
    }
}

/// One block's metadata
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub hash: Hash,
    /// Handle of the predecessor; `None` only for genesis
    pub prev: Option<u32>,
    /// Skip pointer for logarithmic ancestor walks
    pub skip: Option<u32>,
    pub height: u64,
    /// Cumulative work of this chain up to and including this block
    pub chain_work: BigUint,
    pub time: u32,
    /// Maximum timestamp over this entry and its ancestors
    pub max_ancestor_time: u32,
    pub bits: u32,
    pub version: i32,
    pub status: BlockStatus,
    /// Transactions in this block; 0 until the block body is seen
    pub tx_count: u32,
    /// Transactions in the chain up to here; 0 while an ancestor's body is
    /// missing
    pub chain_tx_count: u64,
    /// Where the block body sits on disk
    pub location: Option<BlockLocation>,
    /// Offset of the undo record in the paired rev file
    pub undo_offset: Option<u64>,
    /// Node-local arrival order; ties in work break toward lower values.
    /// `precious_block` assigns negative values to jump the queue.
    pub seq: i64,
    pub proof_of_stake: bool,
    pub stake_modifier: Hash,
}

/// Candidate-set key: best candidate sorts first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateKey {
    pub work: BigUint,
    pub seq: i64,
    pub handle: u32,
}

impl Ord for CandidateKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .work
            .cmp(&self.work)
            .then(self.seq.cmp(&other.seq))
            .then(self.handle.cmp(&other.handle))
    }
}

impl PartialOrd for CandidateKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Disk form of an index entry
#[derive(Debug, Serialize, Deserialize)]
pub struct DiskIndexRecord {
    pub hash: String,
    pub prev_hash: String,
    pub height: u64,
    pub chain_work: String,
    pub time: u32,
    pub max_ancestor_time: u32,
    pub bits: u32,
    pub version: i32,
    pub status: u32,
    pub tx_count: u32,
    pub chain_tx_count: u64,
    pub location: Option<BlockLocation>,
    pub undo_offset: Option<u64>,
    pub proof_of_stake: bool,
    pub stake_modifier: String,
}

/// The in-memory tree of all known headers
pub struct BlockIndex {
    entries: Vec<IndexEntry>,
    by_hash: HashMap<Hash, u32>,
    dirty: HashSet<u32>,
    next_seq: i64,
    /// Entries eligible to become tip, best first
    candidates: BTreeSet<CandidateKey>,
}

impl BlockIndex {
    pub fn new() -> Self {
        BlockIndex {
            entries: Vec::new(),
            by_hash: HashMap::new(),
            dirty: HashSet::new(),
            next_seq: 1,
            candidates: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, handle: u32) -> &IndexEntry {
        &self.entries[handle as usize]
    }

    pub fn get_mut(&mut self, handle: u32) -> &mut IndexEntry {
        self.dirty.insert(handle);
        &mut self.entries[handle as usize]
    }

    pub fn lookup(&self, hash: &Hash) -> Option<u32> {
        self.by_hash.get(hash).copied()
    }

    /// Insert a verified header under its predecessor.
    ///
    /// Fails with `Invalid(bad-prevblk)` when the predecessor is marked
    /// failed and `MissingPrev` when it is absent.
    pub fn insert_header(
        &mut self,
        header: &BlockHeader,
        proof: BigUint,
        proof_of_stake: bool,
    ) -> Result<u32, ChainError> {
        let hash = header.hash();
        if let Some(existing) = self.lookup(&hash) {
            return Err(ChainError::Duplicate(self.get(existing).hash));
        }

        let genesis = header.prev_block_hash == [0u8; 32] && self.entries.is_empty();
        let prev = if genesis {
            None
        } else {
            let prev = self
                .lookup(&header.prev_block_hash)
                .ok_or(ChainError::MissingPrev(header.prev_block_hash))?;
            if self.get(prev).status.failed() {
                return Err(ChainError::invalid("bad-prevblk", "predecessor marked failed"));
            }
            Some(prev)
        };

        let (height, chain_work, max_ancestor_time, stake_modifier) = match prev {
            Some(prev) => {
                let parent = self.get(prev);
                (
                    parent.height + 1,
                    &parent.chain_work + &proof,
                    parent.max_ancestor_time.max(header.timestamp),
                    plumecoin_consensus::next_stake_modifier(&parent.stake_modifier, &hash),
                )
            }
            None => (0, proof, header.timestamp, [0u8; 32]),
        };

        let handle = self.entries.len() as u32;
        let seq = self.next_seq;
        self.next_seq += 1;

        let mut status = BlockStatus::default();
        status.raise_validity(Validity::Tree);

        self.entries.push(IndexEntry {
            hash,
            prev,
            skip: None,
            height,
            chain_work,
            time: header.timestamp,
            max_ancestor_time,
            bits: header.bits,
            version: header.version,
            status,
            tx_count: 0,
            chain_tx_count: 0,
            location: None,
            undo_offset: None,
            seq,
            proof_of_stake,
            stake_modifier,
        });
        self.entries[handle as usize].skip = self.compute_skip(handle);
        self.by_hash.insert(hash, handle);
        self.dirty.insert(handle);
        Ok(handle)
    }

    fn compute_skip(&self, handle: u32) -> Option<u32> {
        let entry = &self.entries[handle as usize];
        let prev = entry.prev?;
        let target = skip_height(entry.height);
        self.ancestor(prev, target)
    }

    /// Ancestor of `handle` at `height`, via skip pointers
    pub fn ancestor(&self, handle: u32, height: u64) -> Option<u32> {
        let mut current = handle;
        let mut current_height = self.get(current).height;
        if height > current_height {
            return None;
        }
        while current_height > height {
            let entry = self.get(current);
            let skip_h = skip_height(current_height);
            match entry.skip {
                // Take the skip link whenever it does not overshoot.
                Some(skip) if skip_h >= height => {
                    current = skip;
                    current_height = skip_h;
                }
                _ => {
                    current = entry.prev?;
                    current_height -= 1;
                }
            }
        }
        Some(current)
    }

    /// The deepest entry on both ancestries
    pub fn last_common_ancestor(&self, a: u32, b: u32) -> Option<u32> {
        let (mut a, mut b) = (a, b);
        let height = self.get(a).height.min(self.get(b).height);
        a = self.ancestor(a, height)?;
        b = self.ancestor(b, height)?;
        while a != b {
            a = self.get(a).prev?;
            b = self.get(b).prev?;
        }
        Some(a)
    }

    /// True if `ancestor` is on the ancestry of `descendant` (inclusive)
    pub fn is_ancestor_of(&self, ancestor: u32, descendant: u32) -> bool {
        let target_height = self.get(ancestor).height;
        self.ancestor(descendant, target_height) == Some(ancestor)
    }

    /// Raise an entry's validity, returning whether anything changed
    pub fn raise_validity(&mut self, handle: u32, level: Validity) -> bool {
        let changed = self.entries[handle as usize].status.raise_validity(level);
        if changed {
            self.dirty.insert(handle);
        }
        changed
    }

    /// Record that a block body is on disk and propagate `chain_tx_count`
    /// through every descendant chain that just became fully linked
    pub fn set_block_data(
        &mut self,
        handle: u32,
        tx_count: u32,
        location: BlockLocation,
        has_witness: bool,
    ) {
        {
            let entry = self.get_mut(handle);
            entry.tx_count = tx_count;
            entry.location = Some(location);
            entry.status.set(BlockStatus::HAVE_DATA);
            if has_witness {
                entry.status.set(BlockStatus::OPT_WITNESS);
            }
            entry.status.raise_validity(Validity::Transactions);
        }
        self.link_chain_tx(handle);
    }

    /// Walk forward from `handle`, filling `chain_tx_count` wherever every
    /// ancestor now has data
    fn link_chain_tx(&mut self, start: u32) {
        let parent_chain_tx = match self.get(start).prev {
            Some(prev) => self.get(prev).chain_tx_count,
            None => 0,
        };
        if self.get(start).prev.is_some() && parent_chain_tx == 0 {
            return;
        }
        let mut frontier = vec![(start, parent_chain_tx)];
        while let Some((handle, parent_count)) = frontier.pop() {
            let entry = &self.entries[handle as usize];
            if !entry.status.has(BlockStatus::HAVE_DATA) || entry.chain_tx_count != 0 {
                continue;
            }
            let chain_tx = parent_count + entry.tx_count as u64;
            {
                let entry = self.get_mut(handle);
                entry.chain_tx_count = chain_tx;
            }
            self.insert_candidate(handle);
            // Children may now be linkable too.
            let children: Vec<u32> = (0..self.entries.len() as u32)
                .filter(|&h| self.entries[h as usize].prev == Some(handle))
                .collect();
            for child in children {
                frontier.push((child, chain_tx));
            }
        }
    }

    /// Mark an entry failed and cascade `FAILED_CHILD` over its descendants
    pub fn mark_failed(&mut self, handle: u32) {
        {
            let entry = self.get_mut(handle);
            entry.status.set(BlockStatus::FAILED_VALID);
        }
        self.remove_candidate(handle);
        let failed_height = self.get(handle).height;
        for h in 0..self.entries.len() as u32 {
            if h == handle || self.entries[h as usize].height <= failed_height {
                continue;
            }
            if self.ancestor(h, failed_height) == Some(handle) {
                let entry = self.get_mut(h);
                entry.status.set(BlockStatus::FAILED_CHILD);
                self.remove_candidate(h);
            }
        }
    }

    /// Clear failure flags on an entry and all its descendants, reseeding
    /// the candidate set
    pub fn reconsider(&mut self, handle: u32, tip_work: &BigUint) {
        let height = self.get(handle).height;
        for h in 0..self.entries.len() as u32 {
            let is_descendant = h == handle
                || (self.entries[h as usize].height > height
                    && self.ancestor(h, height) == Some(handle));
            if is_descendant && self.entries[h as usize].status.failed() {
                let entry = self.get_mut(h);
                entry.status.clear(BlockStatus::FAILED_VALID | BlockStatus::FAILED_CHILD);
            }
            if is_descendant {
                self.maybe_add_candidate(h, tip_work);
            }
        }
    }

    fn insert_candidate(&mut self, handle: u32) {
        let entry = self.get(handle);
        if entry.status.failed()
            || entry.status.validity() < Validity::Transactions
            || entry.chain_tx_count == 0
        {
            return;
        }
        let key = CandidateKey {
            work: entry.chain_work.clone(),
            seq: entry.seq,
            handle,
        };
        self.candidates.insert(key);
    }

    /// Add to the candidate set if eligible and at least as good as the tip
    pub fn maybe_add_candidate(&mut self, handle: u32, tip_work: &BigUint) {
        if &self.get(handle).chain_work >= tip_work {
            self.insert_candidate(handle);
        }
    }

    pub fn remove_candidate(&mut self, handle: u32) {
        let entry = self.get(handle);
        let key = CandidateKey {
            work: entry.chain_work.clone(),
            seq: entry.seq,
            handle,
        };
        self.candidates.remove(&key);
    }

    /// The most-work eligible candidate
    pub fn best_candidate(&self) -> Option<u32> {
        self.candidates.iter().next().map(|key| key.handle)
    }

    /// Drop candidates that can no longer beat the tip, keeping the tip
    /// itself
    pub fn prune_candidates(&mut self, tip: u32) {
        let tip_work = self.get(tip).chain_work.clone();
        let keep: Vec<CandidateKey> = self
            .candidates
            .iter()
            .filter(|key| key.handle == tip || key.work >= tip_work)
            .cloned()
            .collect();
        self.candidates = keep.into_iter().collect();
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn contains_candidate(&self, handle: u32) -> bool {
        let entry = self.get(handle);
        self.candidates.contains(&CandidateKey {
            work: entry.chain_work.clone(),
            seq: entry.seq,
            handle,
        })
    }

    /// Drain the dirty set for a flush
    pub fn take_dirty(&mut self) -> Vec<u32> {
        let mut dirty: Vec<u32> = self.dirty.drain().collect();
        dirty.sort_unstable();
        dirty
    }

    pub fn mark_dirty(&mut self, handle: u32) {
        self.dirty.insert(handle);
    }

    /// Serialize one entry to its disk record
    pub fn to_disk(&self, handle: u32) -> DiskIndexRecord {
        let entry = self.get(handle);
        DiskIndexRecord {
            hash: hex::encode(entry.hash),
            prev_hash: entry
                .prev
                .map(|p| hex::encode(self.get(p).hash))
                .unwrap_or_else(|| hex::encode([0u8; 32])),
            height: entry.height,
            chain_work: hex::encode(entry.chain_work.to_bytes_be()),
            time: entry.time,
            max_ancestor_time: entry.max_ancestor_time,
            bits: entry.bits,
            version: entry.version,
            status: entry.status.0,
            tx_count: entry.tx_count,
            chain_tx_count: entry.chain_tx_count,
            location: entry.location,
            undo_offset: entry.undo_offset,
            proof_of_stake: entry.proof_of_stake,
            stake_modifier: hex::encode(entry.stake_modifier),
        }
    }

    /// Rebuild the index from disk records; entries arrive in any order
    pub fn from_disk(records: Vec<DiskIndexRecord>) -> Result<Self, ChainError> {
        let mut index = BlockIndex::new();
        let mut sorted = records;
        sorted.sort_by_key(|r| r.height);
        for record in sorted {
            let hash = plumecoin_util::hex_to_hash(&record.hash)
                .map_err(|e| ChainError::System(format!("bad index record hash: {e}")))?;
            let prev_hash = plumecoin_util::hex_to_hash(&record.prev_hash)
                .map_err(|e| ChainError::System(format!("bad index record prev: {e}")))?;
            let prev = if record.height == 0 {
                None
            } else {
                Some(index.lookup(&prev_hash).ok_or_else(|| {
                    ChainError::System(format!(
                        "index record {} missing parent {}",
                        record.hash, record.prev_hash
                    ))
                })?)
            };
            let work_bytes = hex::decode(&record.chain_work)
                .map_err(|e| ChainError::System(format!("bad chain work: {e}")))?;
            let stake_modifier = plumecoin_util::hex_to_hash(&record.stake_modifier)
                .map_err(|e| ChainError::System(format!("bad stake modifier: {e}")))?;

            let handle = index.entries.len() as u32;
            let seq = index.next_seq;
            index.next_seq += 1;
            index.entries.push(IndexEntry {
                hash,
                prev,
                skip: None,
                height: record.height,
                chain_work: BigUint::from_bytes_be(&work_bytes),
                time: record.time,
                max_ancestor_time: record.max_ancestor_time,
                bits: record.bits,
                version: record.version,
                status: BlockStatus(record.status),
                tx_count: record.tx_count,
                chain_tx_count: record.chain_tx_count,
                location: record.location,
                undo_offset: record.undo_offset,
                seq,
                proof_of_stake: record.proof_of_stake,
                stake_modifier,
            });
            index.entries[handle as usize].skip = index.compute_skip(handle);
            index.by_hash.insert(hash, handle);
            index.insert_candidate(handle);
        }
        Ok(index)
    }

    /// Work of the best header seen, failed chains excluded
    pub fn best_header_work(&self) -> BigUint {
        self.entries
            .iter()
            .filter(|entry| !entry.status.failed())
            .map(|entry| entry.chain_work.clone())
            .max()
            .unwrap_or_else(BigUint::zero)
    }
}

impl Default for BlockIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn invert_lowest_one(n: u64) -> u64 {
    n & n.wrapping_sub(1)
}

/// Height the skip pointer of an entry at `height` refers to
fn skip_height(height: u64) -> u64 {
    if height < 2 {
        return 0;
    }
    // Walk back further at odd heights so chains of skips cover dense
    // ranges quickly.
    if height & 1 != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plumecoin_consensus::block_proof;
    use plumecoin_core::BlockHeader;

    fn header(prev: Hash, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block_hash: prev,
            merkle_root: [0u8; 32],
            timestamp: 1_700_000_000 + nonce,
            bits: 0x207fffff,
            nonce,
        }
    }

    fn build_chain(index: &mut BlockIndex, length: usize) -> Vec<u32> {
        let mut handles = Vec::new();
        let mut prev = [0u8; 32];
        for i in 0..length {
            let h = header(prev, i as u32);
            prev = h.hash();
            let handle = index
                .insert_header(&h, block_proof(h.bits), false)
                .unwrap();
            handles.push(handle);
        }
        handles
    }

    #[test]
    fn test_insert_and_heights() {
        let mut index = BlockIndex::new();
        let handles = build_chain(&mut index, 10);
        for (i, &handle) in handles.iter().enumerate() {
            assert_eq!(index.get(handle).height, i as u64);
        }
        // Work strictly accumulates.
        assert!(index.get(handles[9]).chain_work > index.get(handles[0]).chain_work);
    }

    #[test]
    fn test_missing_prev_rejected() {
        let mut index = BlockIndex::new();
        build_chain(&mut index, 1);
        let orphan = header([9u8; 32], 0);
        assert!(matches!(
            index.insert_header(&orphan, block_proof(orphan.bits), false),
            Err(ChainError::MissingPrev(_))
        ));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut index = BlockIndex::new();
        let genesis = header([0u8; 32], 0);
        index
            .insert_header(&genesis, block_proof(genesis.bits), false)
            .unwrap();
        assert!(matches!(
            index.insert_header(&genesis, block_proof(genesis.bits), false),
            Err(ChainError::Duplicate(_))
        ));
    }

    #[test]
    fn test_skip_pointer_ancestor_correctness() {
        let mut index = BlockIndex::new();
        let handles = build_chain(&mut index, 200);
        let tip = handles[199];
        // Invariant 6: ancestor at h has height h, for all h.
        for target in [0u64, 1, 7, 63, 64, 128, 150, 199] {
            let ancestor = index.ancestor(tip, target).unwrap();
            assert_eq!(index.get(ancestor).height, target);
            assert_eq!(ancestor, handles[target as usize]);
        }
        assert_eq!(index.ancestor(handles[5], 10), None);
    }

    #[test]
    fn test_last_common_ancestor_on_fork() {
        let mut index = BlockIndex::new();
        let trunk = build_chain(&mut index, 10);

        // Fork off height 5.
        let fork_parent_hash = index.get(trunk[5]).hash;
        let mut prev = fork_parent_hash;
        let mut branch = Vec::new();
        for i in 0..4 {
            let h = header(prev, 1000 + i);
            prev = h.hash();
            branch.push(index.insert_header(&h, block_proof(h.bits), false).unwrap());
        }

        let fork = index.last_common_ancestor(trunk[9], branch[3]).unwrap();
        assert_eq!(fork, trunk[5]);
        assert!(index.is_ancestor_of(trunk[5], branch[3]));
        assert!(!index.is_ancestor_of(trunk[6], branch[3]));
    }

    #[test]
    fn test_failed_parent_rejects_children() {
        let mut index = BlockIndex::new();
        let handles = build_chain(&mut index, 3);
        index.mark_failed(handles[1]);
        // Entry 2 descends from the failed entry.
        assert!(index.get(handles[2]).status.has(BlockStatus::FAILED_CHILD));

        let child = header(index.get(handles[1]).hash, 77);
        assert!(matches!(
            index.insert_header(&child, block_proof(child.bits), false),
            Err(ChainError::Invalid(_))
        ));
    }

    #[test]
    fn test_reconsider_clears_failure() {
        let mut index = BlockIndex::new();
        let handles = build_chain(&mut index, 3);
        index.mark_failed(handles[1]);
        index.reconsider(handles[1], &BigUint::zero());
        assert!(!index.get(handles[1]).status.failed());
        assert!(!index.get(handles[2]).status.failed());
    }

    #[test]
    fn test_candidate_ordering_prefers_work_then_seq() {
        let mut index = BlockIndex::new();
        let trunk = build_chain(&mut index, 5);
        for &handle in &trunk {
            index.set_block_data(
                handle,
                1,
                BlockLocation { file: 0, offset: 8 },
                false,
            );
        }
        // Best candidate is the tip of the trunk.
        assert_eq!(index.best_candidate(), Some(trunk[4]));

        // A same-work sibling of the tip arrives later: the earlier seq wins.
        let sibling = header(index.get(trunk[3]).hash, 555);
        let sib_handle = index
            .insert_header(&sibling, block_proof(sibling.bits), false)
            .unwrap();
        index.set_block_data(sib_handle, 1, BlockLocation { file: 0, offset: 8 }, false);
        assert_eq!(index.best_candidate(), Some(trunk[4]));
    }

    #[test]
    fn test_chain_tx_links_through_gap() {
        let mut index = BlockIndex::new();
        let handles = build_chain(&mut index, 3);
        // Data arrives out of order: child first.
        index.set_block_data(handles[2], 4, BlockLocation { file: 0, offset: 8 }, false);
        assert_eq!(index.get(handles[2]).chain_tx_count, 0);

        index.set_block_data(handles[0], 1, BlockLocation { file: 0, offset: 8 }, false);
        index.set_block_data(handles[1], 2, BlockLocation { file: 0, offset: 8 }, false);
        // The gap closed; counts propagate to the tip.
        assert_eq!(index.get(handles[0]).chain_tx_count, 1);
        assert_eq!(index.get(handles[1]).chain_tx_count, 3);
        assert_eq!(index.get(handles[2]).chain_tx_count, 7);
    }

    #[test]
    fn test_disk_roundtrip() {
        let mut index = BlockIndex::new();
        let handles = build_chain(&mut index, 6);
        index.set_block_data(handles[0], 1, BlockLocation { file: 0, offset: 8 }, false);
        index.mark_failed(handles[5]);

        let records: Vec<DiskIndexRecord> =
            handles.iter().map(|&h| index.to_disk(h)).collect();
        let restored = BlockIndex::from_disk(records).unwrap();
        assert_eq!(restored.len(), 6);
        for &h in &handles {
            let original = index.get(h);
            let restored_handle = restored.lookup(&original.hash).unwrap();
            let restored_entry = restored.get(restored_handle);
            assert_eq!(restored_entry.height, original.height);
            assert_eq!(restored_entry.chain_work, original.chain_work);
            assert_eq!(restored_entry.status, original.status);
        }
    }
}
