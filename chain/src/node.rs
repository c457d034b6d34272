//! Chain Controller
//!
//! The orchestrator behind the control surface: header and block
//! acceptance, the ActivateBestChain loop with its disconnect/connect
//! steps, invalidate/reconsider/precious, pruning, startup replay, chain
//! verification, and the flush that keeps every on-disk structure
//! consistent. One mutex serializes all of it; the script check engine is
//! the only thing that runs outside.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use num_bigint::BigUint;
use num_traits::Zero;

use plumecoin_consensus::{
    block_proof, check_block, check_proof_of_work, contextual_check_block, difficulty,
    next_work_required, ConsensusParams, MANDATORY_FLAGS, MAX_FUTURE_BLOCK_TIME, MEDIAN_TIME_SPAN,
};
use plumecoin_core::{
    current_timestamp, Block, BlockHeader, Decodable, Encodable, Hash, Network, TokenScript,
    Transaction,
};
use plumecoin_storage::{keys, DiskStore, StoreFlag, WriteBatch};

use crate::blockindex::{BlockIndex, BlockStatus, DiskIndexRecord, Validity};
use crate::coins::{CoinOverlay, CoinView, TipCoinCache};
use crate::connect::{
    connect_block, disconnect_block, ConnectContext, DisconnectResult,
};
use crate::disconnectpool::DisconnectPool;
use crate::error::ChainError;
use crate::indexing::{index_block, IndexFlags};
use crate::mempool::{AcceptContext, AcceptOutcome, Mempool, MempoolConfig, MempoolDump};
use crate::notifications::ChainSubscriber;
use crate::scriptcheck::{CheckQueue, ScriptCache};
use crate::tokens::{TipTokenCache, TokenOverlay};
use crate::undo::BlockUndo;

/// Blocks always kept on disk below the tip when pruning
pub const MIN_BLOCKS_TO_KEEP: u64 = 288;

/// Connect steps performed per ActivateBestChain iteration
const CONNECT_BATCH: usize = 32;

/// Headers fed to the difficulty schedule
const RETARGET_HISTORY: usize = 160;

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub network: Network,
    pub data_dir: PathBuf,
    /// Script check worker threads; 0 verifies inline
    pub script_workers: usize,
    /// Soft byte budget of the coin tip cache
    pub coin_cache_bytes: usize,
    /// Entries kept in the script result cache
    pub script_cache_entries: usize,
    pub mempool: MempoolConfig,
    /// Byte budget for block files; `None` disables pruning
    pub prune_target_bytes: Option<u64>,
    /// Optional secondary indices to maintain
    pub index_flags: IndexFlags,
}

impl NodeConfig {
    pub fn new(network: Network, data_dir: PathBuf) -> Self {
        NodeConfig {
            network,
            data_dir,
            script_workers: 4,
            coin_cache_bytes: 450 * 1024 * 1024,
            script_cache_entries: 1 << 16,
            mempool: MempoolConfig::default(),
            prune_target_bytes: None,
            index_flags: IndexFlags::default(),
        }
    }
}

/// Introspection summary of one block index entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub height: u64,
    pub failed: bool,
    pub have_data: bool,
    pub have_undo: bool,
    pub validity: Validity,
    pub in_candidates: bool,
    pub on_active_chain: bool,
}

/// The node handle: one global chain lock around all mutable state
pub struct Node {
    inner: Mutex<NodeInner>,
    shutdown: Arc<AtomicBool>,
}

struct NodeInner {
    params: ConsensusParams,
    config: NodeConfig,
    store: DiskStore,
    index: BlockIndex,
    coins: TipCoinCache,
    tokens: TipTokenCache,
    /// Handle of the active tip
    tip: Option<u32>,
    /// Most-work header seen, failed chains excluded
    best_header: Option<u32>,
    mempool: Mempool,
    disconnect_pool: DisconnectPool,
    queue: CheckQueue,
    script_cache: ScriptCache,
    index_flags: IndexFlags,
    /// Secondary-index writes accumulated for the next flush
    pending: WriteBatch,
    precious_seq: i64,
    subscribers: Vec<Box<dyn ChainSubscriber>>,
    shutdown: Arc<AtomicBool>,
}

/// Deterministic genesis for a network
pub fn genesis_block(params: &ConsensusParams) -> Block {
    let mut script_sig = Vec::new();
    plumecoin_core::script::push_slice(
        &mut script_sig,
        b"plumecoin genesis - feathers over firewood",
    );
    let coinbase = Transaction::new(
        1,
        vec![plumecoin_core::TxIn::new(
            plumecoin_core::OutPoint::null(),
            plumecoin_core::Script(script_sig),
            plumecoin_core::transaction::SEQUENCE_FINAL,
        )],
        vec![plumecoin_core::TxOut::new(
            0,
            plumecoin_core::Script::op_return(b"plume"),
        )],
        0,
    );
    let mut block = Block::new(
        BlockHeader {
            version: 1,
            prev_block_hash: [0u8; 32],
            merkle_root: [0u8; 32],
            timestamp: 1_735_689_600,
            bits: params.pow_limit_bits,
            nonce: 0,
        },
        vec![coinbase],
    );
    block.header.merkle_root = block.calculate_merkle_root();
    block
}

impl Node {
    /// Open (or create) a node over a data directory and run startup replay
    pub fn open(config: NodeConfig) -> Result<Node, ChainError> {
        let params = ConsensusParams::for_network(config.network);
        let store = DiskStore::open(&config.data_dir)?;
        let db = store.index_arc();

        let mut records = Vec::new();
        for (_, value) in store
            .index()
            .scan_prefix(&keys::BLOCK_INDEX_PREFIX)
            .map_err(|e| ChainError::System(e.to_string()))?
        {
            let record: DiskIndexRecord = serde_json::from_slice(&value)
                .map_err(|e| ChainError::System(format!("corrupt index record: {e}")))?;
            records.push(record);
        }
        let index = BlockIndex::from_disk(records)?;
        let coins = TipCoinCache::new(db.clone());
        let tokens = TipTokenCache::new(db.clone());
        // An index once enabled stays enabled; turning one on mid-history
        // would leave it partial, so the stored flags win over the config.
        let mut index_flags = IndexFlags::from_store(store.index())?;
        if index.is_empty() {
            index_flags = config.index_flags;
            let mut batch = WriteBatch::new();
            batch.put_flag(StoreFlag::TxIndex, index_flags.txindex);
            batch.put_flag(StoreFlag::AddressIndex, index_flags.addressindex);
            batch.put_flag(StoreFlag::SpentIndex, index_flags.spentindex);
            batch.put_flag(StoreFlag::TimestampIndex, index_flags.timestampindex);
            store
                .index()
                .commit(batch)
                .map_err(|e| ChainError::System(e.to_string()))?;
        }
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut inner = NodeInner {
            queue: CheckQueue::new(config.script_workers),
            script_cache: ScriptCache::new(config.script_cache_entries),
            mempool: Mempool::new(config.mempool.clone()),
            disconnect_pool: DisconnectPool::new(),
            tip: None,
            best_header: None,
            precious_seq: 0,
            subscribers: Vec::new(),
            pending: WriteBatch::new(),
            index_flags,
            params,
            config,
            store,
            index,
            coins,
            tokens,
            shutdown: shutdown.clone(),
        };

        if inner.index.is_empty() {
            inner.init_genesis()?;
        } else {
            inner.tip = inner
                .coins
                .best_block()
                .and_then(|hash| inner.index.lookup(&hash));
            inner.replay_blocks()?;
        }
        inner.best_header = inner.recompute_best_header();
        if let Some(tip) = inner.tip {
            let entry = inner.index.get(tip);
            info!(
                "chain tip {} at height {}",
                hex::encode(&entry.hash[..8]),
                entry.height
            );
        }
        Ok(Node {
            inner: Mutex::new(inner),
            shutdown,
        })
    }

    /// Shared shutdown flag; setting it interrupts the main loop at its
    /// polling points
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn subscribe(&self, subscriber: Box<dyn ChainSubscriber>) {
        self.lock().subscribers.push(subscriber);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NodeInner> {
        self.inner.lock().expect("chain lock poisoned")
    }

    /// Accept a standalone header
    pub fn submit_header(&self, header: &BlockHeader) -> Result<(), ChainError> {
        self.lock().accept_header(header).map(|_| ())
    }

    /// Accept a full block and activate the best chain
    pub fn submit_block(&self, block: &Block, requested_by_us: bool) -> Result<(), ChainError> {
        self.lock().accept_block(block, requested_by_us)
    }

    /// Accept a transaction into the mempool
    pub fn submit_transaction(&self, tx: Transaction) -> Result<AcceptOutcome, ChainError> {
        self.lock().submit_transaction(tx)
    }

    /// The active tip as (hash, height)
    pub fn get_best_block(&self) -> Option<(Hash, u64)> {
        let inner = self.lock();
        inner.tip.map(|tip| {
            let entry = inner.index.get(tip);
            (entry.hash, entry.height)
        })
    }

    pub fn mempool_len(&self) -> usize {
        self.lock().mempool.len()
    }

    pub fn mempool_contains(&self, txid: &Hash) -> bool {
        self.lock().mempool.contains(txid)
    }

    /// Introspect one block index entry, for the control surface and tests
    pub fn block_info(&self, hash: &Hash) -> Option<BlockInfo> {
        let inner = self.lock();
        let handle = inner.index.lookup(hash)?;
        let entry = inner.index.get(handle);
        let on_active_chain = inner
            .tip
            .map(|tip| inner.index.ancestor(tip, entry.height) == Some(handle))
            .unwrap_or(false);
        Some(BlockInfo {
            height: entry.height,
            failed: entry.status.failed(),
            have_data: entry.status.has(BlockStatus::HAVE_DATA),
            have_undo: entry.status.has(BlockStatus::HAVE_UNDO),
            validity: entry.status.validity(),
            in_candidates: inner.index.contains_candidate(handle),
            on_active_chain,
        })
    }

    pub fn invalidate_block(&self, hash: &Hash) -> Result<(), ChainError> {
        self.lock().invalidate_block(hash)
    }

    pub fn reconsider_block(&self, hash: &Hash) -> Result<(), ChainError> {
        self.lock().reconsider_block(hash)
    }

    pub fn precious_block(&self, hash: &Hash) -> Result<(), ChainError> {
        self.lock().precious_block(hash)
    }

    pub fn prune_to_height(&self, height: u64) -> Result<Vec<u32>, ChainError> {
        self.lock().prune_to_height(height)
    }

    /// Walk recent blocks at the given thoroughness (0..=4)
    pub fn verify_chain(&self, level: u32, depth: u64) -> Result<(), ChainError> {
        self.lock().verify_chain(level, depth)
    }

    pub fn dump_mempool(&self, path: &std::path::Path) -> Result<usize, ChainError> {
        self.lock().dump_mempool(path)
    }

    pub fn load_mempool(&self, path: &std::path::Path) -> Result<usize, ChainError> {
        self.lock().load_mempool(path)
    }

    pub fn prioritise_transaction(&self, txid: Hash, delta: i64) {
        self.lock().mempool.prioritise(txid, delta);
    }

    /// Flush all dirty state; called by the periodic timer and at shutdown
    pub fn flush(&self) -> Result<(), ChainError> {
        self.lock().flush()
    }
}

impl NodeInner {
    fn init_genesis(&mut self) -> Result<(), ChainError> {
        let genesis = genesis_block(&self.params);
        let handle = self
            .index
            .insert_header(&genesis.header, block_proof(genesis.header.bits), false)?;
        let bytes = genesis.to_bytes();
        let location = self
            .store
            .files_mut()
            .write_block(&bytes, 0)
            .map_err(ChainError::from)?;
        self.index.set_block_data(
            handle,
            genesis.transactions.len() as u32,
            location,
            false,
        );
        self.index.raise_validity(handle, Validity::Scripts);
        self.coins.set_best_block(genesis.hash());
        self.tip = Some(handle);
        self.flush()?;
        info!("initialized genesis {}", hex::encode(&genesis.hash()[..8]));
        Ok(())
    }

    fn recompute_best_header(&self) -> Option<u32> {
        let mut best: Option<u32> = None;
        for handle in 0..self.index.len() as u32 {
            let entry = self.index.get(handle);
            if entry.status.failed() {
                continue;
            }
            let better = match best {
                Some(current) => entry.chain_work > self.index.get(current).chain_work,
                None => true,
            };
            if better {
                best = Some(handle);
            }
        }
        best
    }

    /// Median time past over the last MEDIAN_TIME_SPAN blocks ending at
    /// `handle`
    fn median_time_past(&self, handle: Option<u32>) -> u32 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = handle;
        while let Some(current) = cursor {
            if times.len() >= MEDIAN_TIME_SPAN {
                break;
            }
            let entry = self.index.get(current);
            times.push(entry.time);
            cursor = entry.prev;
        }
        plumecoin_consensus::median_time(times)
    }

    /// Recent (timestamp, bits) pairs of the given proof type ending at
    /// `handle`, oldest first
    fn retarget_headers(&self, handle: Option<u32>, pos: bool) -> Vec<(u32, u32)> {
        let mut headers = Vec::with_capacity(RETARGET_HISTORY);
        let mut cursor = handle;
        while let Some(current) = cursor {
            if headers.len() >= RETARGET_HISTORY {
                break;
            }
            let entry = self.index.get(current);
            if entry.proof_of_stake == pos {
                headers.push((entry.time, entry.bits));
            }
            cursor = entry.prev;
        }
        headers.reverse();
        headers
    }

    fn expected_bits(&self, prev: Option<u32>, pos: bool) -> u32 {
        next_work_required(&self.params, &self.retarget_headers(prev, pos), pos)
    }

    fn tip_work(&self) -> BigUint {
        self.tip
            .map(|tip| self.index.get(tip).chain_work.clone())
            .unwrap_or_else(BigUint::zero)
    }

    fn accept_header(&mut self, header: &BlockHeader) -> Result<u32, ChainError> {
        let hash = header.hash();
        if let Some(handle) = self.index.lookup(&hash) {
            if self.index.get(handle).status.failed() {
                return Err(ChainError::invalid(
                    "duplicate",
                    "block was previously rejected",
                ));
            }
            return Ok(handle);
        }

        // Headers do not say which proof kind they are; one that meets its
        // own PoW target is PoW, anything else must at least claim a target
        // inside the stake limit and proves itself at connect time.
        let pos = check_proof_of_work(&hash, header.bits, self.params.pow_limit_bits).is_err();
        if pos {
            let target = difficulty::bits_to_target(header.bits)
                .ok_or_else(|| ChainError::invalid("bad-diffbits", "undecodable target"))?;
            let limit = difficulty::bits_to_target(self.params.pos_limit_bits)
                .ok_or_else(|| ChainError::System("bad pos limit".into()))?;
            if target > limit {
                return Err(ChainError::invalid("bad-diffbits", "target above stake limit"));
            }
        }

        if header.timestamp as i64 > current_timestamp() as i64 + MAX_FUTURE_BLOCK_TIME {
            return Err(ChainError::invalid("time-too-new", "timestamp too far ahead"));
        }
        if header.version < self.params.min_block_version {
            return Err(ChainError::invalid("bad-version", "version below floor"));
        }

        let prev = self
            .index
            .lookup(&header.prev_block_hash)
            .ok_or(ChainError::MissingPrev(header.prev_block_hash))?;
        let prev_entry_height = self.index.get(prev).height;
        let height = prev_entry_height + 1;

        if header.timestamp <= self.median_time_past(Some(prev)) {
            return Err(ChainError::invalid("time-too-old", "before median time past"));
        }

        // Checkpoint compliance: the new chain must run through every
        // checkpoint at or below its height.
        if let Some((cp_height, cp_hash)) = self.params.checkpoint_at_or_below(height) {
            let on_chain = if *cp_height == height {
                hash == *cp_hash
            } else {
                self.index
                    .ancestor(prev, *cp_height)
                    .map(|a| self.index.get(a).hash == *cp_hash)
                    .unwrap_or(false)
            };
            if !on_chain {
                return Err(ChainError::invalid(
                    "bad-fork-prior-to-checkpoint",
                    format!("forks below checkpoint {cp_height}"),
                ));
            }
        }

        // Refuse forks deeper than the reorganization limit.
        if let Some(tip) = self.tip {
            if let Some(fork) = self.index.last_common_ancestor(prev, tip) {
                let depth = self.index.get(tip).height - self.index.get(fork).height;
                if depth > self.params.max_reorg_depth {
                    return Err(ChainError::invalid(
                        "bad-fork-too-deep",
                        format!("fork depth {depth}"),
                    ));
                }
            }
        }

        let handle = self
            .index
            .insert_header(header, block_proof(header.bits), pos)?;
        let better = match self.best_header {
            Some(best) => {
                self.index.get(handle).chain_work > self.index.get(best).chain_work
            }
            None => true,
        };
        if better {
            self.best_header = Some(handle);
        }
        Ok(handle)
    }

    fn accept_block(&mut self, block: &Block, requested_by_us: bool) -> Result<(), ChainError> {
        let handle = self.accept_header(&block.header)?;
        {
            let entry = self.index.get(handle);
            if entry.status.has(BlockStatus::HAVE_DATA) {
                return Ok(());
            }

            // Unrequested blocks that cannot improve the tip are dropped
            // without marking anything.
            if !requested_by_us {
                let tip_work = self.tip_work();
                let too_little_work = entry.chain_work <= tip_work && self.tip.is_some();
                let too_far_ahead = self
                    .tip
                    .map(|tip| {
                        entry.height > self.index.get(tip).height + self.params.max_reorg_depth
                    })
                    .unwrap_or(false);
                if too_little_work || too_far_ahead {
                    debug!("ignoring unrequested block {}", hex::encode(&entry.hash[..8]));
                    return Ok(());
                }
            }
        }

        let height = self.index.get(handle).height;
        let prev = self.index.get(handle).prev;
        let mtp = self.median_time_past(prev);
        if let Err(err) = check_block(block, &self.params)
            .map_err(ChainError::from)
            .and_then(|_| contextual_check_block(block, &self.params, height, mtp).map_err(ChainError::from))
        {
            if !err.corruption_possible() {
                self.index.mark_failed(handle);
            }
            return Err(err);
        }

        let bytes = block.to_bytes();
        let location = self
            .store
            .files_mut()
            .write_block(&bytes, height)
            .map_err(ChainError::from)?;
        self.index.set_block_data(
            handle,
            block.transactions.len() as u32,
            location,
            block.has_witness(),
        );
        {
            let entry = self.index.get_mut(handle);
            entry.proof_of_stake = block.is_proof_of_stake();
        }
        self.activate_best_chain()
    }

    /// The main loop: reorganize toward the best candidate until it is the
    /// tip, a shutdown is requested, or an invalid block restarts the walk
    fn activate_best_chain(&mut self) -> Result<(), ChainError> {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let best = match self.index.best_candidate() {
                Some(best) => best,
                None => break,
            };
            if Some(best) == self.tip {
                break;
            }
            if let Some(tip) = self.tip {
                let tip_failed = self.index.get(tip).status.failed();
                if !tip_failed
                    && self.index.get(best).chain_work <= self.index.get(tip).chain_work
                {
                    break;
                }
            }

            let fork = match self.tip {
                Some(tip) => self.index.last_common_ancestor(tip, best),
                None => None,
            };
            if let (Some(tip), Some(fork_handle)) = (self.tip, fork) {
                let depth = self.index.get(tip).height - self.index.get(fork_handle).height;
                if depth > self.params.max_reorg_depth {
                    warn!(
                        "refusing reorganization of depth {depth} to {}",
                        hex::encode(&self.index.get(best).hash[..8])
                    );
                    self.index.remove_candidate(best);
                    continue;
                }
                if depth > 0 {
                    info!(
                        "reorganizing: {} block(s) back to fork height {}",
                        depth,
                        self.index.get(fork_handle).height
                    );
                }
            }

            let mut disconnected = false;
            while self.tip.is_some() && self.tip != fork {
                if self.shutdown.load(Ordering::Acquire) {
                    return Ok(());
                }
                self.disconnect_tip()?;
                disconnected = true;
            }

            // Path from the fork (exclusive) up to the candidate.
            let mut path = Vec::new();
            let mut cursor = Some(best);
            while cursor != fork {
                match cursor {
                    Some(handle) => {
                        path.push(handle);
                        cursor = self.index.get(handle).prev;
                    }
                    None => break,
                }
            }
            path.reverse();

            let mut invalid_seen = false;
            for handle in path.into_iter().take(CONNECT_BATCH) {
                if self.shutdown.load(Ordering::Acquire) {
                    return Ok(());
                }
                match self.connect_tip(handle) {
                    Ok(()) => {}
                    Err(ChainError::Invalid(info)) => {
                        if info.corruption_possible {
                            return Err(ChainError::System(format!(
                                "possible corruption connecting {}: {}",
                                hex::encode(&self.index.get(handle).hash[..8]),
                                info.reason
                            )));
                        }
                        warn!(
                            "invalid block {}: {} ({})",
                            hex::encode(&self.index.get(handle).hash[..8]),
                            info.code,
                            info.reason
                        );
                        self.index.mark_failed(handle);
                        invalid_seen = true;
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }

            if disconnected {
                self.readmit_disconnected();
            }
            if let Some(tip) = self.tip {
                self.index.prune_candidates(tip);
                let (tip_hash, tip_height) = {
                    let entry = self.index.get(tip);
                    (entry.hash, entry.height)
                };
                for subscriber in &self.subscribers {
                    subscriber.tip_updated(&tip_hash, tip_height);
                }
            }
            if invalid_seen {
                continue;
            }
        }
        self.maybe_flush()
    }

    fn connect_tip(&mut self, handle: u32) -> Result<(), ChainError> {
        let (location, height, prev, prev_hash) = {
            let entry = self.index.get(handle);
            let location = entry
                .location
                .ok_or_else(|| ChainError::System("connect target has no data".into()))?;
            let prev_hash = entry
                .prev
                .map(|p| self.index.get(p).hash)
                .unwrap_or([0u8; 32]);
            (location, entry.height, entry.prev, prev_hash)
        };
        let bytes = self.store.files().read_block(&location)?;
        let block = Block::from_bytes(&bytes)
            .map_err(|e| ChainError::System(format!("stored block unreadable: {e}")))?;

        let expected_view = prev.map(|p| self.index.get(p).hash);
        if self.coins.best_block() != expected_view
            && !(expected_view.is_none() && self.coins.best_block().is_none())
        {
            return Err(ChainError::System("coin view out of sync with tip".into()));
        }

        let pos = block.is_proof_of_stake();
        let outcome;
        let coin_changes;
        let token_delta;
        {
            let ctx = ConnectContext {
                params: &self.params,
                height,
                median_time_past: self.median_time_past(prev),
                expected_bits: self.expected_bits(prev, pos),
                stake_modifier: prev
                    .map(|p| self.index.get(p).stake_modifier)
                    .unwrap_or([0u8; 32]),
                queue: &self.queue,
                script_cache: &self.script_cache,
                script_flags: MANDATORY_FLAGS,
            };
            let mut coins = CoinOverlay::new(&self.coins);
            let mut tokens = TokenOverlay::new(&self.tokens);
            outcome = connect_block(&block, &ctx, &mut coins, &mut tokens)?;
            coin_changes = coins.into_changes();
            token_delta = tokens.into_delta();
        }

        // Persist the undo record before the in-memory commit; HAVE_UNDO
        // must never point at bytes that are not on their way to disk.
        let undo_bytes = outcome.undo.to_bytes()?;
        let undo_offset =
            self.store
                .files_mut()
                .write_undo(location.file, &prev_hash, &undo_bytes)?;

        self.coins.apply(coin_changes);
        self.tokens.apply(token_delta);
        {
            let entry = self.index.get_mut(handle);
            entry.undo_offset = Some(undo_offset);
            entry.status.set(BlockStatus::HAVE_UNDO);
            entry.status.raise_validity(Validity::Scripts);
        }
        self.tip = Some(handle);

        index_block(
            &self.index_flags,
            &block,
            height,
            location,
            &outcome.spent_per_tx,
            true,
            &mut self.pending,
        )?;

        let mut conflicts = Vec::new();
        self.mempool
            .remove_for_block(&block.transactions, &mut conflicts);
        for tx in &block.transactions {
            self.disconnect_pool.remove(&tx.txid());
        }

        for subscriber in &self.subscribers {
            subscriber.block_connected(&block, height);
            for op in &outcome.governance {
                subscriber.governance_op(op, height);
            }
            for tx in &block.transactions {
                for output in &tx.outputs {
                    if let Ok(Some(TokenScript::Issue {
                        name,
                        ipfs_hash: Some(ipfs),
                        ..
                    })) = TokenScript::from_script(&output.script_pubkey)
                    {
                        subscriber.token_message(&name, &ipfs, height);
                    }
                }
            }
        }
        Ok(())
    }

    fn disconnect_tip(&mut self) -> Result<(), ChainError> {
        let tip = self
            .tip
            .ok_or_else(|| ChainError::System("no tip to disconnect".into()))?;
        let (location, undo_offset, height, prev, prev_hash) = {
            let entry = self.index.get(tip);
            let location = entry
                .location
                .ok_or_else(|| ChainError::System("tip block pruned".into()))?;
            let undo_offset = entry
                .undo_offset
                .ok_or_else(|| ChainError::System("tip has no undo data".into()))?;
            let prev_hash = entry
                .prev
                .map(|p| self.index.get(p).hash)
                .unwrap_or([0u8; 32]);
            (location, undo_offset, entry.height, entry.prev, prev_hash)
        };
        if prev.is_none() {
            return Err(ChainError::System("refusing to disconnect genesis".into()));
        }

        let bytes = self.store.files().read_block(&location)?;
        let block = Block::from_bytes(&bytes)
            .map_err(|e| ChainError::System(format!("stored block unreadable: {e}")))?;
        let undo_bytes = self
            .store
            .files()
            .read_undo(location.file, undo_offset, &prev_hash)?;
        let undo = BlockUndo::from_bytes(&undo_bytes)?;

        let result;
        let coin_changes;
        let token_delta;
        {
            let mut coins = CoinOverlay::new(&self.coins);
            let mut tokens = TokenOverlay::new(&self.tokens);
            result = disconnect_block(&block, &undo, prev_hash, &mut coins, &mut tokens)?;
            coin_changes = coins.into_changes();
            token_delta = tokens.into_delta();
        }
        match result {
            DisconnectResult::Failed => {
                return Err(ChainError::System(format!(
                    "disconnect of {} failed, view indeterminate",
                    hex::encode(&block.hash()[..8])
                )));
            }
            DisconnectResult::Unclean => {
                warn!(
                    "unclean disconnect of {}",
                    hex::encode(&block.hash()[..8])
                );
            }
            DisconnectResult::Ok => {}
        }

        self.coins.apply(coin_changes);
        self.tokens.apply(token_delta);
        self.tip = prev;

        index_block(
            &self.index_flags,
            &block,
            height,
            location,
            &undo_spent_per_tx(&block, &undo),
            false,
            &mut self.pending,
        )?;

        self.disconnect_pool
            .add_disconnected_block(&block.transactions);
        for subscriber in &self.subscribers {
            subscriber.block_disconnected(&block, height);
        }
        debug!(
            "disconnected {} (height {height})",
            hex::encode(&block.hash()[..8])
        );
        Ok(())
    }

    /// Replay the disconnect pool into the mempool, evicting anything that
    /// no longer applies (and its in-pool dependents)
    fn readmit_disconnected(&mut self) {
        let txs = self.disconnect_pool.drain_for_readmission();
        for tx in txs {
            let txid = tx.txid();
            let ctx = AcceptContext {
                view: &self.coins,
                tokens: &self.tokens,
                tip_height: self.tip.map(|t| self.index.get(t).height).unwrap_or(0),
                median_time_past: self.median_time_past(self.tip),
                params: &self.params,
                script_cache: &self.script_cache,
                bypass_limits: true,
                test_only: false,
            };
            match self.mempool.try_accept((*tx).clone(), &ctx) {
                Ok(_) => {}
                Err(err) => {
                    debug!(
                        "dropping disconnected tx {}: {err}",
                        hex::encode(&txid[..8])
                    );
                    let mut removed = Vec::new();
                    self.mempool.remove_recursive(&txid, &mut removed);
                }
            }
        }
    }

    fn submit_transaction(&mut self, tx: Transaction) -> Result<AcceptOutcome, ChainError> {
        let ctx = AcceptContext {
            view: &self.coins,
            tokens: &self.tokens,
            tip_height: self.tip.map(|t| self.index.get(t).height).unwrap_or(0),
            median_time_past: self.median_time_past(self.tip),
            params: &self.params,
            script_cache: &self.script_cache,
            bypass_limits: false,
            test_only: false,
        };
        let outcome = self.mempool.try_accept(tx.clone(), &ctx)?;
        for outpoint in &outcome.released {
            self.coins.uncache(outpoint);
        }
        for subscriber in &self.subscribers {
            subscriber.tx_accepted(&tx);
        }
        Ok(outcome)
    }

    fn invalidate_block(&mut self, hash: &Hash) -> Result<(), ChainError> {
        let handle = self
            .index
            .lookup(hash)
            .ok_or_else(|| ChainError::invalid("block-not-found", hex::encode(hash)))?;
        info!("invalidating block {}", hex::encode(&hash[..8]));

        // Walk the active chain back below the invalidated block first.
        while let Some(tip) = self.tip {
            if self.index.is_ancestor_of(handle, tip) {
                self.disconnect_tip()?;
            } else {
                break;
            }
        }
        self.index.mark_failed(handle);

        // Reseed candidates against the new, lower tip.
        let tip_work = self.tip_work();
        for h in 0..self.index.len() as u32 {
            self.index.maybe_add_candidate(h, &tip_work);
        }
        self.readmit_disconnected();
        self.activate_best_chain()
    }

    fn reconsider_block(&mut self, hash: &Hash) -> Result<(), ChainError> {
        let handle = self
            .index
            .lookup(hash)
            .ok_or_else(|| ChainError::invalid("block-not-found", hex::encode(hash)))?;
        info!("reconsidering block {}", hex::encode(&hash[..8]));
        let tip_work = self.tip_work();
        self.index.reconsider(handle, &tip_work);
        self.best_header = self.recompute_best_header();
        self.activate_best_chain()
    }

    fn precious_block(&mut self, hash: &Hash) -> Result<(), ChainError> {
        let handle = self
            .index
            .lookup(hash)
            .ok_or_else(|| ChainError::invalid("block-not-found", hex::encode(hash)))?;
        // Treat as if received first: an ever-decreasing sequence wins every
        // work tie.
        self.precious_seq -= 1;
        self.index.remove_candidate(handle);
        {
            let entry = self.index.get_mut(handle);
            entry.seq = self.precious_seq;
        }
        let tip_work = self.tip_work();
        self.index.maybe_add_candidate(handle, &tip_work);
        self.activate_best_chain()
    }

    fn prune_to_height(&mut self, height: u64) -> Result<Vec<u32>, ChainError> {
        let tip_height = self
            .tip
            .map(|t| self.index.get(t).height)
            .unwrap_or(0);
        let horizon = height.min(tip_height.saturating_sub(MIN_BLOCKS_TO_KEEP));
        let files = self.store.files().files_entirely_below(horizon);
        if files.is_empty() {
            return Ok(files);
        }
        // Flush first so no index entry references bytes we are deleting.
        self.flush()?;
        for handle in 0..self.index.len() as u32 {
            let in_pruned = self
                .index
                .get(handle)
                .location
                .map(|loc| files.contains(&loc.file))
                .unwrap_or(false);
            if in_pruned {
                let entry = self.index.get_mut(handle);
                entry.location = None;
                entry.undo_offset = None;
                entry.status.clear(BlockStatus::HAVE_DATA | BlockStatus::HAVE_UNDO);
            }
        }
        self.store.prune_files(&files)?;
        self.flush()?;
        Ok(files)
    }

    /// Enforce the configured prune budget, if any
    fn maybe_prune(&mut self) -> Result<(), ChainError> {
        let budget = match self.config.prune_target_bytes {
            Some(budget) => budget,
            None => return Ok(()),
        };
        if self.store.files().total_bytes() <= budget {
            return Ok(());
        }
        let tip_height = self.tip.map(|t| self.index.get(t).height).unwrap_or(0);
        self.prune_to_height(tip_height).map(|_| ())
    }

    fn verify_chain(&mut self, level: u32, depth: u64) -> Result<(), ChainError> {
        let level = level.min(4);
        let tip = match self.tip {
            Some(tip) => tip,
            None => return Ok(()),
        };
        info!("verifying {depth} block(s) at level {level}");

        let mut handles = Vec::new();
        let mut cursor = Some(tip);
        while let Some(handle) = cursor {
            if handles.len() as u64 >= depth || self.index.get(handle).prev.is_none() {
                break;
            }
            handles.push(handle);
            cursor = self.index.get(handle).prev;
        }

        let mut coins = CoinOverlay::new(&self.coins);
        let mut tokens = TokenOverlay::new(&self.tokens);
        let mut replayable: Vec<(u32, Block)> = Vec::new();

        for &handle in &handles {
            if self.shutdown.load(Ordering::Acquire) {
                return Ok(());
            }
            let entry = self.index.get(handle);
            let location = match entry.location {
                Some(location) => location,
                None => continue, // pruned
            };
            let prev_hash = entry
                .prev
                .map(|p| self.index.get(p).hash)
                .unwrap_or([0u8; 32]);
            let bytes = self.store.files().read_block(&location)?;
            let block = Block::from_bytes(&bytes).map_err(|e| {
                ChainError::System(format!("stored block unreadable at {}: {e}", entry.height))
            })?;
            if block.hash() != entry.hash {
                return Err(ChainError::System(format!(
                    "block hash mismatch at height {}",
                    entry.height
                )));
            }
            if level >= 1 {
                check_block(&block, &self.params)
                    .map_err(|e| ChainError::System(format!("level-1: {e}")))?;
            }
            if level >= 2 {
                if let Some(undo_offset) = entry.undo_offset {
                    let undo_bytes =
                        self.store
                            .files()
                            .read_undo(location.file, undo_offset, &prev_hash)?;
                    let undo = BlockUndo::from_bytes(&undo_bytes)?;
                    if level >= 3 {
                        let result =
                            disconnect_block(&block, &undo, prev_hash, &mut coins, &mut tokens)?;
                        if result == DisconnectResult::Failed {
                            return Err(ChainError::System(format!(
                                "level-3 disconnect failed at height {}",
                                entry.height
                            )));
                        }
                        replayable.push((handle, block));
                    }
                }
            }
        }

        if level >= 4 {
            for (handle, block) in replayable.into_iter().rev() {
                let (height, prev) = {
                    let entry = self.index.get(handle);
                    (entry.height, entry.prev)
                };
                let ctx = ConnectContext {
                    params: &self.params,
                    height,
                    median_time_past: self.median_time_past(prev),
                    expected_bits: block.header.bits,
                    stake_modifier: prev
                        .map(|p| self.index.get(p).stake_modifier)
                        .unwrap_or([0u8; 32]),
                    queue: &self.queue,
                    script_cache: &self.script_cache,
                    script_flags: MANDATORY_FLAGS,
                };
                connect_block(&block, &ctx, &mut coins, &mut tokens).map_err(|e| {
                    ChainError::System(format!("level-4 reconnect failed at {height}: {e}"))
                })?;
            }
        }
        // Scratch overlays are discarded.
        Ok(())
    }

    /// Startup recovery: reconcile the coin state with the two head-block
    /// markers after a possibly interrupted flush
    fn replay_blocks(&mut self) -> Result<(), ChainError> {
        let old_hash = self
            .store
            .index()
            .get(&keys::coin_old_tip_key())
            .map_err(|e| ChainError::System(e.to_string()))?
            .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok());
        let new_hash = self.coins.best_block();
        let (old_hash, new_hash) = match (old_hash, new_hash) {
            (Some(old), Some(new)) if old != new => (old, new),
            _ => return Ok(()),
        };
        info!(
            "replaying blocks: old tip {}, new tip {}",
            hex::encode(&old_hash[..8]),
            hex::encode(&new_hash[..8])
        );
        let old = self
            .index
            .lookup(&old_hash)
            .ok_or_else(|| ChainError::System("old tip unknown to index".into()))?;
        let new = self
            .index
            .lookup(&new_hash)
            .ok_or_else(|| ChainError::System("new tip unknown to index".into()))?;
        let fork = self
            .index
            .last_common_ancestor(old, new)
            .ok_or_else(|| ChainError::System("replay tips do not connect".into()))?;

        let coin_changes;
        let token_delta;
        {
            let mut coins = CoinOverlay::new(&self.coins);
            let mut tokens = TokenOverlay::new(&self.tokens);

            // Roll the partially flushed old chain back to the fork.
            let mut cursor = old;
            while cursor != fork {
                if self.shutdown.load(Ordering::Acquire) {
                    return Ok(());
                }
                let entry = self.index.get(cursor);
                let location = entry
                    .location
                    .ok_or_else(|| ChainError::System("replay block pruned".into()))?;
                let undo_offset = entry
                    .undo_offset
                    .ok_or_else(|| ChainError::System("replay block lacks undo".into()))?;
                let prev = entry
                    .prev
                    .ok_or_else(|| ChainError::System("replay descended to genesis".into()))?;
                let prev_hash = self.index.get(prev).hash;

                let bytes = self.store.files().read_block(&location)?;
                let block = Block::from_bytes(&bytes)
                    .map_err(|e| ChainError::System(format!("replay block unreadable: {e}")))?;
                let undo_bytes =
                    self.store
                        .files()
                        .read_undo(location.file, undo_offset, &prev_hash)?;
                let undo = BlockUndo::from_bytes(&undo_bytes)?;
                // An interrupted flush legitimately leaves half-applied
                // state; unclean results are expected here.
                if disconnect_block(&block, &undo, prev_hash, &mut coins, &mut tokens)?
                    == DisconnectResult::Failed
                {
                    return Err(ChainError::System("replay disconnect failed".into()));
                }
                cursor = prev;
            }

            // Roll forward to the new tip, overwrites permitted.
            let mut forward = Vec::new();
            let mut cursor = new;
            while cursor != fork {
                forward.push(cursor);
                cursor = match self.index.get(cursor).prev {
                    Some(prev) => prev,
                    None => break,
                };
            }
            for handle in forward.into_iter().rev() {
                if self.shutdown.load(Ordering::Acquire) {
                    return Ok(());
                }
                let entry = self.index.get(handle);
                let location = entry
                    .location
                    .ok_or_else(|| ChainError::System("replay block pruned".into()))?;
                let height = entry.height;
                let bytes = self.store.files().read_block(&location)?;
                let block = Block::from_bytes(&bytes)
                    .map_err(|e| ChainError::System(format!("replay block unreadable: {e}")))?;
                replay_apply_block(&block, height, &mut coins)?;
            }
            coins.set_best_block(new_hash);
            coin_changes = coins.into_changes();
            token_delta = tokens.into_delta();
        }
        self.coins.apply(coin_changes);
        self.tokens.apply(token_delta);
        self.tip = Some(new);
        self.flush()
    }

    fn dump_mempool(&mut self, path: &std::path::Path) -> Result<usize, ChainError> {
        let dump = self.mempool.dump();
        let count = dump.entries.len();
        let bytes = serde_json::to_vec_pretty(&dump)
            .map_err(|e| ChainError::System(format!("encode mempool dump: {e}")))?;
        std::fs::write(path, bytes)
            .map_err(|e| ChainError::System(format!("write mempool dump: {e}")))?;
        info!("dumped {count} mempool transaction(s)");
        Ok(count)
    }

    fn load_mempool(&mut self, path: &std::path::Path) -> Result<usize, ChainError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(ChainError::System(format!("read mempool dump: {e}"))),
        };
        let dump: MempoolDump = serde_json::from_slice(&bytes)
            .map_err(|e| ChainError::System(format!("parse mempool dump: {e}")))?;
        for (txid_hex, delta) in &dump.deltas {
            if let Ok(txid) = plumecoin_util::hex_to_hash(txid_hex) {
                self.mempool.prioritise(txid, *delta);
            }
        }
        let mut loaded = 0usize;
        for entry in dump.entries {
            let raw = match hex::decode(&entry.tx_hex) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let tx = match Transaction::from_bytes(&raw) {
                Ok(tx) => tx,
                Err(_) => continue,
            };
            let ctx = AcceptContext {
                view: &self.coins,
                tokens: &self.tokens,
                tip_height: self.tip.map(|t| self.index.get(t).height).unwrap_or(0),
                median_time_past: self.median_time_past(self.tip),
                params: &self.params,
                script_cache: &self.script_cache,
                bypass_limits: false,
                test_only: false,
            };
            if self.mempool.try_accept(tx, &ctx).is_ok() {
                loaded += 1;
            }
        }
        info!("loaded {loaded} mempool transaction(s)");
        Ok(loaded)
    }

    /// Write every dirty structure through the disk store
    fn flush(&mut self) -> Result<(), ChainError> {
        let mut batch = WriteBatch::new();
        for handle in self.index.take_dirty() {
            let record = self.index.to_disk(handle);
            let hash = self.index.get(handle).hash;
            batch
                .put_json(keys::block_index_key(&hash), &record)
                .map_err(|e| ChainError::System(e.to_string()))?;
        }
        self.store
            .files()
            .file_info_batch(&mut batch)
            .map_err(|e| ChainError::System(e.to_string()))?;
        batch.extend(std::mem::take(&mut self.pending));
        self.coins.flush_into(&mut batch)?;
        self.tokens.flush_into(&mut batch)?;
        self.store.flush(batch)?;
        // Every chunk landed; the markers may agree again.
        if let Some(best) = self.coins.best_block() {
            let mut equalize = WriteBatch::new();
            equalize.put(keys::coin_old_tip_key(), best.to_vec());
            self.store
                .index()
                .commit(equalize)
                .map_err(|e| ChainError::System(e.to_string()))?;
        }
        debug!("flush complete");
        Ok(())
    }

    fn maybe_flush(&mut self) -> Result<(), ChainError> {
        if self.coins.dynamic_usage() > self.config.coin_cache_bytes {
            info!(
                "coin cache over budget ({} bytes), flushing",
                self.coins.dynamic_usage()
            );
            self.flush()?;
        }
        self.maybe_prune()
    }
}

/// Apply a block's UTXO effects without validation, overwrites permitted
/// (used only by startup replay over possibly half-flushed state)
fn replay_apply_block(
    block: &Block,
    height: u64,
    coins: &mut CoinOverlay<'_>,
) -> Result<(), ChainError> {
    for tx in &block.transactions {
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                // A previous partial flush may have removed it already.
                let _ = coins.spend(&input.prevout);
            }
        }
        let txid = tx.txid();
        let is_coinstake = tx.is_coinstake();
        for (vout, output) in tx.outputs.iter().enumerate() {
            if output.script_pubkey.is_unspendable() {
                continue;
            }
            coins.add(
                plumecoin_core::OutPoint::new(txid, vout as u32),
                crate::coins::Coin::new(
                    output.clone(),
                    height,
                    block.header.timestamp,
                    tx.is_coinbase(),
                    is_coinstake,
                ),
                true,
            )?;
        }
    }
    Ok(())
}

/// Reshape a block's undo record into the per-tx spent-coin lists the
/// secondary indices expect
fn undo_spent_per_tx(
    block: &Block,
    undo: &BlockUndo,
) -> Vec<Vec<(plumecoin_core::OutPoint, crate::coins::Coin)>> {
    let mut out = Vec::with_capacity(block.transactions.len());
    for (tx_index, tx) in block.transactions.iter().enumerate() {
        if tx.is_coinbase() || tx_index == 0 {
            out.push(Vec::new());
            continue;
        }
        let spent = undo
            .tx_undos
            .get(tx_index - 1)
            .map(|tx_undo| {
                tx.inputs
                    .iter()
                    .map(|input| input.prevout)
                    .zip(tx_undo.spent.iter().cloned())
                    .collect()
            })
            .unwrap_or_default();
        out.push(spent);
    }
    out
}
