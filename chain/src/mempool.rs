//! Transaction Mempool
//!
//! An indexed set of unconfirmed transactions: lookup by txid, conflict
//! tracking by spent outpoint, and parent/child edges whose transitive
//! closures (ancestor and descendant aggregates) gate admission. Entries
//! order by modified fee rate for eviction. The accept path implements the
//! staged pipeline: structural and standardness checks, conflict detection,
//! input resolution through the pool-augmented coin view, fee and sigop
//! limits, ancestor limits, then script verification under standardness
//! flags with a mandatory-flag retry to classify failures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use plumecoin_consensus::{
    check_transaction, verify_script, ConsensusParams, SighashCache, TransactionSigChecker,
    MANDATORY_FLAGS, MAX_STANDARD_TX_SIGOPS, STANDARD_FLAGS,
};
use plumecoin_core::{Amount, Hash, OutPoint, ScriptForm, Transaction};

use crate::coins::{Coin, CoinView, MEMPOOL_HEIGHT};
use crate::connect::{check_inputs, check_sequence_locks, check_token_rules};
use crate::error::ChainError;
use crate::scriptcheck::ScriptCache;
use crate::tokens::TokenView;

/// Standardness cap on serialized transaction size
pub const MAX_STANDARD_TX_SIZE: usize = 100_000;

/// Standardness cap on scriptSig size
pub const MAX_STANDARD_SCRIPTSIG_SIZE: usize = 1650;

/// Outputs below this many base units are dust unless they carry data or
/// token payloads
pub const DUST_THRESHOLD: Amount = 546;

/// Mempool tuning knobs
#[derive(Debug, Clone)]
pub struct MempoolConfig {
    /// Virtual-size budget for the whole pool
    pub max_vbytes: usize,
    /// Transitive in-pool ancestor count cap (the entry itself included)
    pub ancestor_limit: usize,
    /// Ancestor virtual-size cap
    pub ancestor_size_limit: usize,
    /// Transitive descendant count cap
    pub descendant_limit: usize,
    /// Descendant virtual-size cap
    pub descendant_size_limit: usize,
    /// Minimum fee per 1000 vbytes
    pub min_relay_fee_per_kvb: Amount,
    /// Entries older than this many seconds expire at the next trim
    pub expiry_secs: u64,
    #[cfg(feature = "replacement")]
    /// Extra fee per vbyte a replacement must add
    pub incremental_relay_fee_per_kvb: Amount,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        MempoolConfig {
            max_vbytes: 300_000_000,
            ancestor_limit: 25,
            ancestor_size_limit: 101_000,
            descendant_limit: 25,
            descendant_size_limit: 101_000,
            min_relay_fee_per_kvb: 1000,
            expiry_secs: 14 * 24 * 60 * 60,
            #[cfg(feature = "replacement")]
            incremental_relay_fee_per_kvb: 1000,
        }
    }
}

/// Replacement policy cap on evicted descendants
#[cfg(feature = "replacement")]
const MAX_REPLACEMENT_EVICTIONS: usize = 100;

/// One pool entry
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Arc<Transaction>,
    pub txid: Hash,
    pub fee: Amount,
    /// Operator-applied fee adjustment
    pub fee_delta: Amount,
    /// Unix time of admission
    pub time: u64,
    pub vsize: usize,
    pub sigops: u32,
    /// Tip height at admission
    pub height: u64,
    /// Node-local insertion order, for reorg replay
    pub seq: u64,
    // Transitive aggregates, the entry itself included.
    pub count_with_ancestors: usize,
    pub size_with_ancestors: usize,
    pub fees_with_ancestors: Amount,
    pub count_with_descendants: usize,
    pub size_with_descendants: usize,
    pub fees_with_descendants: Amount,
}

impl MempoolEntry {
    pub fn modified_fee(&self) -> Amount {
        self.fee + self.fee_delta
    }
}

/// What a successful accept produced
#[derive(Debug)]
pub struct AcceptOutcome {
    pub txid: Hash,
    pub fee: Amount,
    pub vsize: usize,
    /// Entries evicted by replacement
    pub replaced: Vec<Hash>,
    /// Spent outpoints of entries evicted while trimming; the coin cache
    /// may release their read slots
    pub released: Vec<OutPoint>,
}

/// Everything the accept path needs from the chain state
pub struct AcceptContext<'a> {
    pub view: &'a dyn CoinView,
    pub tokens: &'a dyn TokenView,
    /// Active tip height; the tx validates for inclusion at tip + 1
    pub tip_height: u64,
    pub median_time_past: u32,
    pub params: &'a ConsensusParams,
    pub script_cache: &'a ScriptCache,
    /// Skip fee and ancestor limits (reorg re-admission)
    pub bypass_limits: bool,
    /// Validate without mutating the pool
    pub test_only: bool,
}

/// Coin view augmented with the outputs of in-pool transactions
pub struct MempoolCoinView<'a> {
    pub base: &'a dyn CoinView,
    pub mempool: &'a Mempool,
}

impl CoinView for MempoolCoinView<'_> {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainError> {
        if let Some(coin) = self.base.coin(outpoint)? {
            return Ok(Some(coin));
        }
        if let Some(entry) = self.mempool.get(&outpoint.txid) {
            if let Some(output) = entry.tx.outputs.get(outpoint.vout as usize) {
                return Ok(Some(Coin::new(
                    output.clone(),
                    MEMPOOL_HEIGHT,
                    0,
                    false,
                    false,
                )));
            }
        }
        Ok(None)
    }

    fn best_block(&self) -> Option<Hash> {
        self.base.best_block()
    }
}

/// The mempool proper
pub struct Mempool {
    config: MempoolConfig,
    entries: HashMap<Hash, MempoolEntry>,
    /// outpoint -> txid of the in-pool spender
    by_spent: HashMap<OutPoint, Hash>,
    parents: HashMap<Hash, HashSet<Hash>>,
    children: HashMap<Hash, HashSet<Hash>>,
    /// Fee deltas survive even when the tx is not (yet) in the pool
    deltas: HashMap<Hash, Amount>,
    next_seq: u64,
    total_vsize: usize,
}

/// Serialized pool image for dump/load
#[derive(Debug, Serialize, Deserialize)]
pub struct MempoolDump {
    pub version: u32,
    pub entries: Vec<MempoolDumpEntry>,
    pub deltas: Vec<(String, Amount)>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MempoolDumpEntry {
    pub tx_hex: String,
    pub time: u64,
    pub fee_delta: Amount,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Mempool {
            config,
            entries: HashMap::new(),
            by_spent: HashMap::new(),
            parents: HashMap::new(),
            children: HashMap::new(),
            deltas: HashMap::new(),
            next_seq: 1,
            total_vsize: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_vsize(&self) -> usize {
        self.total_vsize
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    /// The in-pool transaction spending an outpoint, if any
    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<Hash> {
        self.by_spent.get(outpoint).copied()
    }

    /// Entries in insertion order, for reorg replay and dumps
    pub fn entries_by_insertion(&self) -> Vec<&MempoolEntry> {
        let mut all: Vec<&MempoolEntry> = self.entries.values().collect();
        all.sort_by_key(|entry| entry.seq);
        all
    }

    /// Apply an operator fee adjustment
    pub fn prioritise(&mut self, txid: Hash, delta: Amount) {
        *self.deltas.entry(txid).or_insert(0) += delta;
        if self.entries.contains_key(&txid) {
            let ancestors = self.transitive(&txid, Direction::Ancestors);
            let descendants = self.transitive(&txid, Direction::Descendants);
            if let Some(entry) = self.entries.get_mut(&txid) {
                entry.fee_delta += delta;
                entry.fees_with_ancestors += delta;
                entry.fees_with_descendants += delta;
            }
            for a in ancestors {
                if let Some(entry) = self.entries.get_mut(&a) {
                    entry.fees_with_descendants += delta;
                }
            }
            for d in descendants {
                if let Some(entry) = self.entries.get_mut(&d) {
                    entry.fees_with_ancestors += delta;
                }
            }
        }
        info!(
            "prioritised {}: delta {delta}",
            hex::encode(&txid[..8])
        );
    }

    /// The staged admission pipeline
    pub fn try_accept(
        &mut self,
        tx: Transaction,
        ctx: &AcceptContext<'_>,
    ) -> Result<AcceptOutcome, ChainError> {
        let txid = tx.txid();

        // 1. Structural and standardness checks.
        check_transaction(&tx)?;
        if tx.is_coinbase() {
            return Err(ChainError::invalid("coinbase", "coinbase in mempool"));
        }
        if tx.is_coinstake() {
            return Err(ChainError::invalid("coinstake", "coinstake in mempool"));
        }
        self.check_standardness(&tx, ctx.params)?;
        if !tx.is_final(ctx.tip_height + 1, ctx.median_time_past as i64) {
            return Err(ChainError::invalid("non-final", "lock time not satisfied"));
        }
        if self.entries.contains_key(&txid) {
            return Err(ChainError::Duplicate(txid));
        }

        // 2. Conflict detection.
        let mut conflicts: Vec<Hash> = Vec::new();
        for input in &tx.inputs {
            if let Some(spender) = self.by_spent.get(&input.prevout) {
                if !conflicts.contains(spender) {
                    conflicts.push(*spender);
                }
            }
        }
        #[cfg(not(feature = "replacement"))]
        if !conflicts.is_empty() {
            return Err(ChainError::invalid(
                "txn-mempool-conflict",
                "input already spent in pool",
            ));
        }

        // 3. Input availability through the pool-augmented view.
        let pool_view = MempoolCoinView {
            base: ctx.view,
            mempool: self,
        };
        let mut spent_coins = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            match pool_view.coin(&input.prevout)? {
                Some(coin) => spent_coins.push(coin),
                None => return Err(ChainError::MissingInputs),
            }
        }

        #[cfg(feature = "replacement")]
        if !conflicts.is_empty() {
            self.check_replacement(&tx, &conflicts, &spent_coins, ctx)?;
        }

        // 4. Fee and sigop limits.
        let fee = check_inputs(&tx, &spent_coins, ctx.tip_height + 1)?;
        check_sequence_locks(&tx, &spent_coins, ctx.tip_height + 1, ctx.median_time_past)?;
        check_token_rules(&tx, &spent_coins, ctx.tokens)?;

        let sigops = tx.sigop_count();
        if sigops > MAX_STANDARD_TX_SIGOPS {
            return Err(ChainError::invalid(
                "bad-txns-too-many-sigops",
                format!("{sigops}"),
            ));
        }
        let vsize = tx.vsize();
        let fee_delta = self.deltas.get(&txid).copied().unwrap_or(0);
        let modified_fee = fee + fee_delta;
        if !ctx.bypass_limits && modified_fee < self.min_fee(vsize) {
            return Err(ChainError::invalid(
                "min-relay-fee-not-met",
                format!("{modified_fee} < {}", self.min_fee(vsize)),
            ));
        }

        // 5. Ancestor and descendant limits.
        let parent_ids: HashSet<Hash> = tx
            .inputs
            .iter()
            .filter(|input| self.entries.contains_key(&input.prevout.txid))
            .map(|input| input.prevout.txid)
            .collect();
        let ancestors = self.calculate_ancestors(&parent_ids, vsize, !ctx.bypass_limits)?;

        // 6 & 7. Script verification: standardness flags first, a retry
        // under mandatory flags classifies the failure; success under both
        // is cached so the connect path can skip the work.
        self.verify_scripts(&tx, &spent_coins, ctx)?;

        if ctx.test_only {
            return Ok(AcceptOutcome {
                txid,
                fee,
                vsize,
                replaced: Vec::new(),
                released: Vec::new(),
            });
        }

        // 8. Commit: evict replaced entries, insert, index, trim.
        let mut replaced = Vec::new();
        #[cfg(feature = "replacement")]
        for conflict in conflicts {
            self.remove_recursive(&conflict, &mut replaced);
        }

        let entry = MempoolEntry {
            txid,
            fee,
            fee_delta,
            time: plumecoin_core::current_timestamp(),
            vsize,
            sigops,
            height: ctx.tip_height,
            seq: self.next_seq,
            count_with_ancestors: 0,
            size_with_ancestors: 0,
            fees_with_ancestors: 0,
            count_with_descendants: 1,
            size_with_descendants: vsize,
            fees_with_descendants: modified_fee,
            tx: Arc::new(tx),
        };
        self.next_seq += 1;
        self.insert_entry(entry, &ancestors, &parent_ids);

        let mut evicted = Vec::new();
        let released = self.trim(&mut evicted);
        if evicted.iter().any(|id| *id == txid) {
            return Err(ChainError::invalid("mempool-full", "evicted on admission"));
        }
        debug!(
            "accepted {} fee {fee} vsize {vsize} (pool: {} tx)",
            hex::encode(&txid[..8]),
            self.entries.len()
        );
        Ok(AcceptOutcome {
            txid,
            fee,
            vsize,
            replaced,
            released,
        })
    }

    fn check_standardness(
        &self,
        tx: &Transaction,
        params: &ConsensusParams,
    ) -> Result<(), ChainError> {
        if tx.version < params.min_tx_version || tx.version > 2 {
            return Err(ChainError::invalid("version", format!("{}", tx.version)));
        }
        if tx.vsize() > MAX_STANDARD_TX_SIZE {
            return Err(ChainError::invalid("tx-size", format!("{}", tx.vsize())));
        }
        for input in &tx.inputs {
            if input.script_sig.len() > MAX_STANDARD_SCRIPTSIG_SIZE {
                return Err(ChainError::invalid("scriptsig-size", "oversized scriptSig"));
            }
        }
        for output in &tx.outputs {
            match output.script_pubkey.form() {
                ScriptForm::Nonstandard => {
                    return Err(ChainError::invalid("scriptpubkey", "nonstandard output"));
                }
                ScriptForm::OpReturn(_) => {}
                _ => {
                    let carries_token = output
                        .script_pubkey
                        .token_split()
                        .1
                        .is_some();
                    if output.value < DUST_THRESHOLD && !carries_token {
                        return Err(ChainError::invalid("dust", format!("{}", output.value)));
                    }
                }
            }
        }
        Ok(())
    }

    fn verify_scripts(
        &self,
        tx: &Transaction,
        spent_coins: &[Coin],
        ctx: &AcceptContext<'_>,
    ) -> Result<(), ChainError> {
        let standard_key = ctx.script_cache.key(&tx.wtxid(), STANDARD_FLAGS);
        if ctx.script_cache.contains(&standard_key) {
            return Ok(());
        }
        let sighash = SighashCache::new(tx);
        for (input_index, coin) in spent_coins.iter().enumerate() {
            let checker = TransactionSigChecker {
                tx,
                input_index,
                cache: &sighash,
            };
            let script_sig = &tx.inputs[input_index].script_sig;
            if verify_script(
                script_sig,
                &coin.output.script_pubkey,
                STANDARD_FLAGS,
                &checker,
            )
            .is_err()
            {
                // Classify: a spend that satisfies the mandatory flags only
                // violates policy; one that fails them is consensus-invalid.
                return match verify_script(
                    script_sig,
                    &coin.output.script_pubkey,
                    MANDATORY_FLAGS,
                    &checker,
                ) {
                    Ok(()) => Err(ChainError::invalid(
                        "non-mandatory-script-verify-flag",
                        format!("input {input_index}"),
                    )),
                    Err(err) => Err(ChainError::invalid(
                        "mandatory-script-verify-flag-failed",
                        err.to_string(),
                    )),
                };
            }
        }
        ctx.script_cache.insert(standard_key);
        ctx.script_cache
            .insert(ctx.script_cache.key(&tx.wtxid(), MANDATORY_FLAGS));
        Ok(())
    }

    fn min_fee(&self, vsize: usize) -> Amount {
        (self.config.min_relay_fee_per_kvb * vsize as Amount) / 1000
    }

    /// Transitive in-pool ancestors of a prospective entry, with limits
    pub fn calculate_ancestors(
        &self,
        parents: &HashSet<Hash>,
        new_vsize: usize,
        enforce_limits: bool,
    ) -> Result<HashSet<Hash>, ChainError> {
        let mut ancestors: HashSet<Hash> = HashSet::new();
        let mut queue: VecDeque<Hash> = parents.iter().copied().collect();
        let mut total_size = new_vsize;
        while let Some(current) = queue.pop_front() {
            if !ancestors.insert(current) {
                continue;
            }
            let entry = self
                .entries
                .get(&current)
                .ok_or_else(|| ChainError::System("mempool edge to missing entry".into()))?;
            total_size += entry.vsize;
            if enforce_limits {
                if ancestors.len() + 1 > self.config.ancestor_limit {
                    return Err(ChainError::invalid(
                        "too-long-mempool-chain",
                        format!("{} ancestors", ancestors.len() + 1),
                    ));
                }
                if total_size > self.config.ancestor_size_limit {
                    return Err(ChainError::invalid(
                        "too-long-mempool-chain",
                        "ancestor size limit",
                    ));
                }
                if entry.count_with_descendants + 1 > self.config.descendant_limit
                    || entry.size_with_descendants + new_vsize > self.config.descendant_size_limit
                {
                    return Err(ChainError::invalid(
                        "too-long-mempool-chain",
                        format!("descendant limit of {}", hex::encode(&current[..8])),
                    ));
                }
            }
            if let Some(grandparents) = self.parents.get(&current) {
                queue.extend(grandparents.iter().copied());
            }
        }
        Ok(ancestors)
    }

    fn insert_entry(
        &mut self,
        mut entry: MempoolEntry,
        ancestors: &HashSet<Hash>,
        parents: &HashSet<Hash>,
    ) {
        let txid = entry.txid;
        let vsize = entry.vsize;
        let modified = entry.modified_fee();

        entry.count_with_ancestors = ancestors.len() + 1;
        entry.size_with_ancestors =
            vsize + ancestors
                .iter()
                .filter_map(|a| self.entries.get(a))
                .map(|a| a.vsize)
                .sum::<usize>();
        entry.fees_with_ancestors = modified
            + ancestors
                .iter()
                .filter_map(|a| self.entries.get(a))
                .map(|a| a.modified_fee())
                .sum::<Amount>();

        for ancestor in ancestors {
            if let Some(a) = self.entries.get_mut(ancestor) {
                a.count_with_descendants += 1;
                a.size_with_descendants += vsize;
                a.fees_with_descendants += modified;
            }
        }

        for input in &entry.tx.inputs {
            self.by_spent.insert(input.prevout, txid);
        }
        for parent in parents {
            self.parents.entry(txid).or_default().insert(*parent);
            self.children.entry(*parent).or_default().insert(txid);
        }
        self.total_vsize += vsize;
        self.entries.insert(txid, entry);
    }

    /// Remove an entry and everything that descends from it
    pub fn remove_recursive(&mut self, txid: &Hash, removed: &mut Vec<Hash>) {
        let mut to_remove: Vec<Hash> = self
            .transitive(txid, Direction::Descendants)
            .into_iter()
            .collect();
        to_remove.push(*txid);
        // Children before parents keeps aggregate updates consistent.
        to_remove.sort_by_key(|id| {
            std::cmp::Reverse(self.entries.get(id).map(|entry| entry.seq).unwrap_or(0))
        });
        for id in to_remove {
            if self.remove_single(&id) {
                removed.push(id);
            }
        }
    }

    fn remove_single(&mut self, txid: &Hash) -> bool {
        let entry = match self.entries.remove(txid) {
            Some(entry) => entry,
            None => return false,
        };
        let vsize = entry.vsize;
        let modified = entry.modified_fee();

        for ancestor in self.transitive(txid, Direction::Ancestors) {
            if let Some(a) = self.entries.get_mut(&ancestor) {
                a.count_with_descendants -= 1;
                a.size_with_descendants -= vsize;
                a.fees_with_descendants -= modified;
            }
        }
        for descendant in self.transitive(txid, Direction::Descendants) {
            if let Some(d) = self.entries.get_mut(&descendant) {
                d.count_with_ancestors -= 1;
                d.size_with_ancestors -= vsize;
                d.fees_with_ancestors -= modified;
            }
        }

        for input in &entry.tx.inputs {
            self.by_spent.remove(&input.prevout);
        }
        if let Some(parents) = self.parents.remove(txid) {
            for parent in parents {
                if let Some(children) = self.children.get_mut(&parent) {
                    children.remove(txid);
                }
            }
        }
        if let Some(children) = self.children.remove(txid) {
            for child in children {
                if let Some(parents) = self.parents.get_mut(&child) {
                    parents.remove(txid);
                }
            }
        }
        self.total_vsize -= vsize;
        true
    }

    fn transitive(&self, txid: &Hash, direction: Direction) -> HashSet<Hash> {
        let edges = match direction {
            Direction::Ancestors => &self.parents,
            Direction::Descendants => &self.children,
        };
        let mut seen = HashSet::new();
        let mut queue: VecDeque<Hash> = edges
            .get(txid)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        while let Some(current) = queue.pop_front() {
            if seen.insert(current) {
                if let Some(next) = edges.get(&current) {
                    queue.extend(next.iter().copied());
                }
            }
        }
        seen
    }

    /// Remove transactions confirmed by a connected block, and evict
    /// anything that conflicts with its spends
    pub fn remove_for_block(&mut self, txs: &[Transaction], removed_conflicts: &mut Vec<Hash>) {
        for tx in txs {
            let txid = tx.txid();
            if self.entries.contains_key(&txid) {
                self.remove_single(&txid);
                continue;
            }
            for input in &tx.inputs {
                if let Some(spender) = self.by_spent.get(&input.prevout).copied() {
                    self.remove_recursive(&spender, removed_conflicts);
                }
            }
        }
    }

    /// Evict the worst packages until the pool fits its budget; expired
    /// entries go first. Returns the spent outpoints of evicted entries so
    /// the coin cache can release their slots.
    pub fn trim(&mut self, evicted: &mut Vec<Hash>) -> Vec<OutPoint> {
        let mut released = Vec::new();
        let now = plumecoin_core::current_timestamp();
        let expiry_cutoff = now.saturating_sub(self.config.expiry_secs);
        let expired: Vec<Hash> = self
            .entries
            .values()
            .filter(|entry| entry.time < expiry_cutoff)
            .map(|entry| entry.txid)
            .collect();
        for txid in expired {
            if let Some(entry) = self.entries.get(&txid) {
                released.extend(entry.tx.inputs.iter().map(|i| i.prevout));
            }
            self.remove_recursive(&txid, evicted);
        }

        while self.total_vsize > self.config.max_vbytes {
            // Lowest descendant-package fee rate loses.
            let victim = match self.entries.values().min_by(|a, b| {
                let lhs = a.fees_with_descendants as i128 * b.size_with_descendants as i128;
                let rhs = b.fees_with_descendants as i128 * a.size_with_descendants as i128;
                lhs.cmp(&rhs).then(b.seq.cmp(&a.seq))
            }) {
                Some(entry) => entry.txid,
                None => break,
            };
            if let Some(entry) = self.entries.get(&victim) {
                released.extend(entry.tx.inputs.iter().map(|i| i.prevout));
            }
            self.remove_recursive(&victim, evicted);
        }
        released
    }

    #[cfg(feature = "replacement")]
    fn check_replacement(
        &self,
        tx: &Transaction,
        conflicts: &[Hash],
        spent_coins: &[Coin],
        _ctx: &AcceptContext<'_>,
    ) -> Result<(), ChainError> {
        // (b) every input of the replacement is confirmed.
        if spent_coins.iter().any(|coin| coin.height == MEMPOOL_HEIGHT) {
            return Err(ChainError::invalid(
                "replacement-adds-unconfirmed",
                "replacement spends unconfirmed input",
            ));
        }

        let new_vsize = tx.vsize() as i128;
        let new_fee = {
            let value_in: Amount = spent_coins.iter().map(|c| c.output.value).sum();
            value_in - tx.output_value()
        };

        let mut replaced_fees: Amount = 0;
        let mut evictions = 0usize;
        for conflict in conflicts {
            let entry = self
                .entries
                .get(conflict)
                .ok_or_else(|| ChainError::System("conflict vanished".into()))?;
            // (a) strictly higher fee rate than each replaced entry.
            let lhs = new_fee as i128 * entry.vsize as i128;
            let rhs = entry.modified_fee() as i128 * new_vsize;
            if lhs <= rhs {
                return Err(ChainError::invalid(
                    "insufficient-fee",
                    "replacement fee rate not higher",
                ));
            }
            // (d) bounded eviction set.
            evictions += 1 + self.transitive(conflict, Direction::Descendants).len();
            replaced_fees += entry.fees_with_descendants;
        }
        if evictions > MAX_REPLACEMENT_EVICTIONS {
            return Err(ChainError::invalid(
                "too-many-replacements",
                format!("{evictions} evictions"),
            ));
        }
        // (c) pays for what it evicts plus its own relay.
        let incremental =
            (self.config.incremental_relay_fee_per_kvb * tx.vsize() as Amount) / 1000;
        if new_fee < replaced_fees + incremental {
            return Err(ChainError::invalid(
                "insufficient-fee",
                "replacement does not cover replaced fees",
            ));
        }
        Ok(())
    }

    /// Serialize the pool for `dump_mempool`
    pub fn dump(&self) -> MempoolDump {
        use plumecoin_core::Encodable;
        MempoolDump {
            version: 1,
            entries: self
                .entries_by_insertion()
                .into_iter()
                .map(|entry| MempoolDumpEntry {
                    tx_hex: hex::encode(entry.tx.to_bytes()),
                    time: entry.time,
                    fee_delta: entry.fee_delta,
                })
                .collect(),
            deltas: self
                .deltas
                .iter()
                .map(|(txid, delta)| (hex::encode(txid), *delta))
                .collect(),
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Ancestors,
    Descendants,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scriptcheck::ScriptCache;
    use crate::tokens::TipTokenCache;
    use plumecoin_core::script::push_slice;
    use plumecoin_core::transaction::{TxIn, TxOut, SEQUENCE_FINAL};
    use plumecoin_core::{Script, COIN};
    use plumecoin_crypto::{pubkey_hash, sign_digest};
    use secp256k1::{Secp256k1, SecretKey};
    use std::collections::HashMap as StdHashMap;

    struct TestView {
        coins: StdHashMap<OutPoint, Coin>,
    }

    impl CoinView for TestView {
        fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainError> {
            Ok(self.coins.get(outpoint).cloned())
        }
        fn best_block(&self) -> Option<Hash> {
            Some([0u8; 32])
        }
    }

    struct TestWallet {
        secret: SecretKey,
        pubkey: Vec<u8>,
        script: Script,
    }

    impl TestWallet {
        fn new() -> Self {
            let secp = Secp256k1::new();
            let (secret, public) = secp.generate_keypair(&mut rand::thread_rng());
            let pubkey = public.serialize().to_vec();
            let script = Script::p2pkh(&pubkey_hash(&pubkey));
            TestWallet {
                secret,
                pubkey,
                script,
            }
        }

        fn sign(&self, tx: &mut Transaction, input_index: usize) {
            let cache = SighashCache::new(tx);
            let digest = cache.signature_hash(
                tx,
                input_index,
                &self.script,
                plumecoin_consensus::SIGHASH_ALL,
            );
            let mut signature = sign_digest(&digest, &self.secret).unwrap();
            signature.push(plumecoin_consensus::SIGHASH_ALL as u8);
            let mut sig_bytes = Vec::new();
            push_slice(&mut sig_bytes, &signature);
            push_slice(&mut sig_bytes, &self.pubkey);
            tx.inputs[input_index].script_sig = Script(sig_bytes);
        }
    }

    struct Fixture {
        wallet: TestWallet,
        view: TestView,
        tokens: TipTokenCache,
        params: ConsensusParams,
        cache: ScriptCache,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let db = plumecoin_storage::IndexDb::open(dir.path().join("index.db")).unwrap();
            std::mem::forget(dir);
            Fixture {
                wallet: TestWallet::new(),
                view: TestView {
                    coins: StdHashMap::new(),
                },
                tokens: TipTokenCache::new(std::sync::Arc::new(db)),
                params: ConsensusParams::regtest(),
                cache: ScriptCache::new(1024),
            }
        }

        fn fund(&mut self, tag: u8, value: Amount) -> OutPoint {
            let outpoint = OutPoint::new([tag; 32], 0);
            self.view.coins.insert(
                outpoint,
                Coin::new(
                    TxOut::new(value, self.wallet.script.clone()),
                    10,
                    1_600_000_000,
                    false,
                    false,
                ),
            );
            outpoint
        }

        fn ctx(&self) -> AcceptContext<'_> {
            AcceptContext {
                view: &self.view,
                tokens: &self.tokens,
                tip_height: 500,
                median_time_past: 1_650_000_000,
                params: &self.params,
                script_cache: &self.cache,
                bypass_limits: false,
                test_only: false,
            }
        }

        /// A signed spend of `outpoint` paying `value` back to the wallet
        fn spend(&self, outpoint: OutPoint, value: Amount) -> Transaction {
            let mut tx = Transaction::new(
                1,
                vec![TxIn::new(outpoint, Script::default(), SEQUENCE_FINAL)],
                vec![TxOut::new(value, self.wallet.script.clone())],
                0,
            );
            self.wallet.sign(&mut tx, 0);
            tx
        }
    }

    #[test]
    fn test_accept_and_duplicate() {
        let mut fixture = Fixture::new();
        let outpoint = fixture.fund(1, COIN);
        let tx = fixture.spend(outpoint, COIN - 10_000);

        let mut pool = Mempool::new(MempoolConfig::default());
        let outcome = pool.try_accept(tx.clone(), &fixture.ctx()).unwrap();
        assert_eq!(outcome.fee, 10_000);
        assert!(pool.contains(&outcome.txid));

        assert!(matches!(
            pool.try_accept(tx, &fixture.ctx()),
            Err(ChainError::Duplicate(_))
        ));
    }

    #[test]
    fn test_missing_inputs_is_not_invalid() {
        let fixture = Fixture::new();
        let tx = fixture.spend(OutPoint::new([99u8; 32], 0), COIN / 2);
        let mut pool = Mempool::new(MempoolConfig::default());
        assert!(matches!(
            pool.try_accept(tx, &fixture.ctx()),
            Err(ChainError::MissingInputs)
        ));
    }

    #[test]
    fn test_conflict_rejected_with_replacement_off() {
        let mut fixture = Fixture::new();
        let outpoint = fixture.fund(1, COIN);

        let mut pool = Mempool::new(MempoolConfig::default());
        let t1 = fixture.spend(outpoint, COIN - 10_000);
        let t1_id = pool.try_accept(t1, &fixture.ctx()).unwrap().txid;

        // T2 doubles the fee but conflicts on the same outpoint.
        let t2 = fixture.spend(outpoint, COIN - 20_000);
        let err = pool.try_accept(t2, &fixture.ctx()).unwrap_err();
        assert!(
            matches!(&err, ChainError::Invalid(info) if info.code == "txn-mempool-conflict"),
            "got {err:?}"
        );
        // T1 remains.
        assert!(pool.contains(&t1_id));
    }

    #[test]
    fn test_fee_below_minimum_rejected() {
        let mut fixture = Fixture::new();
        let outpoint = fixture.fund(1, COIN);
        let tx = fixture.spend(outpoint, COIN); // zero fee
        let mut pool = Mempool::new(MempoolConfig::default());
        let err = pool.try_accept(tx, &fixture.ctx()).unwrap_err();
        assert!(matches!(&err, ChainError::Invalid(info) if info.code == "min-relay-fee-not-met"));
    }

    #[test]
    fn test_bypass_limits_admits_zero_fee() {
        let mut fixture = Fixture::new();
        let outpoint = fixture.fund(1, COIN);
        let tx = fixture.spend(outpoint, COIN);
        let mut pool = Mempool::new(MempoolConfig::default());
        let mut ctx = fixture.ctx();
        ctx.bypass_limits = true;
        pool.try_accept(tx, &ctx).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_ancestor_chain_limit() {
        let mut fixture = Fixture::new();
        let mut outpoint = fixture.fund(1, 1_000 * COIN);
        let mut pool = Mempool::new(MempoolConfig::default());

        let mut value = 1_000 * COIN;
        // 25 chained spends are accepted, the 26th trips the limit.
        for i in 0..26 {
            value -= 50_000;
            let tx = fixture.spend(outpoint, value);
            let txid = tx.txid();
            let result = pool.try_accept(tx, &fixture.ctx());
            if i < 25 {
                let outcome = result.unwrap_or_else(|e| panic!("link {i}: {e:?}"));
                outpoint = OutPoint::new(outcome.txid, 0);
                assert_eq!(txid, outcome.txid);
            } else {
                let err = result.unwrap_err();
                assert!(
                    matches!(&err, ChainError::Invalid(info) if info.code == "too-long-mempool-chain"),
                    "got {err:?}"
                );
            }
        }
        assert_eq!(pool.len(), 25);
    }

    #[test]
    fn test_remove_for_block_evicts_conflicts() {
        let mut fixture = Fixture::new();
        let op_a = fixture.fund(1, COIN);
        let op_b = fixture.fund(2, COIN);

        let mut pool = Mempool::new(MempoolConfig::default());
        let confirmed = fixture.spend(op_a, COIN - 10_000);
        pool.try_accept(confirmed.clone(), &fixture.ctx()).unwrap();

        // A pool tx conflicting with a block spend of op_b.
        let conflicting = fixture.spend(op_b, COIN - 10_000);
        let conflicting_id = pool.try_accept(conflicting, &fixture.ctx()).unwrap().txid;

        // The block confirms `confirmed` and spends op_b with another tx.
        let block_spend = fixture.spend(op_b, COIN - 30_000);
        let mut conflicts = Vec::new();
        pool.remove_for_block(&[confirmed, block_spend], &mut conflicts);
        assert!(pool.is_empty());
        assert_eq!(conflicts, vec![conflicting_id]);
    }

    #[test]
    fn test_trim_evicts_lowest_feerate_package() {
        let mut fixture = Fixture::new();
        let op_cheap = fixture.fund(1, COIN);
        let op_rich = fixture.fund(2, COIN);

        let mut config = MempoolConfig::default();
        let mut pool = Mempool::new(config.clone());
        let cheap = fixture.spend(op_cheap, COIN - 20_000);
        let cheap_id = pool.try_accept(cheap, &fixture.ctx()).unwrap().txid;
        let rich = fixture.spend(op_rich, COIN - 500_000);
        let rich_id = pool.try_accept(rich, &fixture.ctx()).unwrap().txid;

        // Shrink the budget below the pool's usage and trim.
        config.max_vbytes = pool.total_vsize() - 1;
        pool.config = config;
        let mut evicted = Vec::new();
        pool.trim(&mut evicted);
        assert!(evicted.contains(&cheap_id));
        assert!(pool.contains(&rich_id));
    }

    #[test]
    fn test_prioritise_affects_eviction_order() {
        let mut fixture = Fixture::new();
        let op_a = fixture.fund(1, COIN);
        let op_b = fixture.fund(2, COIN);

        let mut pool = Mempool::new(MempoolConfig::default());
        let a = fixture.spend(op_a, COIN - 20_000);
        let a_id = pool.try_accept(a, &fixture.ctx()).unwrap().txid;
        let b = fixture.spend(op_b, COIN - 30_000);
        let b_id = pool.try_accept(b, &fixture.ctx()).unwrap().txid;

        // Boost A far above B, then trim to one entry.
        pool.prioritise(a_id, COIN);
        pool.config.max_vbytes = pool.total_vsize() - 1;
        let mut evicted = Vec::new();
        pool.trim(&mut evicted);
        assert!(evicted.contains(&b_id));
        assert!(pool.contains(&a_id));
    }

    #[test]
    fn test_dump_contains_entries_in_insertion_order() {
        let mut fixture = Fixture::new();
        let op_a = fixture.fund(1, COIN);
        let op_b = fixture.fund(2, COIN);
        let mut pool = Mempool::new(MempoolConfig::default());
        let a_id = pool
            .try_accept(fixture.spend(op_a, COIN - 10_000), &fixture.ctx())
            .unwrap()
            .txid;
        let b_id = pool
            .try_accept(fixture.spend(op_b, COIN - 10_000), &fixture.ctx())
            .unwrap()
            .txid;

        let dump = pool.dump();
        assert_eq!(dump.entries.len(), 2);
        use plumecoin_core::Decodable;
        let first =
            Transaction::from_bytes(&hex::decode(&dump.entries[0].tx_hex).unwrap()).unwrap();
        let second =
            Transaction::from_bytes(&hex::decode(&dump.entries[1].tx_hex).unwrap()).unwrap();
        assert_eq!(first.txid(), a_id);
        assert_eq!(second.txid(), b_id);
    }

    #[cfg(feature = "replacement")]
    #[test]
    fn test_replacement_requires_higher_feerate() {
        let mut fixture = Fixture::new();
        let outpoint = fixture.fund(1, COIN);
        let mut pool = Mempool::new(MempoolConfig::default());

        let t1 = fixture.spend(outpoint, COIN - 50_000);
        let t1_id = pool.try_accept(t1, &fixture.ctx()).unwrap().txid;

        // Lower fee: rejected.
        let weak = fixture.spend(outpoint, COIN - 20_000);
        assert!(pool.try_accept(weak, &fixture.ctx()).is_err());

        // Much higher fee: replaces.
        let strong = fixture.spend(outpoint, COIN - 200_000);
        let outcome = pool.try_accept(strong, &fixture.ctx()).unwrap();
        assert_eq!(outcome.replaced, vec![t1_id]);
        assert!(!pool.contains(&t1_id));
        assert_eq!(pool.len(), 1);
    }
}
