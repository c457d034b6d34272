//! Coin View Stack
//!
//! Three layers over the UTXO set: the database view reading the index
//! database, the long-lived tip cache, and the per-block overlay assembled
//! during validation and committed only on success. Layers share one
//! capability surface (`CoinView` for reads, spend/add on the mutable
//! layers) and one change format (`CoinChanges`).

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use plumecoin_core::{Hash, OutPoint, TokenScript, TxOut};
use plumecoin_storage::{keys, IndexDb, WriteBatch};

use crate::error::ChainError;

/// Height marker for coins created by mempool transactions
pub const MEMPOOL_HEIGHT: u64 = u64::MAX;

/// One unspent (or just-spent, inside undo data) transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    /// The output itself; its script may carry a token region
    pub output: TxOut,
    /// Height of the creating block
    pub height: u64,
    /// Timestamp of the creating block
    pub time: u32,
    /// Created by a coinbase
    pub coinbase: bool,
    /// Created by a coinstake
    pub coinstake: bool,
}

impl Coin {
    pub fn new(output: TxOut, height: u64, time: u32, coinbase: bool, coinstake: bool) -> Self {
        Coin {
            output,
            height,
            time,
            coinbase,
            coinstake,
        }
    }

    /// Whether this coin needs maturity before being spent
    pub fn is_generated(&self) -> bool {
        self.coinbase || self.coinstake
    }

    /// The token operation carried by this coin's script, if any.
    ///
    /// The region was validated at acceptance; a decode failure here means
    /// the stored coin rotted.
    pub fn token(&self) -> Option<TokenScript> {
        TokenScript::from_script(&self.output.script_pubkey).ok().flatten()
    }

    /// Rough memory footprint for the cache budget
    pub fn dynamic_usage(&self) -> usize {
        48 + self.output.script_pubkey.len()
    }
}

/// Read capability shared by every layer of the stack
pub trait CoinView {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainError>;

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool, ChainError> {
        Ok(self.coin(outpoint)?.is_some())
    }

    /// The block whose state this view describes
    fn best_block(&self) -> Option<Hash>;
}

/// The change set an overlay produces on success
#[derive(Debug, Default)]
pub struct CoinChanges {
    /// `None` marks a spend, `Some` a created or restored coin
    pub coins: Vec<(OutPoint, Option<Coin>)>,
    pub best_block: Option<Hash>,
}

/// Database-backed bottom layer
pub struct DbCoinView {
    db: Arc<IndexDb>,
}

impl DbCoinView {
    pub fn new(db: Arc<IndexDb>) -> Self {
        DbCoinView { db }
    }
}

impl CoinView for DbCoinView {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainError> {
        match self.db.get(&keys::coin_key(outpoint))? {
            Some(bytes) => {
                let coin = serde_json::from_slice(&bytes)
                    .map_err(|e| ChainError::System(format!("corrupt coin record: {e}")))?;
                Ok(Some(coin))
            }
            None => Ok(None),
        }
    }

    fn best_block(&self) -> Option<Hash> {
        self.db
            .get(&keys::coin_best_block_key())
            .ok()
            .flatten()
            .and_then(|bytes| bytes.try_into().ok())
    }
}

#[derive(Debug, Clone)]
struct CacheSlot {
    coin: Option<Coin>,
    dirty: bool,
}

/// The long-lived tip cache over the database view
pub struct TipCoinCache {
    base: DbCoinView,
    slots: HashMap<OutPoint, CacheSlot>,
    best: Option<Hash>,
    usage: usize,
}

impl TipCoinCache {
    pub fn new(db: Arc<IndexDb>) -> Self {
        let base = DbCoinView::new(db);
        let best = base.best_block();
        TipCoinCache {
            base,
            slots: HashMap::new(),
            best,
            usage: 0,
        }
    }

    pub fn set_best_block(&mut self, hash: Hash) {
        self.best = Some(hash);
    }

    /// Approximate bytes held by cached coins
    pub fn dynamic_usage(&self) -> usize {
        self.usage
    }

    /// Apply an overlay's changes; every touched slot becomes dirty
    pub fn apply(&mut self, changes: CoinChanges) {
        for (outpoint, coin) in changes.coins {
            if let Some(coin) = &coin {
                self.usage += coin.dynamic_usage();
            }
            if let Some(old) = self.slots.insert(outpoint, CacheSlot { coin, dirty: true }) {
                if let Some(old_coin) = old.coin {
                    self.usage = self.usage.saturating_sub(old_coin.dynamic_usage());
                }
            }
        }
        if let Some(best) = changes.best_block {
            self.best = Some(best);
        }
    }

    /// Drop a clean read-cache slot, e.g. after mempool eviction
    pub fn uncache(&mut self, outpoint: &OutPoint) {
        if let Entry::Occupied(slot) = self.slots.entry(*outpoint) {
            if !slot.get().dirty {
                if let Some(coin) = &slot.get().coin {
                    self.usage = self.usage.saturating_sub(coin.dynamic_usage());
                }
                slot.remove();
            }
        }
    }

    /// Write every dirty slot into the batch and clear the cache.
    ///
    /// Both head-block markers go in front of the coin writes: the old tip
    /// (what the database described before this flush) and the new one. The
    /// flush commits in chunks, so a crash mid-way leaves differing markers
    /// and `ReplayBlocks` reconciles the half-applied coin state; the final
    /// marker-equalizing write happens after the whole batch lands.
    pub fn flush_into(&mut self, batch: &mut WriteBatch) -> Result<(), ChainError> {
        if let Some(old_best) = self.base.best_block() {
            batch.put(keys::coin_old_tip_key(), old_best.to_vec());
        }
        if let Some(best) = self.best {
            batch.put(keys::coin_best_block_key(), best.to_vec());
        }
        for (outpoint, slot) in self.slots.drain() {
            if !slot.dirty {
                continue;
            }
            match slot.coin {
                Some(coin) => {
                    let bytes = serde_json::to_vec(&coin)
                        .map_err(|e| ChainError::System(format!("encode coin: {e}")))?;
                    batch.put(keys::coin_key(&outpoint), bytes);
                }
                None => batch.delete(keys::coin_key(&outpoint)),
            }
        }
        self.usage = 0;
        Ok(())
    }
}

impl CoinView for TipCoinCache {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainError> {
        if let Some(slot) = self.slots.get(outpoint) {
            return Ok(slot.coin.clone());
        }
        self.base.coin(outpoint)
    }

    fn best_block(&self) -> Option<Hash> {
        self.best
    }
}

impl TipCoinCache {
    /// Read through, populating the read cache
    pub fn fetch(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainError> {
        if let Some(slot) = self.slots.get(outpoint) {
            return Ok(slot.coin.clone());
        }
        let coin = self.base.coin(outpoint)?;
        if let Some(coin) = &coin {
            self.usage += coin.dynamic_usage();
        }
        self.slots.insert(
            *outpoint,
            CacheSlot {
                coin: coin.clone(),
                dirty: false,
            },
        );
        Ok(coin)
    }
}

/// Transient overlay used during block validation and replay
pub struct CoinOverlay<'a> {
    base: &'a dyn CoinView,
    slots: HashMap<OutPoint, Option<Coin>>,
    best: Option<Hash>,
}

impl<'a> CoinOverlay<'a> {
    pub fn new(base: &'a dyn CoinView) -> Self {
        let best = base.best_block();
        CoinOverlay {
            base,
            slots: HashMap::new(),
            best,
        }
    }

    /// Spend a coin, returning its previous value for the undo record
    pub fn spend(&mut self, outpoint: &OutPoint) -> Result<Coin, ChainError> {
        let coin = self.coin(outpoint)?.ok_or(ChainError::MissingInputs)?;
        self.slots.insert(*outpoint, None);
        Ok(coin)
    }

    /// Insert a coin. With `allow_overwrite` false an existing live coin is
    /// an invariant violation (BIP30-style duplicate creation).
    pub fn add(
        &mut self,
        outpoint: OutPoint,
        coin: Coin,
        allow_overwrite: bool,
    ) -> Result<(), ChainError> {
        if !allow_overwrite && self.coin(&outpoint)?.is_some() {
            return Err(ChainError::invalid(
                "bad-txns-BIP30",
                format!("output {outpoint} already exists unspent"),
            ));
        }
        self.slots.insert(outpoint, Some(coin));
        Ok(())
    }

    /// Remove a coin that must exist (disconnect path); reports whether it
    /// was actually present so callers can flag unclean undo data
    pub fn remove(&mut self, outpoint: &OutPoint) -> Result<bool, ChainError> {
        let existed = self.coin(outpoint)?.is_some();
        self.slots.insert(*outpoint, None);
        Ok(existed)
    }

    pub fn set_best_block(&mut self, hash: Hash) {
        self.best = Some(hash);
    }

    /// Commit: turn the overlay into a change set for the parent layer
    pub fn into_changes(self) -> CoinChanges {
        CoinChanges {
            coins: self.slots.into_iter().collect(),
            best_block: self.best,
        }
    }
}

impl CoinView for CoinOverlay<'_> {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainError> {
        if let Some(slot) = self.slots.get(outpoint) {
            return Ok(slot.clone());
        }
        self.base.coin(outpoint)
    }

    fn best_block(&self) -> Option<Hash> {
        self.best
    }
}
