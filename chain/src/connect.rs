//! Block Connect and Disconnect
//!
//! `connect_block` is the atomic state transition: it assembles every spend,
//! creation, and token mutation of one block into the passed overlays and
//! hands back the undo record, or fails leaving the overlays unusable (the
//! caller discards them). `disconnect_block` is the mirror, driven by the
//! undo record. The shared input checks (amounts, maturity, sequence locks,
//! token rules) also serve the mempool accept path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::debug;

use plumecoin_consensus::{
    check_block, check_stake_split, ConsensusParams, SighashCache, COINBASE_MATURITY,
    MAX_BLOCK_SIGOPS,
};
use plumecoin_core::transaction::{
    SEQUENCE_LOCKTIME_DISABLE_FLAG, SEQUENCE_LOCKTIME_MASK, SEQUENCE_LOCKTIME_TYPE_FLAG,
};
use plumecoin_core::{
    money_range, Amount, Block, GovernanceOp, Hash, OutPoint, TokenScript, Transaction,
};

use crate::coins::{Coin, CoinOverlay, CoinView};
use crate::error::ChainError;
use crate::scriptcheck::{CheckQueue, ScriptCache, ScriptCheck};
use crate::tokens::{transfer_allowed, TokenIssuance, TokenOverlay, TokenUndo, TokenView};
use crate::undo::{BlockUndo, TxUndo};

/// Seconds granularity of time-based relative locks
const SEQUENCE_TIME_GRANULARITY: u32 = 9;

/// Context resolved by the controller before a connect step
pub struct ConnectContext<'a> {
    pub params: &'a ConsensusParams,
    /// Height the block will occupy
    pub height: u64,
    pub median_time_past: u32,
    /// Target the difficulty schedule demands for this block
    pub expected_bits: u32,
    /// Stake modifier of the predecessor
    pub stake_modifier: Hash,
    pub queue: &'a CheckQueue,
    pub script_cache: &'a ScriptCache,
    /// Script verification flags for this block
    pub script_flags: u32,
}

/// What a successful connect step produced
pub struct ConnectOutcome {
    pub undo: BlockUndo,
    pub fees: Amount,
    /// Decoded governance actions, in block order
    pub governance: Vec<GovernanceOp>,
    /// Coins spent by each transaction, for the secondary indices
    pub spent_per_tx: Vec<Vec<(OutPoint, Coin)>>,
}

/// Outcome of a disconnect step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectResult {
    /// Fully clean reversal
    Ok,
    /// Applied, but the undo data had detectable inconsistencies; safe only
    /// because a later replay overwrites idempotently
    Unclean,
    /// The view is indeterminate; the caller must abort
    Failed,
}

/// Enforce BIP68 relative lock times for one transaction's inputs.
///
/// `next_height`/`median_time_past` describe the block that would include
/// the transaction.
pub fn check_sequence_locks(
    tx: &Transaction,
    spent_coins: &[Coin],
    next_height: u64,
    median_time_past: u32,
) -> Result<(), ChainError> {
    if tx.version < 2 || tx.is_coinbase() {
        return Ok(());
    }
    for (input, coin) in tx.inputs.iter().zip(spent_coins) {
        if input.sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            continue;
        }
        let value = input.sequence & SEQUENCE_LOCKTIME_MASK;
        if input.sequence & SEQUENCE_LOCKTIME_TYPE_FLAG != 0 {
            let lock_time = coin.time.saturating_add(value << SEQUENCE_TIME_GRANULARITY);
            if median_time_past < lock_time {
                return Err(ChainError::invalid(
                    "non-BIP68-final",
                    "time-based relative lock not satisfied",
                ));
            }
        } else {
            let lock_height = coin.height.saturating_add(value as u64);
            if next_height < lock_height {
                return Err(ChainError::invalid(
                    "non-BIP68-final",
                    "height-based relative lock not satisfied",
                ));
            }
        }
    }
    Ok(())
}

/// Value checks over one transaction's resolved inputs: maturity, money
/// ranges, and `sum_in >= sum_out`. Returns the fee.
pub fn check_inputs(
    tx: &Transaction,
    spent_coins: &[Coin],
    next_height: u64,
) -> Result<Amount, ChainError> {
    let mut value_in: Amount = 0;
    for (input, coin) in tx.inputs.iter().zip(spent_coins) {
        if coin.is_generated() {
            let age = next_height.saturating_sub(coin.height);
            if age < COINBASE_MATURITY {
                return Err(ChainError::invalid(
                    "bad-txns-premature-spend-of-coinbase",
                    format!("{} spent at age {age}", input.prevout),
                ));
            }
        }
        if !money_range(coin.output.value) {
            return Err(ChainError::invalid(
                "bad-txns-inputvalues-outofrange",
                format!("{}", input.prevout),
            ));
        }
        value_in = value_in
            .checked_add(coin.output.value)
            .filter(|total| money_range(*total))
            .ok_or_else(|| {
                ChainError::invalid("bad-txns-inputvalues-outofrange", "input sum overflow")
            })?;
    }

    let value_out = tx.output_value();
    if tx.is_coinstake() {
        // The coinstake claims its reward on top of the inputs; the block
        // level check bounds it.
        return Ok(0);
    }
    if value_in < value_out {
        return Err(ChainError::invalid(
            "bad-txns-in-belowout",
            format!("in {value_in} < out {value_out}"),
        ));
    }
    let fee = value_in - value_out;
    if !money_range(fee) {
        return Err(ChainError::invalid("bad-txns-fee-outofrange", "fee"));
    }
    Ok(fee)
}

/// How many token units each input coin contributes, keyed by token name,
/// plus the set of ownership tokens present
fn input_token_summary(spent_coins: &[Coin]) -> (HashMap<String, Amount>, HashSet<String>) {
    let mut amounts: HashMap<String, Amount> = HashMap::new();
    let mut ownerships = HashSet::new();
    for coin in spent_coins {
        match coin.token() {
            Some(TokenScript::Transfer { name, amount })
            | Some(TokenScript::Issue { name, amount, .. })
            | Some(TokenScript::Reissue { name, amount, .. }) => {
                *amounts.entry(name).or_insert(0) += amount;
            }
            Some(TokenScript::Ownership { name }) => {
                ownerships.insert(name.clone());
                *amounts.entry(name).or_insert(0) += 1;
            }
            _ => {}
        }
    }
    (amounts, ownerships)
}

fn root_ownership_name(name: &str) -> String {
    let body = name.trim_start_matches(['$', '#']);
    format!("{body}!")
}

/// Read-only token rule validation for one transaction: authority for
/// privileged operations, recipient restrictions for transfers, and unit
/// conservation. Shared by mempool accept and block connect.
pub fn check_token_rules(
    tx: &Transaction,
    spent_coins: &[Coin],
    tokens: &dyn TokenView,
) -> Result<(), ChainError> {
    let (input_amounts, input_ownerships) = input_token_summary(spent_coins);
    let mut issued_here: HashSet<String> = HashSet::new();
    let mut output_amounts: HashMap<String, Amount> = HashMap::new();

    for output in &tx.outputs {
        let op = match TokenScript::from_script(&output.script_pubkey)
            .map_err(|e| ChainError::invalid("bad-txns-token-region", e.to_string()))?
        {
            Some(op) => op,
            None => continue,
        };
        match &op {
            TokenScript::Transfer { name, amount } => {
                let recipient = output.script_pubkey.address_hash().ok_or_else(|| {
                    ChainError::invalid("token-transfer-nonstandard", "no recipient address")
                })?;
                if tokens.issuance(name)?.is_none() && !issued_here.contains(name) {
                    return Err(ChainError::invalid(
                        "token-not-issued",
                        format!("transfer of unknown token {name}"),
                    ));
                }
                transfer_allowed(tokens, name, &recipient)?;
                *output_amounts.entry(name.clone()).or_insert(0) += amount;
            }
            TokenScript::Issue { name, .. } => {
                if tokens.issuance(name)?.is_some() || issued_here.contains(name) {
                    return Err(ChainError::invalid(
                        "token-already-issued",
                        format!("token {name} already exists"),
                    ));
                }
                if name.starts_with('$')
                    && !input_ownerships.contains(&root_ownership_name(name))
                {
                    return Err(ChainError::invalid(
                        "token-no-authority",
                        format!("restricted issue of {name} without root ownership"),
                    ));
                }
                issued_here.insert(name.clone());
            }
            TokenScript::Reissue { name, .. } => {
                let record = tokens.issuance(name)?.ok_or_else(|| {
                    ChainError::invalid("token-not-issued", format!("reissue of {name}"))
                })?;
                if !record.reissuable {
                    return Err(ChainError::invalid(
                        "token-not-reissuable",
                        format!("{name} is locked"),
                    ));
                }
                if !input_ownerships.contains(&root_ownership_name(name)) {
                    return Err(ChainError::invalid(
                        "token-no-authority",
                        format!("reissue of {name} without ownership input"),
                    ));
                }
            }
            TokenScript::Ownership { name } => {
                let root = name.trim_end_matches('!');
                let moving = input_amounts.contains_key(name);
                if !issued_here.contains(root) && !moving {
                    return Err(ChainError::invalid(
                        "token-no-authority",
                        format!("ownership {name} neither issued nor moved"),
                    ));
                }
            }
            TokenScript::QualifierTag { qualifier, .. } => {
                if !input_amounts.contains_key(qualifier)
                    && !input_ownerships.contains(&root_ownership_name(qualifier))
                {
                    return Err(ChainError::invalid(
                        "token-no-authority",
                        format!("tagging without holding {qualifier}"),
                    ));
                }
            }
            TokenScript::AddressFreeze { name, .. }
            | TokenScript::GlobalFreeze { name, .. }
            | TokenScript::Verifier { name, .. } => {
                if !input_ownerships.contains(&root_ownership_name(name)) {
                    return Err(ChainError::invalid(
                        "token-no-authority",
                        format!("restricted control of {name} without ownership"),
                    ));
                }
            }
        }
    }

    // Unit conservation: transfers out of a name never exceed what the
    // inputs carried. Shortfalls burn; there is no token fee.
    for (name, out_amount) in &output_amounts {
        let available = input_amounts.get(name).copied().unwrap_or(0);
        if out_amount > &available {
            return Err(ChainError::invalid(
                "token-insufficient-input",
                format!("{name}: out {out_amount} > in {available}"),
            ));
        }
    }
    Ok(())
}

/// Apply one transaction's token mutations to the overlay, recording undo
/// entries. Assumes `check_token_rules` already passed.
pub fn apply_token_outputs(
    tx: &Transaction,
    height: u64,
    tokens: &mut TokenOverlay,
    undo: &mut Vec<TokenUndo>,
) -> Result<(), ChainError> {
    for output in &tx.outputs {
        let op = match TokenScript::from_script(&output.script_pubkey)
            .map_err(|e| ChainError::invalid("bad-txns-token-region", e.to_string()))?
        {
            Some(op) => op,
            None => continue,
        };
        match op {
            TokenScript::Issue {
                name,
                amount,
                units,
                reissuable,
                ipfs_hash,
            } => {
                tokens.issue(
                    &name,
                    TokenIssuance {
                        amount,
                        units,
                        reissuable,
                        ipfs_hash,
                        height,
                    },
                    undo,
                )?;
            }
            TokenScript::Reissue {
                name,
                amount,
                reissuable,
                ipfs_hash,
                ..
            } => {
                tokens.reissue(&name, amount, reissuable, ipfs_hash, undo)?;
            }
            TokenScript::Ownership { name } => {
                tokens.set_ownership(&name, output.script_pubkey.base_script(), undo)?;
            }
            TokenScript::QualifierTag {
                qualifier,
                address,
                assign,
            } => {
                tokens.set_tag(&qualifier, address, assign, undo)?;
            }
            TokenScript::AddressFreeze {
                name,
                address,
                frozen,
            } => {
                tokens.set_address_freeze(&name, address, frozen, undo)?;
            }
            TokenScript::GlobalFreeze { name, frozen } => {
                tokens.set_global_freeze(&name, frozen, undo)?;
            }
            TokenScript::Verifier { name, verifier } => {
                tokens.set_verifier(&name, verifier, undo)?;
            }
            TokenScript::Transfer { .. } => {}
        }
    }
    Ok(())
}

/// Connect one block into the passed overlays.
///
/// Precondition: the overlays' best block equals the block's predecessor.
/// On error the overlays must be discarded.
pub fn connect_block(
    block: &Block,
    ctx: &ConnectContext<'_>,
    coins: &mut CoinOverlay<'_>,
    tokens: &mut TokenOverlay<'_>,
) -> Result<ConnectOutcome, ChainError> {
    // Re-run the context-free checks; a failure here on a block we already
    // stored points at the disk, not the peer.
    if let Err(err) = check_block(block, ctx.params) {
        return Err(ChainError::Invalid(crate::error::RejectInfo {
            code: err.reject_code().to_string(),
            reason: err.to_string(),
            corruption_possible: true,
        }));
    }

    if block.header.bits != ctx.expected_bits {
        return Err(ChainError::invalid(
            "bad-diffbits",
            format!(
                "block {:08x} expected {:08x}",
                block.header.bits, ctx.expected_bits
            ),
        ));
    }

    let pos = block.is_proof_of_stake();
    let mut stake_input: Option<(Coin, OutPoint)> = None;
    if pos {
        let coinstake = &block.transactions[1];
        let kernel_prevout = coinstake.inputs[0].prevout;
        let kernel_coin = coins
            .coin(&kernel_prevout)?
            .ok_or(ChainError::MissingInputs)?;
        plumecoin_consensus::check_kernel(
            ctx.params,
            &ctx.stake_modifier,
            &kernel_prevout,
            kernel_coin.output.value,
            kernel_coin.height,
            kernel_coin.time,
            block.header.timestamp,
            block.header.bits,
            ctx.height,
        )?;
        stake_input = Some((kernel_coin, kernel_prevout));
    }

    let mut undo = BlockUndo::default();
    let mut spent_per_tx: Vec<Vec<(OutPoint, Coin)>> = Vec::with_capacity(block.transactions.len());
    let mut governance = Vec::new();
    let mut fees: Amount = 0;
    let mut sigops: u32 = 0;
    let mut checks: Vec<ScriptCheck> = Vec::new();

    for tx in &block.transactions {
        sigops = sigops.saturating_add(tx.sigop_count());
        if sigops > MAX_BLOCK_SIGOPS {
            return Err(ChainError::invalid("bad-blk-sigops", "sigop cap exceeded"));
        }

        let mut spent = Vec::new();
        if !tx.is_coinbase() {
            let mut spent_coins = Vec::with_capacity(tx.inputs.len());
            for input in &tx.inputs {
                let coin = coins.spend(&input.prevout)?;
                spent.push((input.prevout, coin.clone()));
                spent_coins.push(coin);
            }

            check_sequence_locks(tx, &spent_coins, ctx.height, ctx.median_time_past)?;
            fees = fees.saturating_add(check_inputs(tx, &spent_coins, ctx.height)?);
            check_token_rules(tx, &spent_coins, tokens)?;
            apply_token_outputs(tx, ctx.height, tokens, &mut undo.token_undos)?;

            // Whole-tx cache hits skip the queue entirely.
            let cache_key = ctx.script_cache.key(&tx.wtxid(), ctx.script_flags);
            if !ctx.script_cache.contains(&cache_key) {
                let tx_arc = Arc::new(tx.clone());
                let sighash = Arc::new(SighashCache::new(tx));
                for (input_index, (_, coin)) in spent.iter().enumerate() {
                    checks.push(ScriptCheck {
                        tx: tx_arc.clone(),
                        input_index,
                        script_pubkey: coin.output.script_pubkey.clone(),
                        flags: ctx.script_flags,
                        sighash: sighash.clone(),
                    });
                }
            }

            undo.tx_undos.push(TxUndo {
                spent: spent.iter().map(|(_, coin)| coin.clone()).collect(),
            });
        }

        let txid = tx.txid();
        let is_coinstake = tx.is_coinstake();
        for (vout, output) in tx.outputs.iter().enumerate() {
            if output.script_pubkey.is_unspendable() {
                if let Some(op) = GovernanceOp::from_script(&output.script_pubkey) {
                    governance.push(op);
                }
                continue;
            }
            coins.add(
                OutPoint::new(txid, vout as u32),
                Coin::new(
                    output.clone(),
                    ctx.height,
                    block.header.timestamp,
                    tx.is_coinbase(),
                    is_coinstake,
                ),
                false,
            )?;
        }
        spent_per_tx.push(spent);
    }

    // Reward bounds. Height 1 is the one-time premine.
    let subsidy = ctx.params.block_subsidy(ctx.height);
    let coinbase_value = block.transactions[0].output_value();
    if let Some((stake_coin, _)) = &stake_input {
        if coinbase_value != 0 {
            return Err(ChainError::invalid(
                "bad-cb-notempty",
                "coinbase pays in a proof-of-stake block",
            ));
        }
        let coinstake = &block.transactions[1];
        let stake_in: Amount = undo.tx_undos[0]
            .spent
            .iter()
            .map(|coin| coin.output.value)
            .sum();
        let claimed = coinstake.output_value() - stake_in;
        if claimed > fees + subsidy {
            return Err(ChainError::invalid(
                "bad-cs-amount",
                format!("claimed {claimed} > allowed {}", fees + subsidy),
            ));
        }
        check_stake_split(
            coinstake,
            &stake_coin.output.script_pubkey,
            stake_coin.output.value,
            fees + subsidy,
        )?;
    } else if coinbase_value > fees + subsidy {
        return Err(ChainError::invalid(
            "bad-cb-amount",
            format!("claimed {coinbase_value} > allowed {}", fees + subsidy),
        ));
    }

    ctx.queue.push_batch(checks);
    if !ctx.queue.wait() {
        return Err(ChainError::invalid(
            "mandatory-script-verify-flag-failed",
            "script verification failed",
        ));
    }
    // Record per-tx success for future connects of the same transactions.
    for tx in block.transactions.iter().skip(1) {
        ctx.script_cache
            .insert(ctx.script_cache.key(&tx.wtxid(), ctx.script_flags));
    }

    coins.set_best_block(block.hash());
    debug!(
        "connected block {} at height {}: {} tx, fees {}",
        hex::encode(&block.hash()[..8]),
        ctx.height,
        block.transactions.len(),
        fees
    );
    Ok(ConnectOutcome {
        undo,
        fees,
        governance,
        spent_per_tx,
    })
}

/// Disconnect one block from the overlays using its undo record
pub fn disconnect_block(
    block: &Block,
    undo: &BlockUndo,
    prev_hash: Hash,
    coins: &mut CoinOverlay<'_>,
    tokens: &mut TokenOverlay<'_>,
) -> Result<DisconnectResult, ChainError> {
    let spending_txs = block.transactions.len().saturating_sub(1);
    if undo.tx_undos.len() != spending_txs {
        return Ok(DisconnectResult::Failed);
    }
    let mut clean = true;

    // Token state first: mutations revert in reverse application order.
    for entry in undo.token_undos.iter().rev() {
        tokens.revert(entry);
    }

    for (tx_index, tx) in block.transactions.iter().enumerate().rev() {
        let txid = tx.txid();
        for (vout, output) in tx.outputs.iter().enumerate() {
            if output.script_pubkey.is_unspendable() {
                continue;
            }
            let existed = coins.remove(&OutPoint::new(txid, vout as u32))?;
            if !existed {
                clean = false;
            }
        }
        if tx.is_coinbase() {
            continue;
        }
        let tx_undo = &undo.tx_undos[tx_index - 1];
        if tx_undo.spent.len() != tx.inputs.len() {
            return Ok(DisconnectResult::Failed);
        }
        for (input, coin) in tx.inputs.iter().zip(&tx_undo.spent) {
            if coins.coin(&input.prevout)?.is_some() {
                clean = false;
            }
            coins.add(input.prevout, coin.clone(), true)?;
        }
    }

    coins.set_best_block(prev_hash);
    Ok(if clean {
        DisconnectResult::Ok
    } else {
        DisconnectResult::Unclean
    })
}
