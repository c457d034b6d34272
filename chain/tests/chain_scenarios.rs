//! End-to-end chain scenarios on a regtest node: the premine schedule,
//! reorganizations, invalid-script rejection, and operator invalidate /
//! reconsider round-trips.

use plumecoin_chain::{genesis_block, ChainError, Node, NodeConfig};
use plumecoin_consensus::{check_proof_of_work, ConsensusParams, SighashCache, SIGHASH_ALL};
use plumecoin_core::script::push_slice;
use plumecoin_core::transaction::{OutPoint, TxIn, TxOut, SEQUENCE_FINAL};
use plumecoin_core::{Amount, Block, BlockHeader, Hash, Network, Script, Transaction, COIN};
use plumecoin_crypto::{pubkey_hash, sign_digest};
use secp256k1::{Secp256k1, SecretKey};

const REGTEST_BITS: u32 = 0x207fffff;
const GENESIS_TIME: u32 = 1_735_689_600;

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
        let digest = cache.signature_hash(tx, input_index, &self.script, SIGHASH_ALL);
        let mut signature = sign_digest(&digest, &self.secret).unwrap();
        signature.push(SIGHASH_ALL as u8);
        let mut sig_bytes = Vec::new();
        push_slice(&mut sig_bytes, &signature);
        push_slice(&mut sig_bytes, &self.pubkey);
        tx.inputs[input_index].script_sig = Script(sig_bytes);
    }
}

fn coinbase_for(height: u64, value: Amount, script: &Script) -> Transaction {
    let mut script_sig = Vec::new();
    push_slice(&mut script_sig, &height.to_le_bytes());
    Transaction::new(
        1,
        vec![TxIn::new(OutPoint::null(), Script(script_sig), SEQUENCE_FINAL)],
        vec![TxOut::new(value, script.clone())],
        0,
    )
}

/// Build and grind a regtest block on a given parent
fn make_block(
    prev_hash: Hash,
    height: u64,
    time: u32,
    reward: Amount,
    reward_script: &Script,
    extra_txs: Vec<Transaction>,
) -> Block {
    let mut txs = vec![coinbase_for(height, reward, reward_script)];
    txs.extend(extra_txs);
    let mut block = Block::new(
        BlockHeader {
            version: 1,
            prev_block_hash: prev_hash,
            merkle_root: [0u8; 32],
            timestamp: time,
            bits: REGTEST_BITS,
            nonce: 0,
        },
        txs,
    );
    block.header.merkle_root = block.calculate_merkle_root();
    while check_proof_of_work(&block.hash(), REGTEST_BITS, REGTEST_BITS).is_err() {
        block.header.nonce += 1;
    }
    block
}

fn open_node() -> Node {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();
    std::mem::forget(dir);
    let mut config = NodeConfig::new(Network::Regtest, path);
    config.script_workers = 0;
    Node::open(config).unwrap()
}

/// Extend the node's chain by `count` blocks paying the exact subsidy
fn grow_chain(node: &Node, wallet: &TestWallet, count: u64) -> Vec<Block> {
    let params = ConsensusParams::regtest();
    let mut blocks = Vec::new();
    for _ in 0..count {
        let (tip_hash, tip_height) = node.get_best_block().unwrap();
        let height = tip_height + 1;
        let block = make_block(
            tip_hash,
            height,
            GENESIS_TIME + height as u32 * 60,
            params.block_subsidy(height),
            &wallet.script,
            vec![],
        );
        node.submit_block(&block, true).unwrap();
        blocks.push(block);
    }
    blocks
}

#[test]
fn premine_schedule_is_enforced() {
    let node = open_node();
    let wallet = TestWallet::new();
    let params = ConsensusParams::regtest();
    let genesis = genesis_block(&params);

    // A block 1 overpaying the premine is rejected and marked failed.
    let greedy = make_block(
        genesis.hash(),
        1,
        GENESIS_TIME + 60,
        1_000_000_000 * COIN + 1,
        &wallet.script,
        vec![],
    );
    node.submit_block(&greedy, true).unwrap();
    let info = node.block_info(&greedy.hash()).unwrap();
    assert!(info.failed);
    assert_eq!(node.get_best_block().unwrap().1, 0);

    // The exact premine connects.
    let premine = make_block(
        genesis.hash(),
        1,
        GENESIS_TIME + 90,
        1_000_000_000 * COIN,
        &wallet.script,
        vec![],
    );
    node.submit_block(&premine, true).unwrap();
    assert_eq!(node.get_best_block().unwrap(), (premine.hash(), 1));

    // Height 2 pays the fixed reward, not the premine.
    let greedy2 = make_block(
        premine.hash(),
        2,
        GENESIS_TIME + 150,
        1_000_000_000 * COIN,
        &wallet.script,
        vec![],
    );
    node.submit_block(&greedy2, true).unwrap();
    assert!(node.block_info(&greedy2.hash()).unwrap().failed);

    let normal = make_block(
        premine.hash(),
        2,
        GENESIS_TIME + 180,
        10 * COIN,
        &wallet.script,
        vec![],
    );
    node.submit_block(&normal, true).unwrap();
    assert_eq!(node.get_best_block().unwrap(), (normal.hash(), 2));
}

#[test]
fn fees_flow_to_the_coinbase() {
    let node = open_node();
    let wallet = TestWallet::new();
    let params = ConsensusParams::regtest();

    let blocks = grow_chain(&node, &wallet, 105);
    // Spend the mature premine output (height 1) with a 1 PLM fee.
    let premine_txid = blocks[0].transactions[0].txid();
    let mut spend = Transaction::new(
        1,
        vec![TxIn::new(
            OutPoint::new(premine_txid, 0),
            Script::default(),
            SEQUENCE_FINAL,
        )],
        vec![TxOut::new(1_000_000_000 * COIN - COIN, wallet.script.clone())],
        0,
    );
    wallet.sign(&mut spend, 0);

    let (tip_hash, tip_height) = node.get_best_block().unwrap();
    let height = tip_height + 1;
    // Coinbase claims subsidy plus the fee.
    let block = make_block(
        tip_hash,
        height,
        GENESIS_TIME + height as u32 * 60,
        params.block_subsidy(height) + COIN,
        &wallet.script,
        vec![spend.clone()],
    );
    node.submit_block(&block, true).unwrap();
    assert_eq!(node.get_best_block().unwrap(), (block.hash(), height));
    let info = node.block_info(&block.hash()).unwrap();
    assert!(info.have_undo);
    assert!(info.on_active_chain);
}

#[test]
fn longer_branch_wins_reorg() {
    let node = open_node();
    let wallet = TestWallet::new();
    let params = ConsensusParams::regtest();

    let branch_a = grow_chain(&node, &wallet, 8);
    let (a_tip, a_height) = node.get_best_block().unwrap();
    assert_eq!(a_height, 8);

    // Branch B forks three blocks below the tip and grows one longer.
    let other = TestWallet::new();
    let fork_height = 5;
    let mut prev = branch_a[fork_height as usize - 1].hash();
    let mut b_blocks = Vec::new();
    for i in 1..=4u64 {
        let height = fork_height + i;
        let block = make_block(
            prev,
            height,
            GENESIS_TIME + height as u32 * 60 + 30,
            params.block_subsidy(height),
            &other.script,
            vec![],
        );
        prev = block.hash();
        node.submit_block(&block, true).unwrap();
        b_blocks.push(block);
    }

    // The tip switched to branch B's head.
    let (new_tip, new_height) = node.get_best_block().unwrap();
    assert_eq!(new_height, 9);
    assert_eq!(new_tip, b_blocks.last().unwrap().hash());

    // Branch A's orphans are still indexed, valid, and off the candidate
    // set below B's head.
    let orphan = node.block_info(&a_tip).unwrap();
    assert!(!orphan.failed);
    assert!(orphan.have_data);
    assert!(!orphan.on_active_chain);
    assert!(!orphan.in_candidates);
}

#[test]
fn invalid_script_block_fails_with_descendants() {
    let node = open_node();
    let wallet = TestWallet::new();
    let params = ConsensusParams::regtest();

    let blocks = grow_chain(&node, &wallet, 105);
    let (tip_hash, tip_height) = node.get_best_block().unwrap();

    // A spend of the premine with a garbage signature.
    let premine_txid = blocks[0].transactions[0].txid();
    let mut bad_spend = Transaction::new(
        1,
        vec![TxIn::new(
            OutPoint::new(premine_txid, 0),
            Script::default(),
            SEQUENCE_FINAL,
        )],
        vec![TxOut::new(COIN, wallet.script.clone())],
        0,
    );
    let mut sig_bytes = Vec::new();
    push_slice(&mut sig_bytes, &[0u8; 65]);
    push_slice(&mut sig_bytes, &wallet.pubkey);
    bad_spend.inputs[0].script_sig = Script(sig_bytes);

    let height = tip_height + 1;
    let bad_block = make_block(
        tip_hash,
        height,
        GENESIS_TIME + height as u32 * 60,
        params.block_subsidy(height),
        &wallet.script,
        vec![bad_spend],
    );
    // A descendant header arrives before the parent's data.
    let child = make_block(
        bad_block.hash(),
        height + 1,
        GENESIS_TIME + (height as u32 + 1) * 60,
        params.block_subsidy(height + 1),
        &wallet.script,
        vec![],
    );
    node.submit_header(&child.header).unwrap();

    node.submit_block(&bad_block, true).unwrap();

    // Tip unchanged; the block and its descendant are failed.
    assert_eq!(node.get_best_block().unwrap(), (tip_hash, tip_height));
    assert!(node.block_info(&bad_block.hash()).unwrap().failed);
    assert!(node.block_info(&child.hash()).unwrap().failed);
}

#[test]
fn invalidate_reorgs_away_and_readmits_transactions() {
    let node = open_node();
    let wallet = TestWallet::new();
    let params = ConsensusParams::regtest();

    let blocks = grow_chain(&node, &wallet, 105);
    let premine_txid = blocks[0].transactions[0].txid();
    let mut spend = Transaction::new(
        1,
        vec![TxIn::new(
            OutPoint::new(premine_txid, 0),
            Script::default(),
            SEQUENCE_FINAL,
        )],
        vec![TxOut::new(1_000_000_000 * COIN - COIN, wallet.script.clone())],
        0,
    );
    wallet.sign(&mut spend, 0);
    let spend_txid = spend.txid();

    let (tip_hash, tip_height) = node.get_best_block().unwrap();
    let height = tip_height + 1;
    let block = make_block(
        tip_hash,
        height,
        GENESIS_TIME + height as u32 * 60,
        params.block_subsidy(height) + COIN,
        &wallet.script,
        vec![spend],
    );
    node.submit_block(&block, true).unwrap();
    assert_eq!(node.get_best_block().unwrap().1, height);
    assert!(!node.mempool_contains(&spend_txid));

    // Invalidating the tip rolls back and re-admits the spend.
    node.invalidate_block(&block.hash()).unwrap();
    assert_eq!(node.get_best_block().unwrap(), (tip_hash, tip_height));
    assert!(node.block_info(&block.hash()).unwrap().failed);
    assert!(node.mempool_contains(&spend_txid));

    // Reconsidering restores the block as tip and confirms the spend again.
    node.reconsider_block(&block.hash()).unwrap();
    assert_eq!(node.get_best_block().unwrap(), (block.hash(), height));
    assert!(!node.mempool_contains(&spend_txid));
}

#[test]
fn duplicate_and_orphan_submission_behave() {
    let node = open_node();
    let wallet = TestWallet::new();
    grow_chain(&node, &wallet, 3);
    let (tip_hash, tip_height) = node.get_best_block().unwrap();

    // Resubmitting the tip block is a quiet no-op.
    let info = node.block_info(&tip_hash).unwrap();
    assert!(info.have_data);

    // A block whose parent is unknown reports MissingPrev.
    let orphan = make_block(
        [0xabu8; 32],
        tip_height + 5,
        GENESIS_TIME + 10_000,
        10 * COIN,
        &wallet.script,
        vec![],
    );
    assert!(matches!(
        node.submit_block(&orphan, true),
        Err(ChainError::MissingPrev(_))
    ));
}

#[test]
fn mempool_conflict_rejected_via_node() {
    let node = open_node();
    let wallet = TestWallet::new();
    grow_chain(&node, &wallet, 105);
    let (_, _) = node.get_best_block().unwrap();

    // Spend the premine twice with different fees.
    let premine_txid = {
        // height-1 coinbase output
        let blocks_info = node.block_info(&node.get_best_block().unwrap().0).unwrap();
        assert!(blocks_info.on_active_chain);
        // Rebuild txid deterministically: coinbase at height 1 paying the
        // premine to this wallet.
        coinbase_for(1, 1_000_000_000 * COIN, &wallet.script).txid()
    };

    let mut t1 = Transaction::new(
        1,
        vec![TxIn::new(
            OutPoint::new(premine_txid, 0),
            Script::default(),
            SEQUENCE_FINAL,
        )],
        vec![TxOut::new(1_000_000_000 * COIN - COIN, wallet.script.clone())],
        0,
    );
    wallet.sign(&mut t1, 0);
    let t1_id = node.submit_transaction(t1).unwrap().txid;

    let mut t2 = Transaction::new(
        1,
        vec![TxIn::new(
            OutPoint::new(premine_txid, 0),
            Script::default(),
            SEQUENCE_FINAL,
        )],
        vec![TxOut::new(1_000_000_000 * COIN - 2 * COIN, wallet.script.clone())],
        0,
    );
    wallet.sign(&mut t2, 0);
    let err = node.submit_transaction(t2).unwrap_err();
    assert!(matches!(
        &err,
        ChainError::Invalid(info) if info.code == "txn-mempool-conflict"
    ));
    assert!(node.mempool_contains(&t1_id));
}
