//! Script Check Engine
//!
//! One instance per node. Checks queue up while a block's transactions are
//! walked under the chain lock; `wait` drains them across the worker pool
//! (or inline with zero workers) after the lock is released. The first
//! failure latches a shared flag; later tasks may still run but their
//! results are ignored. A content-addressed cache short-circuits whole
//! transactions that verified under the same flags before.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;
use rand::Rng;
use rayon::prelude::*;

use plumecoin_consensus::{verify_script, SighashCache, TransactionSigChecker};
use plumecoin_core::ser::sha256;
use plumecoin_core::{Hash, Script, Transaction};

/// One input's script verification task
pub struct ScriptCheck {
    pub tx: Arc<Transaction>,
    pub input_index: usize,
    /// The previous output's script
    pub script_pubkey: Script,
    pub flags: u32,
    /// Precomputed sighash components shared across the tx's inputs
    pub sighash: Arc<SighashCache>,
}

impl ScriptCheck {
    fn run(&self) -> bool {
        let checker = TransactionSigChecker {
            tx: &self.tx,
            input_index: self.input_index,
            cache: &self.sighash,
        };
        verify_script(
            &self.tx.inputs[self.input_index].script_sig,
            &self.script_pubkey,
            self.flags,
            &checker,
        )
        .is_ok()
    }
}

/// Bounded worker pool draining batches of script checks
pub struct CheckQueue {
    pool: Option<rayon::ThreadPool>,
    pending: Mutex<Vec<ScriptCheck>>,
    failed: AtomicBool,
}

impl CheckQueue {
    /// `workers == 0` runs every check inline inside `wait`
    pub fn new(workers: usize) -> Self {
        let pool = if workers == 0 {
            None
        } else {
            rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("scriptcheck-{i}"))
                .build()
                .ok()
        };
        CheckQueue {
            pool,
            pending: Mutex::new(Vec::new()),
            failed: AtomicBool::new(false),
        }
    }

    /// Queue a batch. Once a failure latched, further pushes are dropped.
    pub fn push_batch(&self, checks: Vec<ScriptCheck>) {
        if self.failed.load(Ordering::Acquire) {
            return;
        }
        self.pending
            .lock()
            .expect("script check queue poisoned")
            .extend(checks);
    }

    /// Run everything queued; true iff every check succeeded. Resets the
    /// failure latch for the next batch.
    pub fn wait(&self) -> bool {
        let checks: Vec<ScriptCheck> = {
            let mut pending = self.pending.lock().expect("script check queue poisoned");
            std::mem::take(&mut *pending)
        };
        let failed = &self.failed;
        match &self.pool {
            Some(pool) => pool.install(|| {
                checks.par_iter().for_each(|check| {
                    if failed.load(Ordering::Relaxed) {
                        return;
                    }
                    if !check.run() {
                        failed.store(true, Ordering::Release);
                    }
                });
            }),
            None => {
                for check in &checks {
                    if failed.load(Ordering::Relaxed) {
                        break;
                    }
                    if !check.run() {
                        failed.store(true, Ordering::Release);
                    }
                }
            }
        }
        let ok = !failed.load(Ordering::Acquire);
        self.failed.store(false, Ordering::Release);
        if !ok {
            debug!("script check batch failed ({} task(s))", checks.len());
        }
        ok
    }
}

/// Bounded set of transactions known to verify under given flags.
///
/// Keys are `H(nonce ‖ wtxid ‖ flags)`; the nonce is drawn at startup so
/// entries cannot be precomputed across restarts. Eviction removes a
/// uniformly random element.
pub struct ScriptCache {
    entries: Mutex<CacheInner>,
    nonce: [u8; 32],
    capacity: usize,
}

struct CacheInner {
    order: Vec<Hash>,
    positions: HashMap<Hash, usize>,
}

impl ScriptCache {
    pub fn new(capacity: usize) -> Self {
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill(&mut nonce);
        ScriptCache {
            entries: Mutex::new(CacheInner {
                order: Vec::new(),
                positions: HashMap::new(),
            }),
            nonce,
            capacity: capacity.max(1),
        }
    }

    /// Cache key for a transaction verified under `flags`
    pub fn key(&self, wtxid: &Hash, flags: u32) -> Hash {
        let mut buf = Vec::with_capacity(32 + 32 + 4);
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(wtxid);
        buf.extend_from_slice(&flags.to_le_bytes());
        sha256(&buf)
    }

    pub fn contains(&self, key: &Hash) -> bool {
        self.entries
            .lock()
            .expect("script cache poisoned")
            .positions
            .contains_key(key)
    }

    /// Insert after a successful verification
    pub fn insert(&self, key: Hash) {
        let mut inner = self.entries.lock().expect("script cache poisoned");
        if inner.positions.contains_key(&key) {
            return;
        }
        if inner.order.len() >= self.capacity {
            let victim_idx = rand::thread_rng().gen_range(0..inner.order.len());
            let victim = inner.order.swap_remove(victim_idx);
            inner.positions.remove(&victim);
            if victim_idx < inner.order.len() {
                let moved = inner.order[victim_idx];
                inner.positions.insert(moved, victim_idx);
            }
        }
        let idx = inner.order.len();
        inner.order.push(key);
        inner.positions.insert(key, idx);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("script cache poisoned")
            .order
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
