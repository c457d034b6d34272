//! Plumecoin Chain State Machine
//!
//! The core of the node: it ingests candidate headers and blocks, validates
//! them against consensus rules, maintains the best chain by cumulative
//! work, and keeps the on-disk UTXO set and token state consistent with
//! that chain across reorganizations.
//!
//! The moving parts, leaves first: the [`blockindex`] arena of header
//! metadata with its candidate set; the layered [`coins`] and [`tokens`]
//! view stacks; the parallel [`scriptcheck`] engine; the [`mempool`] with
//! its [`disconnectpool`] companion; the per-block [`connect`] transition
//! producing [`undo`] records; and the [`node`] controller that owns all of
//! it behind one chain lock.

pub mod blockindex;
pub mod coins;
pub mod connect;
pub mod disconnectpool;
pub mod error;
pub mod indexing;
pub mod mempool;
pub mod node;
pub mod notifications;
pub mod scriptcheck;
pub mod tokens;
pub mod undo;

pub use blockindex::{BlockIndex, BlockStatus, CandidateKey, IndexEntry, Validity};
pub use coins::{Coin, CoinOverlay, CoinView, TipCoinCache};
pub use connect::{connect_block, disconnect_block, ConnectContext, DisconnectResult};
pub use disconnectpool::DisconnectPool;
pub use error::{ChainError, RejectInfo};
pub use mempool::{AcceptContext, AcceptOutcome, Mempool, MempoolConfig, MempoolEntry};
pub use node::{genesis_block, BlockInfo, Node, NodeConfig, MIN_BLOCKS_TO_KEEP};
pub use notifications::ChainSubscriber;
pub use scriptcheck::{CheckQueue, ScriptCache, ScriptCheck};
pub use tokens::{TipTokenCache, TokenIssuance, TokenOverlay, TokenUndo, TokenView};
pub use undo::{BlockUndo, TxUndo};
