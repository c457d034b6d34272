//! Plumecoin Node - Main Entry Point
//!
//! Parses command-line arguments, loads configuration, opens the chain
//! state machine, and either runs the daemon loop (periodic flush until
//! ctrl-c) or executes one control-surface command against the data
//! directory.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info};

use plumecoin_chain::{ChainError, Node};
use plumecoin_core::{Block, BlockHeader, Decodable, Transaction};
use plumecoin_util::hex_to_hash;

mod config;

use config::Settings;

#[derive(Parser)]
#[clap(name = "plumecoin")]
#[clap(about = "Plumecoin - a hybrid PoW/PoS cryptocurrency node with a native token layer")]
struct Cli {
    /// Sets a custom config file
    #[clap(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Network to use (mainnet, testnet, regtest)
    #[clap(long)]
    network: Option<String>,

    /// Data directory
    #[clap(long, value_name = "DIR")]
    datadir: Option<PathBuf>,

    /// Script verification worker threads (0 = inline)
    #[clap(long)]
    script_workers: Option<usize>,

    /// Prune block files down to this many megabytes (0 = keep everything)
    #[clap(long)]
    prune: Option<u64>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node until interrupted
    Run,
    /// Submit a hex-encoded block from a file (or inline hex)
    SubmitBlock { block: String },
    /// Submit a hex-encoded 80-byte header
    SubmitHeader { header: String },
    /// Submit a hex-encoded transaction to the mempool
    SubmitTx { tx: String },
    /// Print the active tip
    GetBestBlock,
    /// Mark a block invalid and reorganize away from it
    InvalidateBlock { hash: String },
    /// Clear failure flags from a block and its descendants
    ReconsiderBlock { hash: String },
    /// Prefer a block over same-work alternatives
    PreciousBlock { hash: String },
    /// Delete block files entirely below a height
    PruneToHeight { height: u64 },
    /// Verify recent blocks (level 0-4)
    VerifyChain {
        #[clap(long, default_value = "3")]
        level: u32,
        #[clap(long, default_value = "288")]
        depth: u64,
    },
    /// Write the mempool to a file
    DumpMempool { file: PathBuf },
    /// Load a previously dumped mempool
    LoadMempool { file: PathBuf },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let mut settings = match Settings::load(cli.config.as_ref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("failed to load configuration: {e}");
            return ExitCode::from(2);
        }
    };
    if let Some(network) = cli.network {
        settings.network = network;
    }
    if let Some(datadir) = cli.datadir {
        settings.datadir = Some(datadir);
    }
    if let Some(workers) = cli.script_workers {
        settings.script_workers = workers;
    }
    if let Some(prune) = cli.prune {
        settings.prune_mb = prune;
    }

    let node_config = match settings.node_config() {
        Ok(node_config) => node_config,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };
    info!(
        "starting plumecoin on {} (datadir {})",
        settings.network,
        node_config.data_dir.display()
    );

    let node = match Node::open(node_config) {
        Ok(node) => Arc::new(node),
        Err(e) => {
            error!("failed to open chain state: {e}");
            return ExitCode::from(1);
        }
    };

    let result = match cli.command {
        Command::Run => run_daemon(node, settings.flush_interval_secs),
        command => run_command(&node, command),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(ChainError::System(msg)) => {
            error!("fatal: {msg}");
            ExitCode::from(1)
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(3)
        }
    }
}

/// Daemon mode: periodic flush plus an orderly ctrl-c shutdown with a
/// forced final flush
fn run_daemon(node: Arc<Node>, flush_interval_secs: u64) -> Result<(), ChainError> {
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| ChainError::System(format!("tokio runtime: {e}")))?;
    runtime.block_on(async {
        let shutdown = node.shutdown_flag();
        let mut flush_timer =
            tokio::time::interval(std::time::Duration::from_secs(flush_interval_secs.max(1)));
        // The first tick fires immediately; skip it.
        flush_timer.tick().await;
        loop {
            tokio::select! {
                _ = flush_timer.tick() => {
                    if let Err(e) = node.flush() {
                        error!("periodic flush failed: {e}");
                        shutdown.store(true, Ordering::Release);
                        return Err(e);
                    }
                }
                result = tokio::signal::ctrl_c() => {
                    result.map_err(|e| ChainError::System(format!("signal: {e}")))?;
                    info!("shutdown requested");
                    shutdown.store(true, Ordering::Release);
                    break;
                }
            }
        }
        node.flush()
    })?;
    info!("shutdown complete");
    Ok(())
}

fn run_command(node: &Node, command: Command) -> Result<(), ChainError> {
    match command {
        Command::Run => unreachable!("handled by the caller"),
        Command::SubmitBlock { block } => {
            let raw = read_hex_arg(&block)?;
            let block = Block::from_bytes(&raw)
                .map_err(|e| ChainError::System(format!("undecodable block: {e}")))?;
            node.submit_block(&block, true)?;
            println!("{}", hex::encode(block.hash()));
            Ok(())
        }
        Command::SubmitHeader { header } => {
            let raw = read_hex_arg(&header)?;
            let header = BlockHeader::from_bytes(&raw)
                .map_err(|e| ChainError::System(format!("undecodable header: {e}")))?;
            node.submit_header(&header)?;
            println!("{}", hex::encode(header.hash()));
            Ok(())
        }
        Command::SubmitTx { tx } => {
            let raw = read_hex_arg(&tx)?;
            let tx = Transaction::from_bytes(&raw)
                .map_err(|e| ChainError::System(format!("undecodable transaction: {e}")))?;
            let outcome = node.submit_transaction(tx)?;
            println!(
                "{} fee {} vsize {}",
                hex::encode(outcome.txid),
                outcome.fee,
                outcome.vsize
            );
            Ok(())
        }
        Command::GetBestBlock => {
            match node.get_best_block() {
                Some((hash, height)) => println!("{} {}", hex::encode(hash), height),
                None => println!("no tip"),
            }
            Ok(())
        }
        Command::InvalidateBlock { hash } => {
            node.invalidate_block(&parse_hash(&hash)?)
        }
        Command::ReconsiderBlock { hash } => {
            node.reconsider_block(&parse_hash(&hash)?)
        }
        Command::PreciousBlock { hash } => {
            node.precious_block(&parse_hash(&hash)?)
        }
        Command::PruneToHeight { height } => {
            let pruned = node.prune_to_height(height)?;
            println!("pruned {} file pair(s)", pruned.len());
            Ok(())
        }
        Command::VerifyChain { level, depth } => {
            node.verify_chain(level, depth)?;
            println!("verification passed");
            Ok(())
        }
        Command::DumpMempool { file } => {
            let count = node.dump_mempool(&file)?;
            println!("dumped {count} transaction(s)");
            Ok(())
        }
        Command::LoadMempool { file } => {
            let count = node.load_mempool(&file)?;
            println!("loaded {count} transaction(s)");
            Ok(())
        }
    }
}

fn parse_hash(input: &str) -> Result<plumecoin_core::Hash, ChainError> {
    hex_to_hash(input).map_err(|e| ChainError::System(format!("bad hash argument: {e}")))
}

/// Accept either inline hex or a path to a file of hex
fn read_hex_arg(input: &str) -> Result<Vec<u8>, ChainError> {
    let text = if std::path::Path::new(input).exists() {
        std::fs::read_to_string(input)
            .map_err(|e| ChainError::System(format!("read {input}: {e}")))?
    } else {
        input.to_string()
    };
    hex::decode(text.trim()).map_err(|e| ChainError::System(format!("bad hex: {e}")))
}
