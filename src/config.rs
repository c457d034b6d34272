//! Node Settings
//!
//! Layered configuration: built-in defaults, an optional TOML file, then
//! `PLUMECOIN_*` environment variables, with command-line flags applied
//! last by `main`.

use std::path::PathBuf;

use serde::Deserialize;

use plumecoin_chain::{MempoolConfig, NodeConfig};
use plumecoin_core::Network;

/// On-disk / environment configuration shape
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Network name: mainnet, testnet, or regtest
    pub network: String,
    /// Data directory; defaults under the home directory
    pub datadir: Option<PathBuf>,
    /// Script verification worker threads (0 = inline)
    pub script_workers: usize,
    /// Coin cache budget in megabytes
    pub coin_cache_mb: usize,
    /// Mempool budget in megabytes of virtual size
    pub mempool_mb: usize,
    /// Prune target in megabytes; 0 disables pruning
    pub prune_mb: u64,
    /// Seconds between periodic flushes in daemon mode
    pub flush_interval_secs: u64,
    /// Maintain the transaction index
    pub txindex: bool,
    /// Maintain the address and address-unspent indices
    pub addressindex: bool,
    /// Maintain the spent-outpoint index
    pub spentindex: bool,
    /// Maintain the timestamp index
    pub timestampindex: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            network: "mainnet".to_string(),
            datadir: None,
            script_workers: 4,
            coin_cache_mb: 450,
            mempool_mb: 300,
            prune_mb: 0,
            flush_interval_secs: 600,
            txindex: false,
            addressindex: false,
            spentindex: false,
            timestampindex: false,
        }
    }
}

impl Settings {
    /// Load defaults, then the optional config file, then the environment
    pub fn load(config_file: Option<&PathBuf>) -> Result<Settings, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(config::File::from(path.clone()));
        }
        builder = builder.add_source(config::Environment::with_prefix("PLUMECOIN"));
        builder.build()?.try_deserialize()
    }

    pub fn network(&self) -> Result<Network, String> {
        match self.network.as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network: {other}")),
        }
    }

    pub fn resolved_datadir(&self) -> PathBuf {
        if let Some(dir) = &self.datadir {
            return dir.clone();
        }
        let mut dir = dirs_fallback_home();
        dir.push(".plumecoin");
        if self.network != "mainnet" {
            dir.push(&self.network);
        }
        dir
    }

    /// Translate into the chain crate's node configuration
    pub fn node_config(&self) -> Result<NodeConfig, String> {
        let mut mempool = MempoolConfig::default();
        mempool.max_vbytes = self.mempool_mb * 1_000_000;
        let mut node = NodeConfig::new(self.network()?, self.resolved_datadir());
        node.script_workers = self.script_workers;
        node.coin_cache_bytes = self.coin_cache_mb * 1024 * 1024;
        node.mempool = mempool;
        node.prune_target_bytes = if self.prune_mb > 0 {
            Some(self.prune_mb * 1024 * 1024)
        } else {
            None
        };
        node.index_flags.txindex = self.txindex;
        node.index_flags.addressindex = self.addressindex;
        node.index_flags.spentindex = self.spentindex;
        node.index_flags.timestampindex = self.timestampindex;
        Ok(node)
    }
}

fn dirs_fallback_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.network().unwrap(), Network::Mainnet);
        assert!(settings.node_config().unwrap().prune_target_bytes.is_none());
    }

    #[test]
    fn test_prune_translation() {
        let settings = Settings {
            prune_mb: 100,
            ..Settings::default()
        };
        assert_eq!(
            settings.node_config().unwrap().prune_target_bytes,
            Some(100 * 1024 * 1024)
        );
    }

    #[test]
    fn test_unknown_network_rejected() {
        let settings = Settings {
            network: "moonnet".to_string(),
            ..Settings::default()
        };
        assert!(settings.network().is_err());
    }
}
