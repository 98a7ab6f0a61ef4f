//! Consensus parameters and engine policy configuration
//!
//! [`ConsensusParams`] is injected at startup and never changes afterwards;
//! the engine holds it behind an `Arc`. [`EngineConfig`] carries node policy
//! (mempool limits, orphan pool bounds, verification threads) that may
//! differ between nodes without affecting consensus.

use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::types::{hash_from_hex, Hash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Main,
    Testnet,
    Regtest,
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" | "mainnet" => Ok(Self::Main),
            "test" | "testnet" => Ok(Self::Testnet),
            "regtest" => Ok(Self::Regtest),
            other => Err(format!("Unsupported network {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParams {
    pub network: Network,
    /// Display-order hex of the genesis block hash
    pub genesis_hash: String,
    /// Easiest permitted target, compact form
    pub pow_limit_bits: u32,
    /// Blocks between difficulty adjustments
    pub retarget_interval: u64,
    /// Target seconds between blocks
    pub target_spacing: u64,
    /// Keep the parent's target forever (regtest)
    pub no_retargeting: bool,
    pub coinbase_maturity: u64,
    pub max_block_weight: usize,
    pub max_block_sigops: usize,
    pub initial_subsidy: i64,
    pub subsidy_halving_interval: u64,
    pub median_time_span: usize,
    pub max_future_block_time: u64,
    /// Height from which the coinbase must commit to its height
    pub bip34_height: u64,
}

impl ConsensusParams {
    pub fn mainnet_like() -> Self {
        Self {
            network: Network::Main,
            genesis_hash: "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
                .to_string(),
            pow_limit_bits: 0x1d00ffff,
            retarget_interval: 2016,
            target_spacing: 600,
            no_retargeting: false,
            coinbase_maturity: 100,
            max_block_weight: 4_000_000,
            max_block_sigops: 20_000,
            initial_subsidy: 50 * crate::constants::COIN,
            subsidy_halving_interval: 210_000,
            median_time_span: 11,
            max_future_block_time: 2 * 60 * 60,
            bip34_height: 227_931,
        }
    }

    /// Local test network: trivial proof of work and a fixed target.
    ///
    /// The genesis hash is left empty; fill it in with the hash of the
    /// genesis block the caller mines (see [`crate::mining::regtest_genesis`]).
    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            genesis_hash: String::new(),
            pow_limit_bits: 0x207fffff,
            retarget_interval: 150,
            target_spacing: 600,
            no_retargeting: true,
            coinbase_maturity: 100,
            max_block_weight: 4_000_000,
            max_block_sigops: 20_000,
            initial_subsidy: 50 * crate::constants::COIN,
            subsidy_halving_interval: 150,
            median_time_span: 11,
            max_future_block_time: 2 * 60 * 60,
            bip34_height: 1,
        }
    }

    pub fn with_genesis_hash(mut self, hash: &Hash) -> Self {
        self.genesis_hash = crate::types::hash_to_hex(hash);
        self
    }

    /// Parsed genesis hash, `None` if unset or not valid hex.
    pub fn genesis(&self) -> Option<Hash> {
        hash_from_hex(&self.genesis_hash)
    }

    /// Expected seconds for one retarget window
    pub fn target_timespan(&self) -> u64 {
        self.retarget_interval * self.target_spacing
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::ConsensusError;
        if self.genesis().is_none() {
            return Err(ConsensusError::Config("genesis_hash is not a 32-byte hex hash".into()));
        }
        if self.retarget_interval == 0 || self.target_spacing == 0 {
            return Err(ConsensusError::Config("retarget schedule must be non-zero".into()));
        }
        if self.median_time_span == 0 {
            return Err(ConsensusError::Config("median_time_span must be non-zero".into()));
        }
        if self.subsidy_halving_interval == 0 {
            return Err(ConsensusError::Config(
                "subsidy_halving_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let params: Self = serde_json::from_str(json).context("parsing consensus parameters")?;
        params
            .validate()
            .map_err(|e| anyhow::anyhow!(e))
            .context("validating consensus parameters")?;
        Ok(params)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("loading {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    /// Total serialized bytes the pool may hold before evicting
    pub max_bytes: usize,
    /// Minimum fee per 1000 bytes for admission
    pub min_relay_fee_per_kb: i64,
    pub enable_rbf: bool,
    /// Extra fee per 1000 bytes a replacement must pay on top of what it evicts
    pub incremental_relay_fee_per_kb: i64,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_bytes: 300_000_000,
            min_relay_fee_per_kb: 1000,
            enable_rbf: true,
            incremental_relay_fee_per_kb: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub mempool: MempoolConfig,
    pub max_orphan_blocks: usize,
    pub orphan_expiry_secs: u64,
    /// Script verification threads; 0 lets rayon decide
    pub script_threads: usize,
    /// Check the UTXO commitment after every disconnect
    pub verify_undo_commitments: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mempool: MempoolConfig::default(),
            max_orphan_blocks: 100,
            orphan_expiry_secs: 20 * 60,
            script_threads: 0,
            verify_undo_commitments: true,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("parsing engine configuration")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_json(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_from_str() {
        assert_eq!(Network::from_str("regtest").unwrap(), Network::Regtest);
        assert_eq!(Network::from_str("mainnet").unwrap(), Network::Main);
        assert!(Network::from_str("signet").is_err());
    }

    #[test]
    fn test_params_json_roundtrip() {
        let params = ConsensusParams::mainnet_like();
        let json = serde_json::to_string(&params).unwrap();
        let parsed = ConsensusParams::from_json(&json).unwrap();
        assert_eq!(parsed, params);
        assert_eq!(parsed.target_timespan(), 14 * 24 * 60 * 60);
    }

    #[test]
    fn test_params_reject_missing_genesis() {
        let json = serde_json::to_string(&ConsensusParams::regtest()).unwrap();
        assert!(ConsensusParams::from_json(&json).is_err());
    }

    #[test]
    fn test_engine_config_defaults_fill_gaps() {
        let cfg = EngineConfig::from_json(r#"{"max_orphan_blocks": 5}"#).unwrap();
        assert_eq!(cfg.max_orphan_blocks, 5);
        assert_eq!(cfg.mempool, MempoolConfig::default());
        assert!(cfg.verify_undo_commitments);
    }
}
