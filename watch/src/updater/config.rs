use crate::indexer::{FullReindex, SlotCursor, StoreCursor, DEFAULT_MAX_CONCURRENT_SLOTS, START_SLOT};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const BEACON_NODE_URL: &str = "http://localhost:5052";
pub const EXECUTION_NODE_URL: &str = "http://localhost:8545";
pub const fn update_period_seconds() -> u64 {
    60
}
pub const fn max_concurrent_slots() -> usize {
    DEFAULT_MAX_CONCURRENT_SLOTS
}
pub const fn block_rewards_start_slot() -> u64 {
    START_SLOT
}
pub const fn enabled() -> bool {
    true
}

fn beacon_node_url() -> String {
    BEACON_NODE_URL.to_string()
}

fn execution_node_url() -> String {
    EXECUTION_NODE_URL.to_string()
}

/// Which stored block rewards are classified again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reindex {
    /// Only slots without a record.
    #[default]
    None,
    /// Slots without a record and slots whose classification failed.
    Failed,
    /// Every slot.
    All,
}

impl Reindex {
    pub fn cursor(self) -> Box<dyn SlotCursor> {
        match self {
            Reindex::None => Box::new(StoreCursor {
                retry_failed: false,
            }),
            Reindex::Failed => Box::new(StoreCursor { retry_failed: true }),
            Reindex::All => Box::new(FullReindex),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "beacon_node_url")]
    pub beacon_node_url: String,
    /// Must be an archive node: balances and contract state are read at historical blocks.
    #[serde(default = "execution_node_url")]
    pub execution_node_url: String,
    /// The mainnet relays are queried if unset.
    #[serde(default)]
    pub relay_urls: Option<Vec<String>>,
    /// The bundled mainnet builder registry is used if unset.
    #[serde(default)]
    pub builder_registry_path: Option<PathBuf>,
    #[serde(default = "update_period_seconds")]
    pub update_period_seconds: u64,
    #[serde(default = "max_concurrent_slots")]
    pub max_concurrent_slots: usize,
    #[serde(default = "block_rewards_start_slot")]
    pub block_rewards_start_slot: u64,
    #[serde(default)]
    pub reindex: Reindex,
    /// Balance snapshots are limited to these validators if set.
    #[serde(default)]
    pub validator_indexes: Option<Vec<u64>>,
    #[serde(default = "enabled")]
    pub block_rewards: bool,
    #[serde(default = "enabled")]
    pub withdrawals: bool,
    #[serde(default = "enabled")]
    pub balances: bool,
    #[serde(default = "enabled")]
    pub rocket_pool: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            beacon_node_url: beacon_node_url(),
            execution_node_url: execution_node_url(),
            relay_urls: None,
            builder_registry_path: None,
            update_period_seconds: update_period_seconds(),
            max_concurrent_slots: max_concurrent_slots(),
            block_rewards_start_slot: block_rewards_start_slot(),
            reindex: Reindex::default(),
            validator_indexes: None,
            block_rewards: enabled(),
            withdrawals: enabled(),
            balances: enabled(),
            rocket_pool: enabled(),
        }
    }
}
