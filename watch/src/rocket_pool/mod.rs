//! Rocket Pool minipools and the split of their rewards between node operators and the pool.

pub mod fee_distributor;
pub mod indexer;
pub mod splitter;

pub use fee_distributor::node_share_of_block_reward;
pub use indexer::RocketPoolIndexer;
pub use splitter::{operator_share, reward_share_for_withdrawal};

use chain_clients::{Address, Wei};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Collects smoothing pool rewards for all opted-in nodes. These are distributed through merkle
/// trees and never attributed to a single proposal.
pub const SMOOTHING_POOL_ADDRESS: &str = "0xd4e96ef8eee8678dbff4d535e033ed1a4f7605b7";

#[derive(Debug)]
pub enum Error {
    Client(chain_clients::Error),
    Database(crate::database::Error),
    /// An `eth_call` returned data of an unexpected shape.
    InvalidCallResult(String),
    /// A minipool's bond or fee history is inconsistent.
    InvalidMinipool(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl From<chain_clients::Error> for Error {
    fn from(e: chain_clients::Error) -> Self {
        Error::Client(e)
    }
}

impl From<crate::database::Error> for Error {
    fn from(e: crate::database::Error) -> Self {
        Error::Database(e)
    }
}

pub(crate) fn parse_constant<T: FromStr>(s: &str) -> Result<T, Error>
where
    T::Err: fmt::Debug,
{
    s.parse()
        .map_err(|e| Error::InvalidCallResult(format!("invalid constant {}: {:?}", s, e)))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RocketPoolNode {
    pub address: Address,
    /// Collects the execution layer rewards of the node's minipools.
    pub fee_distributor: Address,
}

/// A change of a minipool's node bond, effective from `timestamp`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondReduction {
    pub minipool_address: Address,
    pub timestamp: DateTime<Utc>,
    pub new_bond_wei: Wei,
    /// Fixed point, `1e18` is 100%.
    pub new_fee: Wei,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Minipool {
    pub address: Address,
    pub node_address: Address,
    pub pubkey: Option<String>,
    pub validator_index: Option<u64>,
    pub initial_bond_wei: Wei,
    /// Fixed point, `1e18` is 100%.
    pub initial_fee: Wei,
    /// Ordered by timestamp. Stores fill this in when loading a minipool and persist reductions
    /// separately from the minipool itself.
    #[serde(default)]
    pub bond_reductions: Vec<BondReduction>,
}

impl Minipool {
    /// The bond and fee in effect at `timestamp`.
    ///
    /// Reductions are scanned from the most recent to the oldest and the first one before
    /// `timestamp` applies. Without one, the initial values apply. The order in which reductions
    /// are stored does not matter.
    pub fn bond_and_fee_at(&self, timestamp: DateTime<Utc>) -> (Wei, Wei) {
        let mut reductions: Vec<&BondReduction> = self.bond_reductions.iter().collect();
        reductions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        reductions
            .into_iter()
            .find(|reduction| reduction.timestamp < timestamp)
            .map(|reduction| (reduction.new_bond_wei, reduction.new_fee))
            .unwrap_or((self.initial_bond_wei, self.initial_fee))
    }
}
