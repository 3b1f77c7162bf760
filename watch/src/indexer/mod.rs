//! Fills the store from the chain clients, one indexer per table.
//!
//! Each indexer levels the store against the finalized chain: a run processes whatever is missing
//! and not yet finalized slots are left for a later run.

mod balances;
mod block_rewards;
mod cursor;
mod withdrawals;

pub use balances::BalanceIndexer;
pub use block_rewards::{
    failed_record, record_for_classification, BlockRewardsIndexer, IndexingSummary,
    DEFAULT_MAX_CONCURRENT_SLOTS, START_SLOT,
};
pub use cursor::{FullReindex, SlotCursor, StoreCursor};
pub use withdrawals::{WithdrawalsIndexer, CAPELLA_START_SLOT};

use chain_clients::{BeaconClient, SLOTS_PER_EPOCH};
use std::fmt;

#[derive(Debug)]
pub enum Error {
    Client(chain_clients::Error),
    Database(crate::database::Error),
    /// A slot task panicked or was cancelled.
    Task(String),
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

/// The highest slot for which `BeaconClient::is_slot_finalized` holds.
pub async fn finalized_slot(beacon: &dyn BeaconClient) -> Result<u64, Error> {
    let epoch = beacon.finalized_epoch().await?;
    Ok(epoch.saturating_mul(SLOTS_PER_EPOCH))
}
