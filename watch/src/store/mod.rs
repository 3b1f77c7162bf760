//! Persistence of indexed data.
//!
//! `RewardStore` is implemented by `database::PgStore` for production and by `MemoryStore` for
//! tests and one-off runs. All slot ranges are inclusive.

mod memory;

pub use memory::MemoryStore;

use crate::database::Error;
use crate::rocket_pool::{BondReduction, Minipool, RocketPoolNode};
use crate::types::{BalanceSnapshot, BlockRewardRecord};
use chain_clients::{Address, Withdrawal};
use std::collections::HashSet;

pub trait RewardStore: Send + Sync {
    /// Inserts the record, replacing any record stored for the same slot.
    fn upsert_block_reward(&self, record: &BlockRewardRecord) -> Result<(), Error>;

    fn block_reward(&self, slot: u64) -> Result<Option<BlockRewardRecord>, Error>;

    /// Slots which have a block reward record, whether it was processed ok or not.
    fn block_reward_slots(&self, min_slot: u64, max_slot: u64) -> Result<HashSet<u64>, Error>;

    /// Records proposed by any of `proposer_indexes`, ordered by slot.
    fn block_rewards_in_range(
        &self,
        min_slot: u64,
        max_slot: u64,
        proposer_indexes: &[u64],
    ) -> Result<Vec<BlockRewardRecord>, Error>;

    /// Records whose classification failed, ordered by slot.
    fn failed_block_rewards(&self) -> Result<Vec<BlockRewardRecord>, Error>;

    /// Stores withdrawals, creating their withdrawal addresses on first sight. Withdrawals which
    /// are already stored are left unchanged.
    fn insert_withdrawals(&self, withdrawals: &[Withdrawal]) -> Result<(), Error>;

    fn withdrawals_for_validators(
        &self,
        validator_indexes: &[u64],
        min_slot: u64,
        max_slot: u64,
    ) -> Result<Vec<Withdrawal>, Error>;

    fn highest_withdrawal_slot(&self) -> Result<Option<u64>, Error>;

    fn insert_balances(&self, balances: &[BalanceSnapshot]) -> Result<(), Error>;

    /// Snapshots of `validator_indexes`, ordered by slot.
    fn balances(
        &self,
        validator_indexes: &[u64],
        min_slot: u64,
        max_slot: u64,
    ) -> Result<Vec<BalanceSnapshot>, Error>;

    /// Slots for which any balance snapshot is stored.
    fn balance_slots(&self) -> Result<HashSet<u64>, Error>;

    fn upsert_rocket_pool_node(&self, node: &RocketPoolNode) -> Result<(), Error>;

    fn rocket_pool_node(&self, address: Address) -> Result<Option<RocketPoolNode>, Error>;

    fn rocket_pool_nodes(&self) -> Result<Vec<RocketPoolNode>, Error>;

    /// Stores the minipool itself. Its `bond_reductions` are stored with
    /// `insert_bond_reduction`.
    fn upsert_minipool(&self, minipool: &Minipool) -> Result<(), Error>;

    /// All minipools with their bond reductions.
    fn minipools(&self) -> Result<Vec<Minipool>, Error>;

    fn insert_bond_reduction(&self, reduction: &BondReduction) -> Result<(), Error>;

    fn minipool_for_validator(&self, validator_index: u64) -> Result<Option<Minipool>, Error>;
}
