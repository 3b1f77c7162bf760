use super::RewardStore;
use crate::database::Error;
use crate::rocket_pool::{BondReduction, Minipool, RocketPoolNode};
use crate::types::{BalanceSnapshot, BlockRewardRecord};
use chain_clients::{Address, Withdrawal};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Default)]
struct Tables {
    block_rewards: BTreeMap<u64, BlockRewardRecord>,
    withdrawals: BTreeMap<(u64, u64), Withdrawal>,
    balances: BTreeMap<(u64, u64), BalanceSnapshot>,
    nodes: HashMap<Address, RocketPoolNode>,
    minipools: BTreeMap<Address, Minipool>,
    bond_reductions: HashMap<Address, BTreeMap<chrono::DateTime<chrono::Utc>, BondReduction>>,
}

impl Tables {
    fn with_reductions(&self, minipool: &Minipool) -> Minipool {
        let mut minipool = minipool.clone();
        minipool.bond_reductions = self
            .bond_reductions
            .get(&minipool.address)
            .map(|reductions| reductions.values().cloned().collect())
            .unwrap_or_default();
        minipool
    }
}

/// A `RewardStore` backed by in-memory maps.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_reward_count(&self) -> usize {
        self.tables.read().block_rewards.len()
    }
}

impl RewardStore for MemoryStore {
    fn upsert_block_reward(&self, record: &BlockRewardRecord) -> Result<(), Error> {
        self.tables
            .write()
            .block_rewards
            .insert(record.slot, record.clone());
        Ok(())
    }

    fn block_reward(&self, slot: u64) -> Result<Option<BlockRewardRecord>, Error> {
        Ok(self.tables.read().block_rewards.get(&slot).cloned())
    }

    fn block_reward_slots(&self, min_slot: u64, max_slot: u64) -> Result<HashSet<u64>, Error> {
        Ok(self
            .tables
            .read()
            .block_rewards
            .range(min_slot..=max_slot)
            .map(|(slot, _)| *slot)
            .collect())
    }

    fn block_rewards_in_range(
        &self,
        min_slot: u64,
        max_slot: u64,
        proposer_indexes: &[u64],
    ) -> Result<Vec<BlockRewardRecord>, Error> {
        Ok(self
            .tables
            .read()
            .block_rewards
            .range(min_slot..=max_slot)
            .map(|(_, record)| record)
            .filter(|record| {
                record
                    .proposer_index
                    .is_some_and(|index| proposer_indexes.contains(&index))
            })
            .cloned()
            .collect())
    }

    fn failed_block_rewards(&self) -> Result<Vec<BlockRewardRecord>, Error> {
        Ok(self
            .tables
            .read()
            .block_rewards
            .values()
            .filter(|record| !record.processed_ok)
            .cloned()
            .collect())
    }

    fn insert_withdrawals(&self, withdrawals: &[Withdrawal]) -> Result<(), Error> {
        let mut tables = self.tables.write();
        for withdrawal in withdrawals {
            tables
                .withdrawals
                .entry((withdrawal.slot, withdrawal.validator_index))
                .or_insert_with(|| withdrawal.clone());
        }
        Ok(())
    }

    fn withdrawals_for_validators(
        &self,
        validator_indexes: &[u64],
        min_slot: u64,
        max_slot: u64,
    ) -> Result<Vec<Withdrawal>, Error> {
        Ok(self
            .tables
            .read()
            .withdrawals
            .range((min_slot, 0)..=(max_slot, u64::MAX))
            .map(|(_, withdrawal)| withdrawal)
            .filter(|withdrawal| validator_indexes.contains(&withdrawal.validator_index))
            .cloned()
            .collect())
    }

    fn highest_withdrawal_slot(&self) -> Result<Option<u64>, Error> {
        Ok(self
            .tables
            .read()
            .withdrawals
            .keys()
            .next_back()
            .map(|(slot, _)| *slot))
    }

    fn insert_balances(&self, balances: &[BalanceSnapshot]) -> Result<(), Error> {
        let mut tables = self.tables.write();
        for balance in balances {
            tables
                .balances
                .entry((balance.slot, balance.validator_index))
                .or_insert(*balance);
        }
        Ok(())
    }

    fn balances(
        &self,
        validator_indexes: &[u64],
        min_slot: u64,
        max_slot: u64,
    ) -> Result<Vec<BalanceSnapshot>, Error> {
        Ok(self
            .tables
            .read()
            .balances
            .range((min_slot, 0)..=(max_slot, u64::MAX))
            .map(|(_, balance)| *balance)
            .filter(|balance| validator_indexes.contains(&balance.validator_index))
            .collect())
    }

    fn balance_slots(&self) -> Result<HashSet<u64>, Error> {
        Ok(self
            .tables
            .read()
            .balances
            .keys()
            .map(|(slot, _)| *slot)
            .collect())
    }

    fn upsert_rocket_pool_node(&self, node: &RocketPoolNode) -> Result<(), Error> {
        self.tables
            .write()
            .nodes
            .insert(node.address, node.clone());
        Ok(())
    }

    fn rocket_pool_node(&self, address: Address) -> Result<Option<RocketPoolNode>, Error> {
        Ok(self.tables.read().nodes.get(&address).cloned())
    }

    fn rocket_pool_nodes(&self) -> Result<Vec<RocketPoolNode>, Error> {
        Ok(self.tables.read().nodes.values().cloned().collect())
    }

    fn upsert_minipool(&self, minipool: &Minipool) -> Result<(), Error> {
        let mut minipool = minipool.clone();
        minipool.bond_reductions.clear();
        self.tables
            .write()
            .minipools
            .insert(minipool.address, minipool);
        Ok(())
    }

    fn minipools(&self) -> Result<Vec<Minipool>, Error> {
        let tables = self.tables.read();
        Ok(tables
            .minipools
            .values()
            .map(|minipool| tables.with_reductions(minipool))
            .collect())
    }

    fn insert_bond_reduction(&self, reduction: &BondReduction) -> Result<(), Error> {
        self.tables
            .write()
            .bond_reductions
            .entry(reduction.minipool_address)
            .or_default()
            .entry(reduction.timestamp)
            .or_insert_with(|| reduction.clone());
        Ok(())
    }

    fn minipool_for_validator(&self, validator_index: u64) -> Result<Option<Minipool>, Error> {
        let tables = self.tables.read();
        Ok(tables
            .minipools
            .values()
            .find(|minipool| minipool.validator_index == Some(validator_index))
            .map(|minipool| tables.with_reductions(minipool)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_replaces_by_slot() {
        let store = MemoryStore::new();
        let mut record = BlockRewardRecord::missed(10);
        record.processed_ok = false;
        record.proposer_index = Some(3);
        store.upsert_block_reward(&record).unwrap();
        assert_eq!(store.failed_block_rewards().unwrap().len(), 1);

        record.processed_ok = true;
        store.upsert_block_reward(&record).unwrap();
        assert_eq!(store.block_reward_count(), 1);
        assert!(store.failed_block_rewards().unwrap().is_empty());
        assert_eq!(
            store.block_rewards_in_range(0, 20, &[3]).unwrap(),
            vec![record]
        );
        assert!(store.block_rewards_in_range(11, 20, &[3]).unwrap().is_empty());
    }

    #[test]
    fn withdrawals_are_append_only() {
        let store = MemoryStore::new();
        let withdrawal = Withdrawal {
            slot: 7,
            validator_index: 1,
            address: Address::repeat_byte(1),
            amount_gwei: 100,
        };
        store.insert_withdrawals(&[withdrawal.clone()]).unwrap();
        let mut changed = withdrawal.clone();
        changed.amount_gwei = 5;
        store.insert_withdrawals(&[changed]).unwrap();

        assert_eq!(
            store.withdrawals_for_validators(&[1], 7, 7).unwrap(),
            vec![withdrawal]
        );
        assert_eq!(store.highest_withdrawal_slot().unwrap(), Some(7));
        assert!(store.withdrawals_for_validators(&[2], 0, 10).unwrap().is_empty());
    }
}
