//! Measures what an address actually earned in a block.
//!
//! The raw balance delta of a fee recipient is polluted by everything else that happens to the
//! address in the same block: payouts made by distributor contracts, transactions the address
//! sends itself, beacon chain withdrawals and 1 wei spam. `BalanceReconciler` removes those
//! effects so the result can be compared with the block's priority fees.

pub mod distributors;

pub use distributors::Distributors;

use crate::builders::BuilderRegistry;
use chain_clients::{Address, BeaconClient, Error, ExecutionClient, Wei};
use log::debug;
use std::sync::Arc;

/// Only spam transfers of exactly this value are discarded.
pub const SPAM_TRANSFER_VALUE: Wei = 1;

#[derive(Clone)]
pub struct BalanceReconciler {
    beacon: Arc<dyn BeaconClient>,
    execution: Arc<dyn ExecutionClient>,
    registry: Arc<BuilderRegistry>,
    distributors: Distributors,
}

impl BalanceReconciler {
    pub fn new(
        beacon: Arc<dyn BeaconClient>,
        execution: Arc<dyn ExecutionClient>,
        registry: Arc<BuilderRegistry>,
        distributors: Distributors,
    ) -> Self {
        Self {
            beacon,
            execution,
            registry,
            distributors,
        }
    }

    /// The balance change of `address` across `block_number` (proposed in `slot`), corrected for
    /// effects unrelated to the block reward.
    ///
    /// Distributions and outgoing transactions are only added back while the delta still differs
    /// from `known_priority_fees`. This keeps the correction from double counting when the plain
    /// delta already matches.
    pub async fn adjusted_balance_delta(
        &self,
        address: Address,
        block_number: u64,
        slot: u64,
        known_priority_fees: Wei,
    ) -> Result<Wei, Error> {
        let previous_block = block_number.checked_sub(1).ok_or_else(|| {
            Error::InvalidResponse("the genesis block has no balance delta".to_string())
        })?;
        let after = self.execution.get_balance(address, block_number).await?;
        let before = self.execution.get_balance(address, previous_block).await?;
        let mut delta = after - before;

        if delta != known_priority_fees {
            let distributed = self
                .distributors
                .distributed_value(self.execution.as_ref(), address, block_number)
                .await?;
            if distributed != 0 {
                debug!(
                    "Adding back {} wei distributed by {} in block {}",
                    distributed, address, block_number
                );
            }
            delta += distributed;
        }

        let block = self.execution.get_block(block_number, true).await?;

        if delta != known_priority_fees {
            for tx in block.transactions().iter().filter(|tx| tx.from == address) {
                delta += tx.value_wei()? + self.execution.get_tx_fee(tx.hash).await?;
            }
        }

        let withdrawn: Wei = self
            .beacon
            .withdrawals_for_slot(slot)
            .await?
            .iter()
            .filter(|withdrawal| withdrawal.address == address)
            .map(|withdrawal| withdrawal.amount_wei())
            .sum();
        delta -= withdrawn;

        for tx in block.transactions() {
            if tx.to == Some(address)
                && self.registry.is_spam_sender(&tx.from)
                && tx.value_wei()? == SPAM_TRANSFER_VALUE
            {
                delta -= SPAM_TRANSFER_VALUE;
            }
        }

        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_clients::test_utils::{MockBeaconClient, MockExecutionClient, MockTransaction};
    use chain_clients::{Withdrawal, WEI_PER_GWEI};

    const BLOCK: u64 = 17_000_000;
    const SLOT: u64 = 6_200_000;

    fn fee_recipient() -> Address {
        Address::repeat_byte(0xfe)
    }

    fn reconciler(
        beacon: Arc<MockBeaconClient>,
        execution: Arc<MockExecutionClient>,
    ) -> BalanceReconciler {
        BalanceReconciler::new(
            beacon,
            execution,
            Arc::new(BuilderRegistry::mainnet().unwrap()),
            Distributors::mainnet().unwrap(),
        )
    }

    #[tokio::test]
    async fn plain_delta_matches_fees() {
        let beacon = Arc::new(MockBeaconClient::new());
        let execution = Arc::new(MockExecutionClient::new());
        execution.add_block(BLOCK, fee_recipient(), b"", 0, vec![]);
        execution.set_balance(fee_recipient(), BLOCK - 1, 1_000);
        execution.set_balance(fee_recipient(), BLOCK, 1_500);

        let delta = reconciler(beacon, execution)
            .adjusted_balance_delta(fee_recipient(), BLOCK, SLOT, 500)
            .await
            .unwrap();
        assert_eq!(delta, 500);
    }

    #[tokio::test]
    async fn outgoing_transactions_are_added_back() {
        let beacon = Arc::new(MockBeaconClient::new());
        let execution = Arc::new(MockExecutionClient::new());
        let other = Address::repeat_byte(1);
        execution.add_block(
            BLOCK,
            fee_recipient(),
            b"",
            0,
            vec![
                MockTransaction::new(other, Some(other), 5, 10),
                MockTransaction::new(fee_recipient(), Some(other), 300, 20),
            ],
        );
        execution.set_balance(fee_recipient(), BLOCK - 1, 1_000);
        // Received 500, sent 300 and paid 20 gas.
        execution.set_balance(fee_recipient(), BLOCK, 1_180);

        let delta = reconciler(beacon, execution)
            .adjusted_balance_delta(fee_recipient(), BLOCK, SLOT, 500)
            .await
            .unwrap();
        assert_eq!(delta, 500);
    }

    #[tokio::test]
    async fn withdrawals_in_the_same_slot_are_removed() {
        let beacon = Arc::new(MockBeaconClient::new());
        let execution = Arc::new(MockExecutionClient::new());
        execution.add_block(BLOCK, fee_recipient(), b"", 0, vec![]);
        beacon.add_withdrawal(Withdrawal {
            slot: SLOT,
            validator_index: 7,
            address: fee_recipient(),
            amount_gwei: 3,
        });
        // Withdrawals to other addresses or in other slots are irrelevant.
        beacon.add_withdrawal(Withdrawal {
            slot: SLOT,
            validator_index: 8,
            address: Address::repeat_byte(2),
            amount_gwei: 5,
        });
        beacon.add_withdrawal(Withdrawal {
            slot: SLOT + 1,
            validator_index: 7,
            address: fee_recipient(),
            amount_gwei: 5,
        });
        execution.set_balance(fee_recipient(), BLOCK, 3 * WEI_PER_GWEI + 500);

        let delta = reconciler(beacon, execution)
            .adjusted_balance_delta(fee_recipient(), BLOCK, SLOT, 500)
            .await
            .unwrap();
        assert_eq!(delta, 500);
    }

    #[tokio::test]
    async fn spam_transfers_are_discarded() {
        let beacon = Arc::new(MockBeaconClient::new());
        let execution = Arc::new(MockExecutionClient::new());
        let spammer: Address = "0x994e092c13aa50d312643b5caa0273317b664f5d".parse().unwrap();
        let stranger = Address::repeat_byte(3);
        execution.add_block(
            BLOCK,
            fee_recipient(),
            b"",
            0,
            vec![
                MockTransaction::new(spammer, Some(fee_recipient()), 1, 0),
                // A 1 wei transfer from an unknown sender is not spam.
                MockTransaction::new(stranger, Some(fee_recipient()), 1, 0),
            ],
        );
        execution.set_balance(fee_recipient(), BLOCK, 502);

        let delta = reconciler(beacon, execution)
            .adjusted_balance_delta(fee_recipient(), BLOCK, SLOT, 500)
            .await
            .unwrap();
        assert_eq!(delta, 501);
    }

    #[tokio::test]
    async fn block_zero_is_rejected() {
        let beacon = Arc::new(MockBeaconClient::new());
        let execution = Arc::new(MockExecutionClient::new());
        assert!(reconciler(beacon, execution)
            .adjusted_balance_delta(fee_recipient(), 0, 0, 0)
            .await
            .is_err());
    }
}
