//! Day-by-day consensus layer rewards from end-of-day balance snapshots.

use crate::types::{date_for_slot, BalanceSnapshot, RewardForDate};
use chain_clients::{gwei_to_wei, Withdrawal};

/// Balance of a validator when it becomes active.
pub const ACTIVATION_BALANCE_GWEI: u64 = 32_000_000_000;

/// Computes the reward of every day ending in one of `balances` after the first.
///
/// `balances` must start with the snapshot taken at the end of the day before the range. The
/// reward of a day is the change of balance since the previous snapshot plus everything withdrawn
/// in between.
///
/// If the validator activated after that first snapshot, the first previous balance is
/// `ACTIVATION_BALANCE_GWEI` at `activation_slot` and every snapshot before activation is
/// discarded, since it holds deposits rather than rewards. A snapshot taken exactly at
/// `activation_slot` replaces the assumed activation balance.
///
/// Snapshots and withdrawals of other validators are ignored.
pub fn daily_consensus_rewards(
    validator_index: u64,
    activation_slot: u64,
    balances: &[BalanceSnapshot],
    withdrawals: &[Withdrawal],
) -> Vec<RewardForDate> {
    let mut balances: Vec<&BalanceSnapshot> = balances
        .iter()
        .filter(|balance| balance.validator_index == validator_index)
        .collect();
    balances.sort_by_key(|balance| balance.slot);

    let Some(first) = balances.first() else {
        return vec![];
    };

    let (mut prev_slot, mut prev_balance_gwei, days) = if activation_slot > first.slot {
        let mut prev = (activation_slot, ACTIVATION_BALANCE_GWEI);
        let mut days = vec![];
        for balance in balances.into_iter().filter(|b| b.slot >= activation_slot) {
            if balance.slot == activation_slot {
                prev = (balance.slot, balance.balance_gwei);
            } else {
                days.push(balance);
            }
        }
        (prev.0, prev.1, days)
    } else {
        (first.slot, first.balance_gwei, balances[1..].to_vec())
    };

    let mut rewards = Vec::with_capacity(days.len());
    for balance in days {
        let withdrawn_gwei: u64 = withdrawals
            .iter()
            .filter(|w| {
                w.validator_index == validator_index && w.slot > prev_slot && w.slot <= balance.slot
            })
            .map(|w| w.amount_gwei)
            .sum();

        let amount_wei = gwei_to_wei(balance.balance_gwei) - gwei_to_wei(prev_balance_gwei)
            + gwei_to_wei(withdrawn_gwei);
        rewards.push(RewardForDate {
            date: date_for_slot(balance.slot),
            amount_wei,
        });

        prev_slot = balance.slot;
        prev_balance_gwei = balance.balance_gwei;
    }
    rewards
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::end_of_day_slot;
    use chain_clients::{Address, WEI_PER_GWEI};
    use chrono::NaiveDate;

    const VALIDATOR: u64 = 7;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 6, d).unwrap()
    }

    fn snapshot(slot: u64, balance_gwei: u64) -> BalanceSnapshot {
        BalanceSnapshot {
            slot,
            validator_index: VALIDATOR,
            balance_gwei,
        }
    }

    fn withdrawal(slot: u64, amount_gwei: u64) -> Withdrawal {
        Withdrawal {
            slot,
            validator_index: VALIDATOR,
            address: Address::repeat_byte(1),
            amount_gwei,
        }
    }

    #[test]
    fn balance_change_plus_withdrawals() {
        let (d1, d2) = (end_of_day_slot(day(1)), end_of_day_slot(day(2)));
        let balances = vec![snapshot(d1, 34_247_005_602), snapshot(d2, 34_249_813_825)];
        let withdrawals = vec![
            withdrawal(d1 - 5, 1_000),
            withdrawal(d1 + 100, 2_250_393_207),
            withdrawal(d2 + 1, 9_999),
        ];

        let rewards = daily_consensus_rewards(VALIDATOR, 0, &balances, &withdrawals);
        assert_eq!(
            rewards,
            vec![RewardForDate {
                date: day(2),
                amount_wei: 2_253_201_430 * WEI_PER_GWEI,
            }]
        );
    }

    #[test]
    fn snapshots_before_activation_are_discarded() {
        let slots: Vec<u64> = (1..=4).map(|d| end_of_day_slot(day(d))).collect();
        let activation = slots[1] + 50;
        // Deposits of 16 ETH and 32 ETH before activation.
        let balances = vec![
            snapshot(slots[0], 16_000_000_000),
            snapshot(slots[1], 32_000_000_000),
            snapshot(slots[2], 32_000_100_000),
            snapshot(slots[3], 32_000_150_000),
        ];

        let rewards = daily_consensus_rewards(VALIDATOR, activation, &balances, &[]);
        assert_eq!(
            rewards,
            vec![
                RewardForDate {
                    date: day(3),
                    amount_wei: 100_000 * WEI_PER_GWEI,
                },
                RewardForDate {
                    date: day(4),
                    amount_wei: 50_000 * WEI_PER_GWEI,
                },
            ]
        );
    }

    #[test]
    fn losses_are_negative() {
        let (d1, d2) = (end_of_day_slot(day(1)), end_of_day_slot(day(2)));
        let balances = vec![
            snapshot(d2, 31_999_990_000),
            snapshot(d1, 32_000_000_000),
            BalanceSnapshot {
                validator_index: VALIDATOR + 1,
                ..snapshot(d2, 1)
            },
        ];

        let rewards = daily_consensus_rewards(VALIDATOR, 0, &balances, &[]);
        assert_eq!(rewards.len(), 1);
        assert_eq!(rewards[0].amount_wei, -10_000 * WEI_PER_GWEI);
    }

    #[test]
    fn no_snapshots_no_rewards() {
        assert!(daily_consensus_rewards(VALIDATOR, 0, &[], &[]).is_empty());
    }
}
