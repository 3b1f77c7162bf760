use super::Minipool;
use crate::types::{date_for_slot, datetime_for_slot, RewardForDate};
use chain_clients::{Wei, Withdrawal, WEI_PER_ETH};

/// The deposit backing every minipool validator.
pub const FULL_BOND_WEI: Wei = 32 * WEI_PER_ETH;
pub const FEE_DENOMINATOR: Wei = WEI_PER_ETH;
/// Withdrawals of at least this amount return the validator's principal.
pub const FULL_WITHDRAWAL_THRESHOLD_WEI: Wei = 8 * WEI_PER_ETH;

/// The node operator's share of `amount`: its bond share plus the commission `fee` on the
/// remainder.
pub fn operator_share(amount: Wei, bond_wei: Wei, fee: Wei) -> Wei {
    let bond_share = amount * bond_wei / FULL_BOND_WEI;
    bond_share + (amount - bond_share) * fee / FEE_DENOMINATOR
}

/// The node operator's reward from `withdrawal`, dated on the withdrawal's UTC day.
///
/// For a full withdrawal only the amount above the principal is a reward. If the validator ended
/// below its principal, the loss is taken from the node bond in full.
pub fn reward_share_for_withdrawal(withdrawal: &Withdrawal, minipool: &Minipool) -> RewardForDate {
    let amount = withdrawal.amount_wei();
    let (bond_wei, fee) = minipool.bond_and_fee_at(datetime_for_slot(withdrawal.slot));

    let amount_wei = if amount >= FULL_WITHDRAWAL_THRESHOLD_WEI {
        let reward = amount - FULL_BOND_WEI;
        if reward < 0 {
            reward
        } else {
            operator_share(reward, bond_wei, fee)
        }
    } else {
        operator_share(amount, bond_wei, fee)
    };

    RewardForDate {
        date: date_for_slot(withdrawal.slot),
        amount_wei,
    }
}
