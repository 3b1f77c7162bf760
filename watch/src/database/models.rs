use crate::database::{
    error::Error,
    schema::{
        balances, block_rewards, rocket_pool_bond_reductions, rocket_pool_minipools,
        rocket_pool_nodes, withdrawals,
    },
};
use crate::rocket_pool::{BondReduction, Minipool, RocketPoolNode};
use crate::types::{BalanceSnapshot, BlockRewardRecord};
use bigdecimal::{BigDecimal, ToPrimitive};
use chain_clients::{address_to_string, Address, Wei, Withdrawal};
use chrono::{DateTime, Utc};
use diesel::{AsChangeset, Insertable, Queryable, Selectable};

pub fn wei_to_numeric(value: Wei) -> BigDecimal {
    BigDecimal::from(value)
}

pub fn numeric_to_wei(value: &BigDecimal) -> Result<Wei, Error> {
    value
        .to_i128()
        .ok_or_else(|| Error::DatabaseCorrupted(format!("{} is not a wei amount", value)))
}

pub fn parse_address(value: &str) -> Result<Address, Error> {
    value
        .parse()
        .map_err(|e| Error::DatabaseCorrupted(format!("invalid address {}: {:?}", value, e)))
}

/// Slots, indexes and gwei amounts are stored as `BIGINT`.
pub fn to_i64(value: u64) -> i64 {
    value as i64
}

pub fn to_u64(value: i64) -> Result<u64, Error> {
    u64::try_from(value).map_err(|_| Error::DatabaseCorrupted(format!("negative value {}", value)))
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = block_rewards)]
#[diesel(treat_none_as_null = true)]
pub struct WatchBlockReward {
    pub slot: i64,
    pub block_number: Option<i64>,
    pub proposer_index: Option<i64>,
    pub fee_recipient: Option<String>,
    pub priority_fees_wei: Option<BigDecimal>,
    pub block_extra_data: Option<Vec<u8>>,
    pub mev: Option<bool>,
    pub mev_reward_recipient: Option<String>,
    pub mev_reward_value_wei: Option<BigDecimal>,
    pub processed_ok: bool,
}

impl From<&BlockRewardRecord> for WatchBlockReward {
    fn from(record: &BlockRewardRecord) -> Self {
        Self {
            slot: to_i64(record.slot),
            block_number: record.block_number.map(to_i64),
            proposer_index: record.proposer_index.map(to_i64),
            fee_recipient: record.fee_recipient.as_ref().map(address_to_string),
            priority_fees_wei: record.priority_fees_wei.map(wei_to_numeric),
            block_extra_data: record.block_extra_data.clone(),
            mev: record.mev,
            mev_reward_recipient: record.mev_reward_recipient.as_ref().map(address_to_string),
            mev_reward_value_wei: record.mev_reward_value_wei.map(wei_to_numeric),
            processed_ok: record.processed_ok,
        }
    }
}

impl TryFrom<WatchBlockReward> for BlockRewardRecord {
    type Error = Error;

    fn try_from(row: WatchBlockReward) -> Result<Self, Error> {
        Ok(Self {
            slot: to_u64(row.slot)?,
            block_number: row.block_number.map(to_u64).transpose()?,
            proposer_index: row.proposer_index.map(to_u64).transpose()?,
            fee_recipient: row.fee_recipient.as_deref().map(parse_address).transpose()?,
            priority_fees_wei: row.priority_fees_wei.as_ref().map(numeric_to_wei).transpose()?,
            block_extra_data: row.block_extra_data,
            mev: row.mev,
            mev_reward_recipient: row
                .mev_reward_recipient
                .as_deref()
                .map(parse_address)
                .transpose()?,
            mev_reward_value_wei: row
                .mev_reward_value_wei
                .as_ref()
                .map(numeric_to_wei)
                .transpose()?,
            processed_ok: row.processed_ok,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = withdrawals)]
pub struct WatchWithdrawal {
    pub slot: i64,
    pub validator_index: i64,
    pub amount_gwei: i64,
    pub withdrawal_address_id: i32,
}

impl WatchWithdrawal {
    pub fn new(withdrawal: &Withdrawal, withdrawal_address_id: i32) -> Self {
        Self {
            slot: to_i64(withdrawal.slot),
            validator_index: to_i64(withdrawal.validator_index),
            amount_gwei: to_i64(withdrawal.amount_gwei),
            withdrawal_address_id,
        }
    }

    pub fn into_withdrawal(self, address: &str) -> Result<Withdrawal, Error> {
        Ok(Withdrawal {
            slot: to_u64(self.slot)?,
            validator_index: to_u64(self.validator_index)?,
            address: parse_address(address)?,
            amount_gwei: to_u64(self.amount_gwei)?,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = balances)]
pub struct WatchBalance {
    pub slot: i64,
    pub validator_index: i64,
    pub balance_gwei: i64,
}

impl From<&BalanceSnapshot> for WatchBalance {
    fn from(snapshot: &BalanceSnapshot) -> Self {
        Self {
            slot: to_i64(snapshot.slot),
            validator_index: to_i64(snapshot.validator_index),
            balance_gwei: to_i64(snapshot.balance_gwei),
        }
    }
}

impl TryFrom<WatchBalance> for BalanceSnapshot {
    type Error = Error;

    fn try_from(row: WatchBalance) -> Result<Self, Error> {
        Ok(Self {
            slot: to_u64(row.slot)?,
            validator_index: to_u64(row.validator_index)?,
            balance_gwei: to_u64(row.balance_gwei)?,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = rocket_pool_nodes)]
pub struct WatchRocketPoolNode {
    pub node_address: String,
    pub fee_distributor: String,
}

impl From<&RocketPoolNode> for WatchRocketPoolNode {
    fn from(node: &RocketPoolNode) -> Self {
        Self {
            node_address: address_to_string(&node.address),
            fee_distributor: address_to_string(&node.fee_distributor),
        }
    }
}

impl TryFrom<WatchRocketPoolNode> for RocketPoolNode {
    type Error = Error;

    fn try_from(row: WatchRocketPoolNode) -> Result<Self, Error> {
        Ok(Self {
            address: parse_address(&row.node_address)?,
            fee_distributor: parse_address(&row.fee_distributor)?,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = rocket_pool_minipools)]
#[diesel(treat_none_as_null = true)]
pub struct WatchMinipool {
    pub minipool_address: String,
    pub node_address: String,
    pub validator_pubkey: Option<String>,
    pub validator_index: Option<i64>,
    pub initial_bond_value: BigDecimal,
    pub initial_fee_value: BigDecimal,
}

impl From<&Minipool> for WatchMinipool {
    fn from(minipool: &Minipool) -> Self {
        Self {
            minipool_address: address_to_string(&minipool.address),
            node_address: address_to_string(&minipool.node_address),
            validator_pubkey: minipool.pubkey.clone(),
            validator_index: minipool.validator_index.map(to_i64),
            initial_bond_value: wei_to_numeric(minipool.initial_bond_wei),
            initial_fee_value: wei_to_numeric(minipool.initial_fee),
        }
    }
}

impl WatchMinipool {
    pub fn into_minipool(self, bond_reductions: Vec<BondReduction>) -> Result<Minipool, Error> {
        Ok(Minipool {
            address: parse_address(&self.minipool_address)?,
            node_address: parse_address(&self.node_address)?,
            pubkey: self.validator_pubkey,
            validator_index: self.validator_index.map(to_u64).transpose()?,
            initial_bond_wei: numeric_to_wei(&self.initial_bond_value)?,
            initial_fee: numeric_to_wei(&self.initial_fee_value)?,
            bond_reductions,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = rocket_pool_bond_reductions)]
pub struct WatchBondReduction {
    pub minipool_address: String,
    pub reduced_at: DateTime<Utc>,
    pub new_bond_amount: BigDecimal,
    pub new_fee: BigDecimal,
}

impl From<&BondReduction> for WatchBondReduction {
    fn from(reduction: &BondReduction) -> Self {
        Self {
            minipool_address: address_to_string(&reduction.minipool_address),
            reduced_at: reduction.timestamp,
            new_bond_amount: wei_to_numeric(reduction.new_bond_wei),
            new_fee: wei_to_numeric(reduction.new_fee),
        }
    }
}

impl TryFrom<WatchBondReduction> for BondReduction {
    type Error = Error;

    fn try_from(row: WatchBondReduction) -> Result<Self, Error> {
        Ok(Self {
            minipool_address: parse_address(&row.minipool_address)?,
            timestamp: row.reduced_at,
            new_bond_wei: numeric_to_wei(&row.new_bond_amount)?,
            new_fee: numeric_to_wei(&row.new_fee)?,
        })
    }
}
